//! Participant resolution from comma-separated role expressions
//!
//! Supported tokens: `starter`, `$variable` (string or array of strings),
//! `team:<name>` (configured team membership); anything else is taken as a
//! literal participant id.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::process::{EngineError, ParticipantResolver, ResolveContext};

#[derive(Debug, Clone, Default)]
pub struct ExpressionParticipantResolver {
    teams: HashMap<String, Vec<String>>,
}

impl ExpressionParticipantResolver {
    pub fn new(teams: HashMap<String, Vec<String>>) -> Self {
        Self { teams }
    }

    fn expand(&self, token: &str, context: &ResolveContext) -> Vec<String> {
        if token == "starter" {
            return vec![context.starter.clone()];
        }

        if let Some(name) = token.strip_prefix('$') {
            return match context.variables.get(name) {
                Some(Value::String(id)) => vec![id.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            };
        }

        if let Some(team) = token.strip_prefix("team:") {
            return self.teams.get(team).cloned().unwrap_or_default();
        }

        vec![token.to_string()]
    }
}

#[async_trait]
impl ParticipantResolver for ExpressionParticipantResolver {
    async fn resolve(
        &self,
        expression: &str,
        context: &ResolveContext,
    ) -> Result<Vec<String>, EngineError> {
        let mut participants: Vec<String> = Vec::new();

        for token in expression.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            for participant in self.expand(token, context) {
                if !participant.is_empty() && !participants.contains(&participant) {
                    participants.push(participant);
                }
            }
        }

        debug!(
            instance_id = %context.instance_id,
            expression = %expression,
            resolved = participants.len(),
            "Resolved participants"
        );
        Ok(participants)
    }
}
