//! Vote functions for multi-participant ACTION nodes
//!
//! Ballots are evaluated in completion order; `None` is a participant who
//! has not decided yet. An evaluation either yields a decision or
//! [`VoteOutcome::Waiting`] while consensus cannot be determined.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::EngineError;

/// Sentinel reported while consensus is still open
pub const WAITING: &str = "WAITING";

/// `name(arg, arg, ...)` or bare `name`
static CALL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z]+)\s*(?:\((.*)\))?\s*$").unwrap());

/// Parsed vote function
#[derive(Debug, Clone, PartialEq)]
pub enum VoteRule {
    Last,
    Most,
    Least,
    AllOrFailto(String),
    PercentOrFailto {
        value: String,
        percent: f64,
        fail: String,
    },
    IfAny(String),
    IfAnyThenMost(String),
    IfAnyThenLeast(String),
    IfAnyThenFailto {
        value: String,
        fail: String,
    },
}

/// Result of evaluating a vote rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Decided(String),
    Waiting,
}

impl VoteOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Decided(decision) => decision,
            Self::Waiting => WAITING,
        }
    }
}

impl fmt::Display for VoteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteRule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = CALL_PATTERN
            .captures(s)
            .ok_or_else(|| EngineError::validation(format!("Invalid vote function '{}'", s)))?;

        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let args: Vec<String> = caps
            .get(2)
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(|a| a.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let arity = |n: usize| -> Result<(), EngineError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(EngineError::validation(format!(
                    "Vote function '{}' expects {} argument(s), got {}",
                    name,
                    n,
                    args.len()
                )))
            }
        };

        let rule = match name {
            "last" => {
                arity(0)?;
                Self::Last
            }
            "most" => {
                arity(0)?;
                Self::Most
            }
            "least" => {
                arity(0)?;
                Self::Least
            }
            "allOrFailto" => {
                arity(1)?;
                Self::AllOrFailto(args[0].clone())
            }
            "percentOrFailto" => {
                arity(3)?;
                let percent = args[1].trim_end_matches('%').parse::<f64>().map_err(|_| {
                    EngineError::validation(format!("Invalid percentage '{}'", args[1]))
                })?;
                Self::PercentOrFailto {
                    value: args[0].clone(),
                    percent,
                    fail: args[2].clone(),
                }
            }
            "ifAny" => {
                arity(1)?;
                Self::IfAny(args[0].clone())
            }
            "ifAnyThenMost" => {
                arity(1)?;
                Self::IfAnyThenMost(args[0].clone())
            }
            "ifAnyThenLeast" => {
                arity(1)?;
                Self::IfAnyThenLeast(args[0].clone())
            }
            "ifAnyThenFailto" => {
                arity(2)?;
                Self::IfAnyThenFailto {
                    value: args[0].clone(),
                    fail: args[1].clone(),
                }
            }
            other => {
                return Err(EngineError::validation(format!(
                    "Unknown vote function '{}'",
                    other
                )));
            }
        };

        Ok(rule)
    }
}

impl VoteRule {
    /// Evaluate against ballots in completion order
    pub fn evaluate(&self, ballots: &[Option<&str>]) -> VoteOutcome {
        let cast: Vec<&str> = ballots.iter().flatten().copied().collect();
        let all_voted = !ballots.is_empty() && cast.len() == ballots.len();

        match self {
            Self::Last => when_all(all_voted, || cast.last().map(|d| d.to_string())),
            Self::Most => when_all(all_voted, || modal(&cast, Extreme::Most)),
            Self::Least => when_all(all_voted, || modal(&cast, Extreme::Least)),
            Self::AllOrFailto(fail) => when_all(all_voted, || {
                let first = cast.first()?;
                if cast.iter().all(|d| d == first) {
                    Some(first.to_string())
                } else {
                    Some(fail.clone())
                }
            }),
            Self::PercentOrFailto {
                value,
                percent,
                fail,
            } => when_all(all_voted, || {
                let hits = cast.iter().filter(|d| **d == value.as_str()).count() as f64;
                let share = hits * 100.0 / cast.len() as f64;
                if share >= *percent {
                    Some(value.clone())
                } else {
                    Some(fail.clone())
                }
            }),
            Self::IfAny(value) => if_any(&cast, value)
                .unwrap_or_else(|| when_all(all_voted, || cast.last().map(|d| d.to_string()))),
            Self::IfAnyThenMost(value) => if_any(&cast, value)
                .unwrap_or_else(|| when_all(all_voted, || modal(&cast, Extreme::Most))),
            Self::IfAnyThenLeast(value) => if_any(&cast, value)
                .unwrap_or_else(|| when_all(all_voted, || modal(&cast, Extreme::Least))),
            Self::IfAnyThenFailto { value, fail } => if_any(&cast, value)
                .unwrap_or_else(|| when_all(all_voted, || Some(fail.clone()))),
        }
    }
}

fn when_all(all_voted: bool, decide: impl FnOnce() -> Option<String>) -> VoteOutcome {
    if !all_voted {
        return VoteOutcome::Waiting;
    }
    decide().map_or(VoteOutcome::Waiting, VoteOutcome::Decided)
}

fn if_any(cast: &[&str], value: &str) -> Option<VoteOutcome> {
    cast.iter()
        .any(|d| *d == value)
        .then(|| VoteOutcome::Decided(value.to_string()))
}

#[derive(Clone, Copy)]
enum Extreme {
    Most,
    Least,
}

/// Most or least frequent decision; ties go to the one cast first
fn modal(cast: &[&str], extreme: Extreme) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for &decision in cast {
        let count = counts.entry(decision).or_insert(0);
        if *count == 0 {
            order.push(decision);
        }
        *count += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for decision in order {
        let count = counts[decision];
        let better = match (best, extreme) {
            (None, _) => true,
            (Some((_, b)), Extreme::Most) => count > b,
            (Some((_, b)), Extreme::Least) => count < b,
        };
        if better {
            best = Some((decision, count));
        }
    }
    best.map(|(d, _)| d.to_string())
}
