//! Identifiers for templates, instances and the records hanging off them

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Maximum length for template IDs
pub const MAX_TEMPLATE_ID_LENGTH: usize = 50;

/// Template IDs: alphanumeric and hyphens, starting and ending alphanumeric
static TEMPLATE_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]$|^[a-zA-Z0-9]$").unwrap());

/// Generated IDs: {prefix}-{uuid}
static GENERATED_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z]{2,4}-[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$")
        .unwrap()
});

/// Validated process template identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TemplateId(String);

impl TemplateId {
    pub fn new(id: impl Into<String>) -> Result<Self, EngineError> {
        let id = id.into();

        if id.is_empty() {
            return Err(EngineError::validation("Template ID cannot be empty"));
        }

        if id.len() > MAX_TEMPLATE_ID_LENGTH {
            return Err(EngineError::validation(format!(
                "Template ID exceeds maximum length of {} characters",
                MAX_TEMPLATE_ID_LENGTH
            )));
        }

        if !TEMPLATE_ID_PATTERN.is_match(&id) {
            return Err(EngineError::validation(format!(
                "Invalid template ID '{}': must be alphanumeric with hyphens",
                id
            )));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TemplateId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TemplateId> for String {
    fn from(id: TemplateId) -> Self {
        id.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declares a generated, prefix-tagged identifier type
macro_rules! generated_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Parse and validate an existing identifier
            pub fn new(id: impl Into<String>) -> Result<Self, EngineError> {
                let id = id.into();
                if !GENERATED_ID_PATTERN.is_match(&id) || !id.starts_with(concat!($prefix, "-")) {
                    return Err(EngineError::validation(format!(
                        "Invalid {} '{}': expected {}-<uuid>",
                        stringify!($name),
                        id,
                        $prefix
                    )));
                }
                Ok(Self(id))
            }

            /// Generate a fresh identifier
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = EngineError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

generated_id!(
    /// Running process instance identifier
    InstanceId,
    "inst"
);
generated_id!(
    /// Work (node occurrence) identifier
    WorkId,
    "wk"
);
generated_id!(
    /// Per-participant task identifier
    TaskId,
    "tk"
);
generated_id!(
    /// Pending timed re-entry identifier
    DelayId,
    "dly"
);
generated_id!(
    /// Pending external callback identifier
    CallbackId,
    "cb"
);
generated_id!(
    /// Fan-out sibling group identifier
    ParallelGroupId,
    "pg"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_id_valid() {
        assert!(TemplateId::new("leave-request").is_ok());
        assert!(TemplateId::new("a").is_ok());
        assert!(TemplateId::new("purchase2").is_ok());
    }

    #[test]
    fn test_template_id_invalid() {
        assert!(TemplateId::new("").is_err());
        assert!(TemplateId::new("-leading").is_err());
        assert!(TemplateId::new("has space").is_err());
        assert!(TemplateId::new("a".repeat(51)).is_err());
    }

    #[test]
    fn test_generated_ids_round_trip() {
        let id = InstanceId::generate();
        assert!(id.as_str().starts_with("inst-"));
        assert_eq!(InstanceId::new(id.as_str()).unwrap(), id);

        let work = WorkId::generate();
        assert!(work.as_str().starts_with("wk-"));
    }

    #[test]
    fn test_generated_id_rejects_wrong_prefix() {
        let work = WorkId::generate();
        assert!(TaskId::new(work.as_str()).is_err());
        assert!(InstanceId::new("inst-not-a-uuid").is_err());
    }

    #[test]
    fn test_id_serialization() {
        let id = TaskId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);

        assert!(serde_json::from_str::<TaskId>("\"bogus\"").is_err());
    }
}
