use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Enrolled subject identifier. Also used as a directory name by the file
/// repository, so path separators and control characters are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, EngineError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("identity must not be empty".into()));
        }
        if trimmed.len() > 128 {
            return Err(EngineError::Validation(format!(
                "identity '{trimmed}' exceeds 128 characters"
            )));
        }
        if trimmed == "." || trimmed == ".." || trimmed.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
            return Err(EngineError::Validation(format!(
                "identity '{trimmed}' contains forbidden characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdentityId {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdentityId> for String {
    fn from(id: IdentityId) -> Self {
        id.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
