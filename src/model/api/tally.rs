use serde::{Deserialize, Serialize};

/// Number of votes naming `choice` as their first-round selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChoiceTotal {
    pub choice: String,
    pub total: u64,
}

impl ChoiceTotal {
    pub fn new(choice: impl Into<String>, total: u64) -> Self {
        Self {
            choice: choice.into(),
            total,
        }
    }
}
