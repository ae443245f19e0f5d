use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    model::common::identity::Identity,
};

/// A request to cast a two-round vote.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub identity: Option<String>,
    pub first_choice: Option<String>,
    pub second_choice: Option<String>,
}

impl VoteRequest {
    /// Validate the request, splitting it into who is voting and what for.
    pub fn validate(self) -> Result<(Identity, Selections)> {
        let identity = Identity::parse(self.identity)?;
        let selections = Selections::new(self.first_choice, self.second_choice)?;
        Ok((identity, selections))
    }
}

/// The two ranked choices of a vote. Opaque labels: they are not checked
/// against any candidate list, only required to be non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selections {
    first: String,
    second: String,
}

impl Selections {
    pub fn new(first: Option<String>, second: Option<String>) -> Result<Self> {
        let first = non_empty(first, "firstChoice")?;
        let second = non_empty(second, "secondChoice")?;
        Ok(Self { first, second })
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::BadRequest(format!("{field} is required"))),
    }
}
