use serde::{Deserialize, Serialize};

use crate::{error::Result, model::common::identity::Identity};

/// A request body carrying only the participant's raw identity.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IdentityRequest {
    pub identity: Option<String>,
}

impl IdentityRequest {
    /// Validate the submitted identity.
    pub fn identity(self) -> Result<Identity> {
        Identity::parse(self.identity)
    }
}

/// Where a participant stands. Unregistered identities report both flags as false.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ParticipantStatus {
    pub paid: bool,
    pub voted: bool,
}
