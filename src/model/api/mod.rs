//! API-compatible types.
//!
//! The types in this module are (de)serialised as the JSON bodies of the
//! HTTP endpoints.

use serde::{Deserialize, Serialize};

pub mod participant;
pub mod payment;
pub mod tally;
pub mod vote;

/// Bare acknowledgement of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}
