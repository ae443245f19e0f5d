//! Types shared between the API and DB layers.

pub mod eligibility;
pub mod identity;
