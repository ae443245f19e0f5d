//! DB-compatible (e.g. de/serialisable) types and the store operations on them.
//!
//! The types in this module are serialised in an DB-friendly way, e.g.:
//!
//! - IDs and datetimes are serialised in MongoDB's own format.

pub mod participant;
pub mod settlement;
pub mod vote;
