//! Core domain types for the pages builder.
//!
//! Identifiers and run statuses shared by the coordinator, the pipeline
//! runner and the persistence layer.

pub mod ids;
pub mod status;

pub use ids::{DeliveryId, InvalidRepoKey, RepoKey, RunId};
pub use status::{FailureKind, RunStatus};
