//! Pages Builder - builds static sites on push and publishes them to a pages branch.
//!
//! A push to the publishing-source branch of a registered repository starts a
//! run: fetch, build, commit the output as a single parentless commit,
//! delete the remote publish branch, and push the new one in its place. At
//! most one run per repository is active; a newer push stops the older run
//! at its next checkpoint.

pub mod config;
pub mod coordinator;
pub mod git;
pub mod pipeline;
pub mod server;
pub mod services;
pub mod types;
pub mod webhooks;

#[cfg(test)]
pub mod test_utils;
