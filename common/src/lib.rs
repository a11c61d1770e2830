//! Shared building blocks for the query router.
//!
//! - [`models`]: credentials, data-source configuration and query contracts
//! - [`errors`]: the crate-wide error type
//! - [`config`]: router settings loaded from the environment
//! - [`logging`]: tracing subscriber setup
//! - [`utils`]: SQL statement classification and id generation

pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod utils;
