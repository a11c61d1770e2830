//! Unique ID generator.
//!
//! Provides identifiers for backend jobs and requests.

use uuid::Uuid;

/// Generates unique identifiers for backend requests.
pub struct IdGenerator;

impl IdGenerator {
    /// Generates a BigQuery job ID.
    ///
    /// Job IDs may only contain letters, digits, `_` and `-`.
    pub fn job_id() -> String {
        format!("query_router_{}", Uuid::new_v4().simple())
    }

    /// Generates a unique request ID.
    pub fn request_id() -> String {
        Uuid::new_v4().to_string()
    }
}
