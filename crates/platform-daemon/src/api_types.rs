//! Request and response types for `platform-daemon` HTTP endpoints.
//!
//! `Serialize + Deserialize` only — no business logic lives here, matching
//! the teacher's `mqk-daemon::api_types` split.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
