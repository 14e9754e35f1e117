mod keys;
mod plans;
mod subscriptions;
mod usage;

// Glob re-exports so utoipa's `routes!()` macro can find the hidden `__path_*` structs
// alongside the handler functions at the `crate::routes::admin::*` path.
pub use keys::*;
pub use plans::*;
pub use subscriptions::*;
pub use usage::*;

use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::GateError;

// --- Shared response types ---

#[derive(Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub(super) fn store_error(e: GateError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        GateError::NotFound(_) => StatusCode::NOT_FOUND,
        GateError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

pub(super) fn bad_request(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}

// --- Validation helpers ---

const MAX_NAME_LENGTH: usize = 100;

pub(super) fn validate_name(name: &str, what: &str) -> Result<(), String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("{what} name cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!("{what} name too long (max {MAX_NAME_LENGTH} characters)"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(format!("{what} name cannot contain control characters"));
    }
    Ok(())
}
