use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ErrorResponse, SuccessResponse, bad_request, store_error, validate_name};
use crate::AppState;
use crate::quota::{DenyReason, UsageSnapshot};
use crate::store::{Credential, KeyLimits};

// --- Types ---

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub account_id: String,
    pub name: String,
    /// Epoch ms; omit for a key that never expires
    pub expires_at: Option<u64>,
    /// Override of the plan's per-minute limit
    pub rate_limit_per_minute: Option<u64>,
    /// Per-day cap; omit for no daily cap
    pub rate_limit_per_day: Option<u64>,
    /// Origins allowed to use this key; empty = all
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyResponse {
    pub id: String,
    /// Full API key, shown exactly once
    pub key: String,
    pub credential: Credential,
}

#[derive(Deserialize, ToSchema)]
pub struct ListKeysQuery {
    pub account_id: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ListKeysResponse {
    pub keys: Vec<Credential>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SetKeyEnabledRequest {
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKeyLimitsRequest {
    pub rate_limit_per_minute: Option<u64>,
    pub rate_limit_per_day: Option<u64>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct SetKeyOriginsRequest {
    pub origins: Vec<String>,
}

// --- Handlers ---

/// Create an API key for an account. The raw key is not recoverable later.
#[utoipa::path(
    post,
    path = "/keys",
    tag = "keys",
    request_body = CreateKeyRequest,
    responses(
        (status = 200, body = CreateKeyResponse),
        (status = 400, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Json<CreateKeyResponse>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(e) = validate_name(&body.name, "Key") {
        return Err(bad_request(&e));
    }
    if body.account_id.trim().is_empty() {
        return Err(bad_request("Account ID cannot be empty"));
    }

    let limits = KeyLimits {
        rate_limit_per_minute: body.rate_limit_per_minute,
        rate_limit_per_day: body.rate_limit_per_day,
    };

    let (credential, key) = state
        .credentials
        .create(
            body.account_id.trim(),
            body.name.trim(),
            body.expires_at,
            limits,
            body.allowed_origins,
            state.engine.now_ms(),
        )
        .await
        .map_err(store_error)?;

    Ok(Json(CreateKeyResponse {
        id: credential.id.clone(),
        key,
        credential,
    }))
}

/// List API keys, optionally for one account
#[utoipa::path(
    get,
    path = "/keys",
    tag = "keys",
    params(("account_id" = Option<String>, Query, description = "Filter by account")),
    responses(
        (status = 200, body = ListKeysResponse),
    )
)]
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListKeysQuery>,
) -> Result<Json<ListKeysResponse>, (StatusCode, Json<ErrorResponse>)> {
    let keys = state
        .credentials
        .list(query.account_id.as_deref())
        .await
        .map_err(store_error)?;
    Ok(Json(ListKeysResponse { keys }))
}

/// Delete an API key and its day counters
#[utoipa::path(
    delete,
    path = "/keys/{id}",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let deleted = state.credentials.delete(&id).await.map_err(store_error)?;
    if !deleted {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Key not found".to_string(),
            }),
        ));
    }
    state.engine.forget_inflight(&id);
    Ok(Json(SuccessResponse { success: true }))
}

/// Revoke or re-enable a key without deleting its history
#[utoipa::path(
    put,
    path = "/keys/{id}/enabled",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    request_body = SetKeyEnabledRequest,
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn set_key_enabled(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetKeyEnabledRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let updated = state
        .credentials
        .set_enabled(&id, body.enabled)
        .await
        .map_err(store_error)?;
    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Key not found".to_string(),
            }),
        ));
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// Set or clear per-key rate-limit overrides
#[utoipa::path(
    put,
    path = "/keys/{id}/limits",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    request_body = UpdateKeyLimitsRequest,
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn update_key_limits(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateKeyLimitsRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let limits = KeyLimits {
        rate_limit_per_minute: body.rate_limit_per_minute,
        rate_limit_per_day: body.rate_limit_per_day,
    };
    let updated = state
        .credentials
        .set_limits(&id, limits)
        .await
        .map_err(store_error)?;
    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Key not found".to_string(),
            }),
        ));
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// Replace a key's origin allow-list
#[utoipa::path(
    put,
    path = "/keys/{id}/origins",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    request_body = SetKeyOriginsRequest,
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn set_key_origins(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SetKeyOriginsRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let updated = state
        .credentials
        .set_allowed_origins(&id, body.origins)
        .await
        .map_err(store_error)?;
    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Key not found".to_string(),
            }),
        ));
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// Current minute/day/month consumption for a key
#[utoipa::path(
    get,
    path = "/keys/{id}/usage",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    responses(
        (status = 200, body = UsageSnapshot),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn get_key_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UsageSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    match state.engine.current_usage(&id).await {
        Ok(snap) => Ok(Json(snap)),
        Err(DenyReason::InternalError) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Usage lookup failed".to_string(),
            }),
        )),
        Err(reason) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Key unavailable: {reason}"),
            }),
        )),
    }
}
