use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ErrorResponse, SuccessResponse, bad_request, store_error, validate_name};
use crate::AppState;
use crate::store::Plan;

// --- Types ---

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub name: String,
    #[serde(default)]
    pub price_cents: i64,
    /// Omit for an unlimited monthly quota
    pub monthly_request_limit: Option<u64>,
    pub concurrent_limit: u64,
    pub rate_limit_per_minute: u64,
    #[serde(default)]
    pub features: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlanRequest {
    pub price_cents: Option<i64>,
    pub monthly_request_limit: Option<u64>,
    /// Set true to clear the monthly quota (unlimited); wins over
    /// `monthlyRequestLimit`
    #[serde(default)]
    pub unlimited_monthly: bool,
    pub concurrent_limit: Option<u64>,
    pub rate_limit_per_minute: Option<u64>,
    pub enabled: Option<bool>,
}

#[derive(Serialize, ToSchema)]
pub struct ListPlansResponse {
    pub plans: Vec<Plan>,
}

#[derive(Deserialize, Serialize, ToSchema)]
pub struct ReorderPlansRequest {
    pub ids: Vec<String>,
}

// --- Handlers ---

/// Create a plan
#[utoipa::path(
    post,
    path = "/plans",
    tag = "plans",
    request_body = CreatePlanRequest,
    responses(
        (status = 200, body = Plan),
        (status = 400, body = ErrorResponse),
        (status = 409, body = ErrorResponse),
    )
)]
pub async fn create_plan(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePlanRequest>,
) -> Result<Json<Plan>, (StatusCode, Json<ErrorResponse>)> {
    if let Err(e) = validate_name(&body.name, "Plan") {
        return Err(bad_request(&e));
    }
    if body.rate_limit_per_minute == 0 {
        return Err(bad_request("Per-minute rate limit must be positive"));
    }

    state
        .plans
        .create(
            body.name.trim(),
            body.price_cents,
            body.monthly_request_limit,
            body.concurrent_limit,
            body.rate_limit_per_minute,
            body.features,
        )
        .await
        .map(Json)
        .map_err(store_error)
}

/// List all plans in display order
#[utoipa::path(
    get,
    path = "/plans",
    tag = "plans",
    responses(
        (status = 200, body = ListPlansResponse),
    )
)]
pub async fn list_plans(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListPlansResponse>, (StatusCode, Json<ErrorResponse>)> {
    let plans = state.plans.list().await.map_err(store_error)?;
    Ok(Json(ListPlansResponse { plans }))
}

/// Update plan pricing or limits. Limit changes apply to future requests;
/// already-consumed usage is never rewritten.
#[utoipa::path(
    patch,
    path = "/plans/{id}",
    tag = "plans",
    params(("id" = String, Path, description = "Plan ID")),
    request_body = UpdatePlanRequest,
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn update_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdatePlanRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let monthly = if body.unlimited_monthly {
        Some(None)
    } else {
        body.monthly_request_limit.map(Some)
    };

    let updated = state
        .plans
        .update(
            &id,
            body.price_cents,
            monthly,
            body.concurrent_limit,
            body.rate_limit_per_minute,
            body.enabled,
        )
        .await
        .map_err(store_error)?;

    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Plan not found".to_string(),
            }),
        ));
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// Delete a plan. Refused while any subscription references it.
#[utoipa::path(
    delete,
    path = "/plans/{id}",
    tag = "plans",
    params(("id" = String, Path, description = "Plan ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
        (status = 409, body = ErrorResponse),
    )
)]
pub async fn delete_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let deleted = state.plans.delete(&id).await.map_err(store_error)?;
    if !deleted {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Plan not found".to_string(),
            }),
        ));
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// Reorder plans for display
#[utoipa::path(
    post,
    path = "/plans/reorder",
    tag = "plans",
    request_body = ReorderPlansRequest,
    responses(
        (status = 200, body = SuccessResponse),
    )
)]
pub async fn reorder_plans(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReorderPlansRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    state.plans.reorder(body.ids).await.map_err(store_error)?;
    Ok(Json(SuccessResponse { success: true }))
}
