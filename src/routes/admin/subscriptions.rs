use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ErrorResponse, SuccessResponse, store_error};
use crate::AppState;
use crate::store::{Subscription, SubscriptionStatus};

// --- Types ---

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub account_id: String,
    pub plan_id: String,
    /// Epoch ms; omit for a subscription without a fixed end
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub amount_paid_cents: i64,
}

#[derive(Deserialize, ToSchema)]
pub struct ListSubscriptionsQuery {
    pub account_id: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ListSubscriptionsResponse {
    pub subscriptions: Vec<Subscription>,
}

#[derive(Serialize, ToSchema)]
pub struct ResetCycleResponse {
    /// False when the cycle was already reset for the current billing month
    pub reset: bool,
}

// --- Handlers ---

/// Subscribe an account to a plan. An account holds at most one active
/// subscription.
#[utoipa::path(
    post,
    path = "/subscriptions",
    tag = "subscriptions",
    request_body = CreateSubscriptionRequest,
    responses(
        (status = 200, body = Subscription),
        (status = 404, body = ErrorResponse),
        (status = 409, body = ErrorResponse),
    )
)]
pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> Result<Json<Subscription>, (StatusCode, Json<ErrorResponse>)> {
    state
        .subscriptions
        .create(
            &body.account_id,
            &body.plan_id,
            body.expires_at,
            body.amount_paid_cents,
            state.engine.now_ms(),
        )
        .await
        .map(Json)
        .map_err(store_error)
}

/// List subscriptions, optionally for one account
#[utoipa::path(
    get,
    path = "/subscriptions",
    tag = "subscriptions",
    params(("account_id" = Option<String>, Query, description = "Filter by account")),
    responses(
        (status = 200, body = ListSubscriptionsResponse),
    )
)]
pub async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSubscriptionsQuery>,
) -> Result<Json<ListSubscriptionsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let subscriptions = state
        .subscriptions
        .list(query.account_id.as_deref())
        .await
        .map_err(store_error)?;
    Ok(Json(ListSubscriptionsResponse { subscriptions }))
}

async fn set_status(
    state: &AppState,
    id: &str,
    status: SubscriptionStatus,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let updated = state
        .subscriptions
        .set_status(id, status)
        .await
        .map_err(|e| {
            // Re-activating can collide with another active subscription
            if e.to_string().contains("UNIQUE") {
                (
                    StatusCode::CONFLICT,
                    Json(ErrorResponse {
                        error: "Account already has an active subscription".to_string(),
                    }),
                )
            } else {
                store_error(e)
            }
        })?;
    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Subscription not found".to_string(),
            }),
        ));
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// Cancel a subscription. Usage history and summaries are kept.
#[utoipa::path(
    post,
    path = "/subscriptions/{id}/cancel",
    tag = "subscriptions",
    params(("id" = String, Path, description = "Subscription ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    set_status(&state, &id, SubscriptionStatus::Cancelled).await
}

/// Suspend a subscription (e.g. payment failure); requests deny until resumed
#[utoipa::path(
    post,
    path = "/subscriptions/{id}/suspend",
    tag = "subscriptions",
    params(("id" = String, Path, description = "Subscription ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn suspend_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    set_status(&state, &id, SubscriptionStatus::Suspended).await
}

/// Resume a suspended subscription
#[utoipa::path(
    post,
    path = "/subscriptions/{id}/resume",
    tag = "subscriptions",
    params(("id" = String, Path, description = "Subscription ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
        (status = 409, body = ErrorResponse),
    )
)]
pub async fn resume_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    set_status(&state, &id, SubscriptionStatus::Active).await
}

/// Zero the monthly usage counter at a billing boundary. Safe to call
/// repeatedly; only the first call in a billing month resets.
#[utoipa::path(
    post,
    path = "/subscriptions/{id}/reset-cycle",
    tag = "subscriptions",
    params(("id" = String, Path, description = "Subscription ID")),
    responses(
        (status = 200, body = ResetCycleResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn reset_subscription_cycle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ResetCycleResponse>, (StatusCode, Json<ErrorResponse>)> {
    let reset = state
        .engine
        .reset_cycle(&id, state.engine.now_ms())
        .await
        .map_err(store_error)?;
    Ok(Json(ResetCycleResponse { reset }))
}
