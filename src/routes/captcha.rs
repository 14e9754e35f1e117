use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::quota::{Admit, DenyReason, UsageSnapshot};
use crate::store::{ConsumeOutcome, Credential};

const CHALLENGE_TYPES: &[&str] = &["image_grid", "slider", "text", "audio"];

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, code: &str) -> ApiError {
    (status, Json(json!({ "error": code })))
}

fn deny_status(reason: DenyReason) -> StatusCode {
    match reason {
        DenyReason::RateMinuteExceeded
        | DenyReason::RateDayExceeded
        | DenyReason::ConcurrencyExceeded => StatusCode::TOO_MANY_REQUESTS,
        DenyReason::QuotaMonthExceeded | DenyReason::NoActiveSubscription => {
            StatusCode::PAYMENT_REQUIRED
        }
        DenyReason::CredentialInactive | DenyReason::CredentialExpired => StatusCode::UNAUTHORIZED,
        DenyReason::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn refusal(reason: DenyReason) -> ApiError {
    api_error(deny_status(reason), reason.as_str())
}

/// Raw API key from `Authorization: Bearer ...` or `x-api-key`
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(key) = auth.strip_prefix("Bearer ")
    {
        return Some(key.trim().to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Resolve the calling credential and enforce its origin allow-list.
/// Disabled and expired keys pass through here; the quota engine turns
/// their state into a precise refusal.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Credential, ApiError> {
    let Some(raw_key) = extract_api_key(headers) else {
        return Err(api_error(StatusCode::UNAUTHORIZED, "missing_api_key"));
    };

    let credential = match state.credentials.authenticate(&raw_key).await {
        Ok(Some(c)) => c,
        Ok(None) => return Err(api_error(StatusCode::UNAUTHORIZED, "invalid_api_key")),
        Err(e) => {
            warn!("credential lookup failed: {e}");
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ));
        }
    };

    if let Some(origin) = request_origin(headers)
        && !credential.origin_allowed(&origin)
    {
        return Err(api_error(StatusCode::FORBIDDEN, "origin_not_allowed"));
    }

    Ok(credential)
}

/// Origin header, or the origin part of Referer when Origin is absent
fn request_origin(headers: &HeaderMap) -> Option<String> {
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        return Some(origin.to_string());
    }
    let referer = headers.get(header::REFERER).and_then(|v| v.to_str().ok())?;
    let url = url::Url::parse(referer).ok()?;
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Some(format!("{}://{}", url.scheme(), host)),
    }
}

#[derive(Deserialize)]
pub struct ChallengeRequest {
    pub challenge_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub token: String,
    pub challenge_type: String,
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month_remaining: Option<u64>,
}

/// Issue a CAPTCHA challenge token. This is the metered operation: it
/// passes the concurrency gate and all three rate/quota counters.
pub async fn create_challenge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<ChallengeRequest>>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let started = Instant::now();
    let credential = authenticate(&state, &headers).await?;

    let challenge_type = body
        .and_then(|Json(b)| b.challenge_type)
        .unwrap_or_else(|| "image_grid".to_string());
    if !CHALLENGE_TYPES.contains(&challenge_type.as_str()) {
        return Err(api_error(StatusCode::BAD_REQUEST, "unknown_challenge_type"));
    }

    // The permit stays alive until this handler returns
    let (admission, _permit) = match state.engine.admit(&credential.id, "/v1/challenge", 1).await {
        Admit::Granted { admission, permit } => (admission, permit),
        Admit::Refused(reason) => return Err(refusal(reason)),
    };

    let issued = state
        .tokens
        .issue(
            &credential.id,
            &credential.account_id,
            &challenge_type,
            state.engine.now_ms(),
        )
        .await;

    let (token, expires_at) = match issued {
        Ok(pair) => pair,
        Err(e) => {
            warn!("token issue failed: {e}");
            let _ = state
                .engine
                .record_outcome(
                    &admission.event_id,
                    false,
                    500,
                    started.elapsed().as_millis() as u64,
                )
                .await;
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ));
        }
    };

    if let Err(e) = state
        .engine
        .record_outcome(
            &admission.event_id,
            true,
            200,
            started.elapsed().as_millis() as u64,
        )
        .await
    {
        warn!("failed to record outcome: {e}");
    }

    Ok(Json(ChallengeResponse {
        token,
        challenge_type,
        expires_at,
        minute_remaining: admission.minute_remaining,
        day_remaining: admission.day_remaining,
        month_remaining: admission.month_remaining,
    }))
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// Redeem a challenge token. Single-use; an invalid token is a normal
/// `valid: false` answer rather than an HTTP error, and no quota is
/// consumed either way.
pub async fn verify_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let credential = authenticate(&state, &headers).await?;

    let outcome = state
        .tokens
        .consume(&body.token, &credential.id, state.engine.now_ms())
        .await
        .map_err(|e| {
            warn!("token consume failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        })?;

    let response = match outcome {
        ConsumeOutcome::Consumed { challenge_type } => VerifyResponse {
            valid: true,
            challenge_type: Some(challenge_type),
            reason: None,
        },
        ConsumeOutcome::NotFound => VerifyResponse {
            valid: false,
            challenge_type: None,
            reason: Some("not_found"),
        },
        ConsumeOutcome::Expired => VerifyResponse {
            valid: false,
            challenge_type: None,
            reason: Some("expired"),
        },
        ConsumeOutcome::AlreadyUsed => VerifyResponse {
            valid: false,
            challenge_type: None,
            reason: Some("already_used"),
        },
    };
    Ok(Json(response))
}

/// Current consumption across the minute, day, and month windows. A
/// disabled or expired key gets the same credential refusal the metered
/// endpoints give.
pub async fn usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UsageSnapshot>, ApiError> {
    let credential = authenticate(&state, &headers).await?;

    match state.engine.current_usage(&credential.id).await {
        Ok(snap) => Ok(Json(snap)),
        Err(reason) => Err(refusal(reason)),
    }
}
