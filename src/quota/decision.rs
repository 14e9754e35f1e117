use serde::Serialize;
use utoipa::ToSchema;

/// Why a request was refused. Rate-limit and concurrency exhaustion carry
/// distinct codes so the caller can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateMinuteExceeded,
    RateDayExceeded,
    QuotaMonthExceeded,
    ConcurrencyExceeded,
    CredentialInactive,
    CredentialExpired,
    NoActiveSubscription,
    InternalError,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RateMinuteExceeded => "rate_minute_exceeded",
            DenyReason::RateDayExceeded => "rate_day_exceeded",
            DenyReason::QuotaMonthExceeded => "quota_month_exceeded",
            DenyReason::ConcurrencyExceeded => "concurrency_exceeded",
            DenyReason::CredentialInactive => "credential_inactive",
            DenyReason::CredentialExpired => "credential_expired",
            DenyReason::NoActiveSubscription => "no_active_subscription",
            DenyReason::InternalError => "internal_error",
        }
    }

    /// Expected, user-facing "try later" conditions (never logged as errors)
    pub fn is_limit(&self) -> bool {
        matches!(
            self,
            DenyReason::RateMinuteExceeded
                | DenyReason::RateDayExceeded
                | DenyReason::QuotaMonthExceeded
                | DenyReason::ConcurrencyExceeded
        )
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters remaining after an admission. None = unlimited on that axis.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    /// Id of the appended usage event, for `record_outcome`
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minute_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month_remaining: Option<u64>,
}

/// Outcome of `check_and_reserve`. On `Deny` no counter was touched.
#[derive(Debug, Clone)]
pub enum Decision {
    Allow(Admission),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}
