use axum::{Json, extract::Query, http::StatusCode};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ErrorResponse;
use crate::db::get_u64;
use crate::quota::clock::{SystemClock, TimeSource};

// --- Types ---

#[derive(Deserialize, ToSchema)]
pub struct UsageHistoryQuery {
    /// Time period: "24h", "7d", or "30d"
    pub period: Option<String>,
    /// Restrict to one API key
    pub key_id: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesPoint {
    pub timestamp: u64,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: u64,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesResponse {
    pub period: String,
    pub granularity: String,
    pub points: Vec<TimeseriesPoint>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyBreakdown {
    pub key_id: String,
    pub key_name: Option<String>,
    pub request_count: u64,
    pub total_cost: u64,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyBreakdownResponse {
    pub period: String,
    pub keys: Vec<KeyBreakdown>,
}

#[derive(Deserialize, ToSchema)]
pub struct DailySummaryQuery {
    pub key_id: String,
    /// How many trailing days to return (default 30)
    pub days: Option<u64>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DailySummaryRow {
    /// Days since epoch (UTC)
    pub day: u64,
    pub request_count: u64,
    pub total_cost: u64,
}

#[derive(Serialize, ToSchema)]
pub struct DailySummaryResponse {
    pub days: Vec<DailySummaryRow>,
}

#[derive(Deserialize, ToSchema)]
pub struct MonthlySummaryQuery {
    pub account_id: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySummaryRow {
    pub year: i32,
    pub month: u32,
    pub request_count: u64,
    pub total_cost: u64,
}

#[derive(Serialize, ToSchema)]
pub struct MonthlySummaryResponse {
    pub months: Vec<MonthlySummaryRow>,
}

// --- Helpers ---

/// Parse period string into (cutoff_ms_ago, bucket_ms, granularity_label)
fn parse_period(period: &str) -> (u64, u64, &'static str) {
    match period {
        "7d" => (7 * 24 * 3600 * 1000, 6 * 3600 * 1000, "6h"),
        "30d" => (30 * 24 * 3600 * 1000, 24 * 3600 * 1000, "day"),
        _ => (24 * 3600 * 1000, 3600 * 1000, "hour"), // default: 24h
    }
}

// --- Handlers ---

/// Request timeseries over raw usage events
#[utoipa::path(
    get,
    path = "/usage/timeseries",
    tag = "usage",
    params(
        ("period" = Option<String>, Query, description = "Period: 24h, 7d, or 30d"),
        ("key_id" = Option<String>, Query, description = "Restrict to one key"),
    ),
    responses(
        (status = 200, body = TimeseriesResponse),
    )
)]
pub async fn get_usage_timeseries(
    Query(query): Query<UsageHistoryQuery>,
) -> Json<TimeseriesResponse> {
    let period_str = query.period.as_deref().unwrap_or("24h");
    let (cutoff_ms, bucket_ms, granularity) = parse_period(period_str);
    let now = SystemClock.now_ms();
    let cutoff = now.saturating_sub(cutoff_ms);

    let empty = || TimeseriesResponse {
        period: period_str.to_string(),
        granularity: granularity.to_string(),
        points: Vec::new(),
    };

    let Ok(conn) = crate::db::get_conn() else {
        return Json(empty());
    };

    let key_filter = query.key_id.as_deref().unwrap_or("");
    let Ok(mut rows) = conn
        .query(
            "SELECT (created_at / ?1) * ?1 AS bucket, COUNT(*), \
             COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(latency_ms), 0) \
             FROM usage_events WHERE created_at >= ?2 AND (?3 = '' OR key_id = ?3) \
             GROUP BY bucket ORDER BY bucket",
            (bucket_ms as i64, cutoff as i64, key_filter),
        )
        .await
    else {
        return Json(empty());
    };

    let mut data_map = std::collections::HashMap::new();
    while let Ok(Some(row)) = rows.next().await {
        let ts = get_u64(&row, 0);
        let count = get_u64(&row, 1);
        let latency_sum = get_u64(&row, 4);
        data_map.insert(
            ts,
            TimeseriesPoint {
                timestamp: ts,
                request_count: count,
                success_count: get_u64(&row, 2),
                failure_count: get_u64(&row, 3),
                avg_latency_ms: if count > 0 { latency_sum / count } else { 0 },
            },
        );
    }

    // Fill empty buckets across the full time range
    let bucket_start = (cutoff / bucket_ms) * bucket_ms;
    let bucket_end = (now / bucket_ms) * bucket_ms;
    let mut points = Vec::new();
    let mut ts = bucket_start;
    while ts <= bucket_end {
        points.push(data_map.remove(&ts).unwrap_or(TimeseriesPoint {
            timestamp: ts,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            avg_latency_ms: 0,
        }));
        ts += bucket_ms;
    }

    Json(TimeseriesResponse {
        period: period_str.to_string(),
        granularity: granularity.to_string(),
        points,
    })
}

/// Per-key request breakdown over a period
#[utoipa::path(
    get,
    path = "/usage/by-key",
    tag = "usage",
    params(("period" = Option<String>, Query, description = "Period: 24h, 7d, or 30d")),
    responses(
        (status = 200, body = KeyBreakdownResponse),
    )
)]
pub async fn get_usage_by_key(Query(query): Query<UsageHistoryQuery>) -> Json<KeyBreakdownResponse> {
    let period_str = query.period.as_deref().unwrap_or("24h");
    let (cutoff_ms, _, _) = parse_period(period_str);
    let now = SystemClock.now_ms();
    let cutoff = now.saturating_sub(cutoff_ms);

    let empty = || KeyBreakdownResponse {
        period: period_str.to_string(),
        keys: Vec::new(),
    };

    let Ok(conn) = crate::db::get_conn() else {
        return Json(empty());
    };

    let Ok(mut rows) = conn
        .query(
            "SELECT e.key_id, k.name, COUNT(*), COALESCE(SUM(e.cost), 0) \
             FROM usage_events e LEFT JOIN api_keys k ON e.key_id = k.id \
             WHERE e.created_at >= ? \
             GROUP BY e.key_id ORDER BY COUNT(*) DESC",
            [cutoff as i64],
        )
        .await
    else {
        return Json(empty());
    };

    let mut keys = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        let Ok(key_id) = row.get::<String>(0) else {
            continue;
        };
        keys.push(KeyBreakdown {
            key_id,
            key_name: row.get::<Option<String>>(1).ok().flatten(),
            request_count: get_u64(&row, 2),
            total_cost: get_u64(&row, 3),
        });
    }

    Json(KeyBreakdownResponse {
        period: period_str.to_string(),
        keys,
    })
}

/// Folded daily rollups for one key
#[utoipa::path(
    get,
    path = "/usage/daily",
    tag = "usage",
    params(
        ("key_id" = String, Query, description = "Key ID"),
        ("days" = Option<u64>, Query, description = "Trailing days (default 30)"),
    ),
    responses(
        (status = 200, body = DailySummaryResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_daily_summaries(
    Query(query): Query<DailySummaryQuery>,
) -> Result<Json<DailySummaryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let window = query.days.unwrap_or(30);
    let today = SystemClock.now_ms() / (24 * 3600 * 1000);
    let floor = today.saturating_sub(window);

    let conn = crate::db::get_conn().map_err(super::store_error)?;
    let mut rows = conn
        .query(
            "SELECT day, request_count, total_cost FROM daily_summaries \
             WHERE key_id = ? AND day >= ? ORDER BY day",
            (query.key_id.as_str(), floor as i64),
        )
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Failed to read daily summaries: {e}"),
                }),
            )
        })?;

    let mut days = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        days.push(DailySummaryRow {
            day: get_u64(&row, 0),
            request_count: get_u64(&row, 1),
            total_cost: get_u64(&row, 2),
        });
    }
    Ok(Json(DailySummaryResponse { days }))
}

/// Folded monthly rollups for one account
#[utoipa::path(
    get,
    path = "/usage/monthly",
    tag = "usage",
    params(("account_id" = String, Query, description = "Account ID")),
    responses(
        (status = 200, body = MonthlySummaryResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_monthly_summaries(
    Query(query): Query<MonthlySummaryQuery>,
) -> Result<Json<MonthlySummaryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let conn = crate::db::get_conn().map_err(super::store_error)?;
    let mut rows = conn
        .query(
            "SELECT year, month, request_count, total_cost FROM monthly_summaries \
             WHERE account_id = ? ORDER BY year, month",
            [query.account_id.as_str()],
        )
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Failed to read monthly summaries: {e}"),
                }),
            )
        })?;

    let mut months = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        months.push(MonthlySummaryRow {
            year: row.get::<i64>(0).unwrap_or(0) as i32,
            month: get_u64(&row, 1) as u32,
            request_count: get_u64(&row, 2),
            total_cost: get_u64(&row, 3),
        });
    }
    Ok(Json(MonthlySummaryResponse { months }))
}
