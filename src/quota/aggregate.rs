use std::collections::HashMap;

use turso::Connection;

use super::clock::{DAY_MS, day_start_ms, month_start_ms, year_month};
use crate::db::{self, get_u64};
use crate::error::GateError;

/// How many events each scope folded in one run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOutcome {
    pub daily_events: u64,
    pub monthly_events: u64,
}

/// Fold raw usage events for closed periods into the summary tables.
///
/// Each scope keeps a high-water mark; only events between the mark and the
/// start of the current (still open) period are folded, and the mark then
/// advances to that boundary. Re-running over an already-folded period folds
/// zero events, so the job is safe to fire on any schedule.
pub async fn aggregate(now: u64) -> Result<AggregateOutcome, GateError> {
    let conn = db::get_conn()?;
    let daily_events = fold_daily(&conn, now).await?;
    let monthly_events = fold_monthly(&conn, now).await?;
    Ok(AggregateOutcome {
        daily_events,
        monthly_events,
    })
}

async fn high_water(conn: &Connection, scope: &str) -> Result<u64, GateError> {
    let mut rows = conn
        .query(
            "SELECT high_water_ms FROM aggregation_state WHERE scope = ?",
            [scope],
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to read high-water mark: {e}")))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to read high-water row: {e}")))?
    else {
        return Ok(0);
    };
    Ok(get_u64(&row, 0))
}

async fn set_high_water(conn: &Connection, scope: &str, value: u64) -> Result<(), GateError> {
    let affected = conn
        .execute(
            "UPDATE aggregation_state SET high_water_ms = ? WHERE scope = ?",
            (value as i64, scope),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to update high-water mark: {e}")))?;
    if affected == 0 {
        conn.execute(
            "INSERT INTO aggregation_state (scope, high_water_ms) VALUES (?, ?)",
            (scope, value as i64),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to insert high-water mark: {e}")))?;
    }
    Ok(())
}

/// Fold closed days into `daily_summaries`. The current day is still open
/// and never included.
async fn fold_daily(conn: &Connection, now: u64) -> Result<u64, GateError> {
    let floor = high_water(conn, "daily").await?;
    let ceiling = day_start_ms(now);
    if ceiling <= floor {
        return Ok(0);
    }

    let mut rows = conn
        .query(
            "SELECT key_id, created_at / ? AS day, COUNT(*), COALESCE(SUM(cost), 0) \
             FROM usage_events WHERE created_at >= ? AND created_at < ? \
             GROUP BY key_id, day",
            (DAY_MS as i64, floor as i64, ceiling as i64),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to group daily events: {e}")))?;

    let mut buckets: Vec<(String, u64, u64, u64)> = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        let Ok(key_id) = row.get::<String>(0) else {
            continue;
        };
        buckets.push((key_id, get_u64(&row, 1), get_u64(&row, 2), get_u64(&row, 3)));
    }

    let mut folded = 0u64;
    for (key_id, day, count, cost) in buckets {
        upsert_daily(conn, &key_id, day, count, cost).await?;
        folded += count;
    }

    set_high_water(conn, "daily", ceiling).await?;
    Ok(folded)
}

/// Fold closed calendar months into `monthly_summaries`. Calendar month
/// boundaries don't fall on fixed millisecond multiples, so the grouping
/// happens here rather than in SQL.
async fn fold_monthly(conn: &Connection, now: u64) -> Result<u64, GateError> {
    let floor = high_water(conn, "monthly").await?;
    let ceiling = month_start_ms(now);
    if ceiling <= floor {
        return Ok(0);
    }

    let mut rows = conn
        .query(
            "SELECT account_id, created_at, cost FROM usage_events \
             WHERE created_at >= ? AND created_at < ?",
            (floor as i64, ceiling as i64),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to scan monthly events: {e}")))?;

    let mut buckets: HashMap<(String, i32, u32), (u64, u64)> = HashMap::new();
    let mut folded = 0u64;
    while let Ok(Some(row)) = rows.next().await {
        let Ok(account_id) = row.get::<String>(0) else {
            continue;
        };
        let (year, month) = year_month(get_u64(&row, 1));
        let entry = buckets.entry((account_id, year, month)).or_default();
        entry.0 += 1;
        entry.1 += get_u64(&row, 2);
        folded += 1;
    }

    for ((account_id, year, month), (count, cost)) in buckets {
        upsert_monthly(conn, &account_id, year, month, count, cost).await?;
    }

    set_high_water(conn, "monthly", ceiling).await?;
    Ok(folded)
}

async fn upsert_daily(
    conn: &Connection,
    key_id: &str,
    day: u64,
    count: u64,
    cost: u64,
) -> Result<(), GateError> {
    let affected = conn
        .execute(
            "UPDATE daily_summaries SET request_count = request_count + ?, \
             total_cost = total_cost + ? WHERE key_id = ? AND day = ?",
            (count as i64, cost as i64, key_id, day as i64),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to update daily summary: {e}")))?;
    if affected == 0 {
        conn.execute(
            "INSERT INTO daily_summaries (key_id, day, request_count, total_cost) \
             VALUES (?, ?, ?, ?)",
            (key_id, day as i64, count as i64, cost as i64),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to insert daily summary: {e}")))?;
    }
    Ok(())
}

async fn upsert_monthly(
    conn: &Connection,
    account_id: &str,
    year: i32,
    month: u32,
    count: u64,
    cost: u64,
) -> Result<(), GateError> {
    let affected = conn
        .execute(
            "UPDATE monthly_summaries SET request_count = request_count + ?, \
             total_cost = total_cost + ? WHERE account_id = ? AND year = ? AND month = ?",
            (
                count as i64,
                cost as i64,
                account_id,
                year as i64,
                month as i64,
            ),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to update monthly summary: {e}")))?;
    if affected == 0 {
        conn.execute(
            "INSERT INTO monthly_summaries (account_id, year, month, request_count, total_cost) \
             VALUES (?, ?, ?, ?, ?)",
            (
                account_id,
                year as i64,
                month as i64,
                count as i64,
                cost as i64,
            ),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to insert monthly summary: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventsStore;

    async fn daily_row(key_id: &str, day: u64) -> Option<(u64, u64)> {
        let conn = db::get_conn().unwrap();
        let mut rows = conn
            .query(
                "SELECT request_count, total_cost FROM daily_summaries \
                 WHERE key_id = ? AND day = ?",
                (key_id, day as i64),
            )
            .await
            .unwrap();
        rows.next()
            .await
            .unwrap()
            .map(|r| (get_u64(&r, 0), get_u64(&r, 1)))
    }

    async fn monthly_row(account_id: &str, year: i32, month: u32) -> Option<(u64, u64)> {
        let conn = db::get_conn().unwrap();
        let mut rows = conn
            .query(
                "SELECT request_count, total_cost FROM monthly_summaries \
                 WHERE account_id = ? AND year = ? AND month = ?",
                (account_id, year as i64, month as i64),
            )
            .await
            .unwrap();
        rows.next()
            .await
            .unwrap()
            .map(|r| (get_u64(&r, 0), get_u64(&r, 1)))
    }

    // The high-water marks are global, so every aggregate() call in the
    // suite lives in this one test and the assertions filter to its own
    // key and account.
    #[tokio::test]
    async fn folds_closed_periods_exactly_once() {
        crate::db::init_test_db().await;
        let events = EventsStore::new();
        let key = uuid::Uuid::new_v4().to_string();
        let account = uuid::Uuid::new_v4().to_string();

        // Two events on day 100, one on day 101 (all in April 1970)
        let day100 = 100 * DAY_MS;
        let day101 = 101 * DAY_MS;
        events.append(&key, &account, "/v1/challenge", day100 + 1_000, 1).await.unwrap();
        events.append(&key, &account, "/v1/challenge", day100 + 3_600_000, 2).await.unwrap();
        events.append(&key, &account, "/v1/verify", day101 + 500, 1).await.unwrap();

        // Day 135 is mid-May 1970: both April days and the April month are
        // closed
        let now = 135 * DAY_MS + 12 * 60 * 60 * 1000;
        let first = aggregate(now).await.unwrap();
        assert!(first.daily_events >= 3);
        assert!(first.monthly_events >= 3);

        assert_eq!(daily_row(&key, 100).await, Some((2, 3)));
        assert_eq!(daily_row(&key, 101).await, Some((1, 1)));
        assert_eq!(monthly_row(&account, 1970, 4).await, Some((3, 4)));

        // Re-run over the same boundary: nothing folds, summaries unchanged
        let second = aggregate(now).await.unwrap();
        assert_eq!(second, AggregateOutcome::default());
        assert_eq!(daily_row(&key, 100).await, Some((2, 3)));
        assert_eq!(monthly_row(&account, 1970, 4).await, Some((3, 4)));

        // A May event folds into its day once the day closes, but the May
        // month stays open until June
        events.append(&key, &account, "/v1/challenge", 135 * DAY_MS + 42, 1).await.unwrap();
        let third = aggregate(136 * DAY_MS).await.unwrap();
        assert!(third.daily_events >= 1);
        assert_eq!(third.monthly_events, 0);
        assert_eq!(daily_row(&key, 135).await, Some((1, 1)));
        assert_eq!(monthly_row(&account, 1970, 5).await, None);

        // June: the May month closes and folds
        let june = 160 * DAY_MS;
        aggregate(june).await.unwrap();
        assert_eq!(monthly_row(&account, 1970, 5).await, Some((1, 1)));
    }
}
