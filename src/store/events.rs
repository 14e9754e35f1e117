use crate::db::{self, get_u64};
use crate::error::GateError;

/// Append-only usage events plus the durable per-day rate-limit counters.
/// Events are the source of truth for aggregation and are never mutated
/// apart from the one-time outcome attachment.
pub struct EventsStore {
    #[cfg(test)]
    fail_writes: bool,
}

impl EventsStore {
    pub fn new() -> Self {
        Self {
            #[cfg(test)]
            fail_writes: false,
        }
    }

    /// Handle whose write paths error, for exercising fail-closed behavior
    #[cfg(test)]
    pub(crate) fn failing() -> Self {
        Self { fail_writes: true }
    }

    #[cfg(test)]
    fn check_write(&self) -> Result<(), GateError> {
        if self.fail_writes {
            return Err(GateError::DatabaseError("simulated write failure".into()));
        }
        Ok(())
    }

    /// Append one admitted call. Returns the event id.
    pub async fn append(
        &self,
        key_id: &str,
        account_id: &str,
        endpoint: &str,
        now: u64,
        cost: u64,
    ) -> Result<String, GateError> {
        #[cfg(test)]
        self.check_write()?;
        let event_id = uuid::Uuid::new_v4().to_string();
        let conn = db::get_conn()?;
        conn.execute(
            "INSERT INTO usage_events (id, key_id, account_id, endpoint, created_at, cost) \
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                event_id.as_str(),
                key_id,
                account_id,
                endpoint,
                now as i64,
                cost as i64,
            ),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to append usage event: {e}")))?;
        Ok(event_id)
    }

    /// Attach response metadata to an already-reserved event. Returns false
    /// when the event id is unknown.
    pub async fn record_outcome(
        &self,
        event_id: &str,
        success: bool,
        status_code: u16,
        latency_ms: u64,
    ) -> Result<bool, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE usage_events SET success = ?, status_code = ?, latency_ms = ? WHERE id = ?",
                (
                    success as i64,
                    status_code as i64,
                    latency_ms as i64,
                    event_id,
                ),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to record outcome: {e}")))?;
        Ok(affected > 0)
    }

    /// Current count for a (credential, day) bucket
    pub async fn day_count(&self, key_id: &str, day: u64) -> Result<u64, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query(
                "SELECT count FROM day_counters WHERE key_id = ? AND day = ?",
                (key_id, day as i64),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read day counter: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read day row: {e}")))?
        else {
            return Ok(0);
        };
        Ok(get_u64(&row, 0))
    }

    /// Add `cost` to a (credential, day) bucket. Callers serialize per
    /// credential, so check-then-insert is race-free here.
    pub async fn add_day_count(&self, key_id: &str, day: u64, cost: u64) -> Result<(), GateError> {
        #[cfg(test)]
        self.check_write()?;
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE day_counters SET count = count + ? WHERE key_id = ? AND day = ?",
                (cost as i64, key_id, day as i64),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to update day counter: {e}")))?;

        if affected == 0 {
            conn.execute(
                "INSERT INTO day_counters (key_id, day, count) VALUES (?, ?, ?)",
                (key_id, day as i64, cost as i64),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to insert day counter: {e}")))?;
        }
        Ok(())
    }

    /// Drop day counters older than `keep_days` days before `now_day`.
    pub async fn prune_day_counters(&self, now_day: u64, keep_days: u64) -> Result<u64, GateError> {
        let cutoff = now_day.saturating_sub(keep_days);
        let conn = db::get_conn()?;
        let affected = conn
            .execute("DELETE FROM day_counters WHERE day < ?", [cutoff as i64])
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to prune day counters: {e}")))?;
        Ok(affected)
    }
}

impl Default for EventsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outcome_attaches_once_event_exists() {
        crate::db::init_test_db().await;
        let store = EventsStore::new();
        let key = uuid::Uuid::new_v4().to_string();

        let event_id = store
            .append(&key, "acct", "/v1/challenge", 1_000, 1)
            .await
            .unwrap();
        assert!(store.record_outcome(&event_id, true, 200, 42).await.unwrap());
        assert!(!store
            .record_outcome("no-such-event", true, 200, 1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn day_counter_accumulates() {
        crate::db::init_test_db().await;
        let store = EventsStore::new();
        let key = uuid::Uuid::new_v4().to_string();

        assert_eq!(store.day_count(&key, 100).await.unwrap(), 0);
        store.add_day_count(&key, 100, 1).await.unwrap();
        store.add_day_count(&key, 100, 2).await.unwrap();
        assert_eq!(store.day_count(&key, 100).await.unwrap(), 3);

        // A different day bucket is independent
        assert_eq!(store.day_count(&key, 101).await.unwrap(), 0);
    }
}
