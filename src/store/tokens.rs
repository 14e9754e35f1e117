use rand::Rng;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db;
use crate::error::GateError;

/// Challenge token lifetime: 10 minutes
pub const TOKEN_TTL_MS: u64 = 10 * 60 * 1000;

/// Result of trying to consume a one-shot challenge token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeOutcome {
    /// Token was valid and is now marked used
    Consumed { challenge_type: String },
    NotFound,
    Expired,
    AlreadyUsed,
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Short-lived, single-use CAPTCHA challenge tokens.
pub struct TokensStore;

impl TokensStore {
    pub fn new() -> Self {
        Self
    }

    /// Issue a fresh token bound to the credential that requested it.
    pub async fn issue(
        &self,
        key_id: &str,
        account_id: &str,
        challenge_type: &str,
        now: u64,
    ) -> Result<(String, u64), GateError> {
        let token_id = {
            let mut rng = rand::rng();
            let mut bytes = [0u8; 16];
            rng.fill(&mut bytes);
            hex_encode(&bytes)
        };
        let expires_at = now + TOKEN_TTL_MS;

        let conn = db::get_conn()?;
        conn.execute(
            "INSERT INTO challenge_tokens (token_id, key_id, account_id, challenge_type, \
             created_at, expires_at, used) VALUES (?, ?, ?, ?, ?, ?, 0)",
            (
                token_id.as_str(),
                key_id,
                account_id,
                challenge_type,
                now as i64,
                expires_at as i64,
            ),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to issue token: {e}")))?;

        Ok((token_id, expires_at))
    }

    /// Consume a token exactly once. The conditional UPDATE is the
    /// single-use guarantee; the follow-up SELECT only diagnoses why a
    /// consume failed.
    pub async fn consume(
        &self,
        token_id: &str,
        key_id: &str,
        now: u64,
    ) -> Result<ConsumeOutcome, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE challenge_tokens SET used = 1, used_at = ? \
                 WHERE token_id = ? AND key_id = ? AND used = 0 AND expires_at >= ?",
                (now as i64, token_id, key_id, now as i64),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to consume token: {e}")))?;

        if affected > 0 {
            let mut rows = conn
                .query(
                    "SELECT challenge_type FROM challenge_tokens WHERE token_id = ?",
                    [token_id],
                )
                .await
                .map_err(|e| GateError::DatabaseError(format!("Failed to read token: {e}")))?;
            let challenge_type = rows
                .next()
                .await
                .ok()
                .flatten()
                .and_then(|r| r.get::<String>(0).ok())
                .unwrap_or_default();
            return Ok(ConsumeOutcome::Consumed { challenge_type });
        }

        let mut rows = conn
            .query(
                "SELECT used, expires_at FROM challenge_tokens WHERE token_id = ? AND key_id = ?",
                (token_id, key_id),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to inspect token: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read token row: {e}")))?
        else {
            return Ok(ConsumeOutcome::NotFound);
        };

        let used = row.get::<i64>(0).unwrap_or(0) != 0;
        let expires_at = crate::db::get_u64(&row, 1);
        if used {
            Ok(ConsumeOutcome::AlreadyUsed)
        } else if expires_at < now {
            Ok(ConsumeOutcome::Expired)
        } else {
            // Lost a race with a concurrent consume
            Ok(ConsumeOutcome::AlreadyUsed)
        }
    }

    /// Garbage-collect tokens whose expiry has passed. Touches no counters.
    pub async fn expire_stale(&self, now: u64) -> Result<u64, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "DELETE FROM challenge_tokens WHERE expires_at < ?",
                [now as i64],
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to expire tokens: {e}")))?;
        Ok(affected)
    }
}

impl Default for TokensStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_is_single_use() {
        crate::db::init_test_db().await;
        let store = TokensStore::new();
        let key = uuid::Uuid::new_v4().to_string();

        let (token_id, expires_at) = store.issue(&key, "acct", "image_grid", 1_000).await.unwrap();
        assert_eq!(expires_at, 1_000 + TOKEN_TTL_MS);

        let first = store.consume(&token_id, &key, 2_000).await.unwrap();
        assert_eq!(
            first,
            ConsumeOutcome::Consumed {
                challenge_type: "image_grid".into()
            }
        );

        let second = store.consume(&token_id, &key, 2_500).await.unwrap();
        assert_eq!(second, ConsumeOutcome::AlreadyUsed);
    }

    #[tokio::test]
    async fn expired_token_rejected_and_collected() {
        crate::db::init_test_db().await;
        let store = TokensStore::new();
        let key = uuid::Uuid::new_v4().to_string();

        let (token_id, expires_at) = store.issue(&key, "acct", "slider", 1_000).await.unwrap();

        // Past expiry: consume refuses
        let late = store.consume(&token_id, &key, expires_at + 1).await.unwrap();
        assert_eq!(late, ConsumeOutcome::Expired);

        // GC removes it; a fresh token from another credential survives
        let other_key = uuid::Uuid::new_v4().to_string();
        let (fresh_id, _) = store
            .issue(&other_key, "acct2", "slider", expires_at + 1)
            .await
            .unwrap();

        let removed = store.expire_stale(expires_at + 1).await.unwrap();
        assert!(removed >= 1);

        assert_eq!(
            store.consume(&token_id, &key, expires_at + 2).await.unwrap(),
            ConsumeOutcome::NotFound
        );
        assert!(matches!(
            store
                .consume(&fresh_id, &other_key, expires_at + 2)
                .await
                .unwrap(),
            ConsumeOutcome::Consumed { .. }
        ));
    }

    #[tokio::test]
    async fn token_bound_to_issuing_key() {
        crate::db::init_test_db().await;
        let store = TokensStore::new();
        let key = uuid::Uuid::new_v4().to_string();

        let (token_id, _) = store.issue(&key, "acct", "image_grid", 1_000).await.unwrap();
        let outcome = store.consume(&token_id, "other-key", 1_500).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::NotFound);
    }
}
