use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;

use crate::db::{self, get_u64, opt_u64};
use crate::error::GateError;

/// Per-credential rate-limit overrides. None falls back to the plan's
/// per-minute limit; a missing per-day limit means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_day: Option<u64>,
}

/// An API key record. The raw secret is returned exactly once at creation;
/// only its sha256 is stored.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    /// Public key id, the `ck_...` prefix of the full key
    pub key_id: String,
    pub account_id: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
    pub usage_count: u64,
    #[serde(default)]
    pub limits: KeyLimits,
    /// Origins allowed to use this key; empty = all origins
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Credential {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }

    /// Empty allow-list admits every origin
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == origin)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hash_secret(secret: &str) -> String {
    hex_encode(&Sha256::digest(secret.as_bytes()))
}

const CRED_COLUMNS: &str = "id, key_id, account_id, name, enabled, created_at, expires_at, \
                            last_used_at, usage_count, rate_limit_per_minute, rate_limit_per_day, \
                            allowed_origins";

fn credential_from_row(row: &turso::Row) -> Option<Credential> {
    let id = row.get::<String>(0).ok()?;
    Some(Credential {
        id,
        key_id: row.get::<String>(1).unwrap_or_default(),
        account_id: row.get::<String>(2).unwrap_or_default(),
        name: row.get::<String>(3).unwrap_or_default(),
        enabled: row.get::<i64>(4).unwrap_or(1) != 0,
        created_at: get_u64(row, 5),
        expires_at: opt_u64(row, 6),
        last_used_at: opt_u64(row, 7),
        usage_count: get_u64(row, 8),
        limits: KeyLimits {
            rate_limit_per_minute: opt_u64(row, 9),
            rate_limit_per_day: opt_u64(row, 10),
        },
        allowed_origins: row
            .get::<Option<String>>(11)
            .ok()
            .flatten()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}

pub struct CredentialsStore;

impl CredentialsStore {
    pub fn new() -> Self {
        Self
    }

    /// Create a credential. Returns the record plus the full raw key
    /// (`ck_<id>.<secret>`), which is not recoverable afterwards.
    pub async fn create(
        &self,
        account_id: &str,
        name: &str,
        expires_at: Option<u64>,
        limits: KeyLimits,
        allowed_origins: Vec<String>,
        now: u64,
    ) -> Result<(Credential, String), GateError> {
        // Generate random material before any await to avoid Send issues
        // with ThreadRng
        let (key_id, secret) = {
            let mut rng = rand::rng();
            let mut id_bytes = [0u8; 8];
            rng.fill(&mut id_bytes);
            let mut secret_bytes = [0u8; 32];
            rng.fill(&mut secret_bytes);
            (
                format!("ck_{}", hex_encode(&id_bytes)),
                URL_SAFE_NO_PAD.encode(secret_bytes),
            )
        };
        let raw_key = format!("{key_id}.{secret}");

        let cred = Credential {
            id: uuid::Uuid::new_v4().to_string(),
            key_id,
            account_id: account_id.to_string(),
            name: name.to_string(),
            enabled: true,
            created_at: now,
            expires_at,
            last_used_at: None,
            usage_count: 0,
            limits,
            allowed_origins,
        };

        let origins_json = serde_json::to_string(&cred.allowed_origins)
            .map_err(|e| GateError::DatabaseError(format!("Failed to encode origins: {e}")))?;

        let conn = db::get_conn()?;
        conn.execute(
            "INSERT INTO api_keys (id, key_id, secret_hash, account_id, name, enabled, created_at, \
             expires_at, usage_count, rate_limit_per_minute, rate_limit_per_day, allowed_origins) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, 0, ?, ?, ?)",
            (
                cred.id.as_str(),
                cred.key_id.as_str(),
                hash_secret(&secret).as_str(),
                cred.account_id.as_str(),
                cred.name.as_str(),
                cred.created_at as i64,
                cred.expires_at.map(|v| v as i64),
                cred.limits.rate_limit_per_minute.map(|v| v as i64),
                cred.limits.rate_limit_per_day.map(|v| v as i64),
                origins_json.as_str(),
            ),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to create API key: {e}")))?;

        Ok((cred, raw_key))
    }

    /// Authenticate a raw `ck_<id>.<secret>` key. The secret hash comparison
    /// is constant-time. Disabled or expired credentials still authenticate
    /// here; the quota engine turns their state into a precise deny reason.
    pub async fn authenticate(&self, raw_key: &str) -> Result<Option<Credential>, GateError> {
        let Some((key_id, secret)) = raw_key.split_once('.') else {
            return Ok(None);
        };
        if !key_id.starts_with("ck_") {
            return Ok(None);
        }

        let conn = db::get_conn()?;
        let mut rows = conn
            .query(
                &format!("SELECT {CRED_COLUMNS}, secret_hash FROM api_keys WHERE key_id = ?"),
                [key_id],
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to look up API key: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read API key row: {e}")))?
        else {
            return Ok(None);
        };

        let stored_hash = row.get::<String>(12).unwrap_or_default();
        let provided_hash = hash_secret(secret);
        if !bool::from(stored_hash.as_bytes().ct_eq(provided_hash.as_bytes())) {
            return Ok(None);
        }

        Ok(credential_from_row(&row))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Credential>, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query(
                &format!("SELECT {CRED_COLUMNS} FROM api_keys WHERE id = ?"),
                [id],
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to get API key: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read API key row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(credential_from_row(&row))
    }

    pub async fn list(&self, account_id: Option<&str>) -> Result<Vec<Credential>, GateError> {
        let conn = db::get_conn()?;
        let mut creds = Vec::new();

        if let Some(account) = account_id {
            let mut rows = conn
                .query(
                    &format!(
                        "SELECT {CRED_COLUMNS} FROM api_keys WHERE account_id = ? \
                         ORDER BY created_at DESC"
                    ),
                    [account],
                )
                .await
                .map_err(|e| GateError::DatabaseError(format!("Failed to list API keys: {e}")))?;
            while let Ok(Some(row)) = rows.next().await {
                if let Some(cred) = credential_from_row(&row) {
                    creds.push(cred);
                }
            }
        } else {
            let mut rows = conn
                .query(
                    &format!("SELECT {CRED_COLUMNS} FROM api_keys ORDER BY created_at DESC"),
                    (),
                )
                .await
                .map_err(|e| GateError::DatabaseError(format!("Failed to list API keys: {e}")))?;
            while let Ok(Some(row)) = rows.next().await {
                if let Some(cred) = credential_from_row(&row) {
                    creds.push(cred);
                }
            }
        }
        Ok(creds)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute("DELETE FROM api_keys WHERE id = ?", [id])
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to delete API key: {e}")))?;
        Ok(affected > 0)
    }

    /// Soft-disable (revoke) or re-enable a credential
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE api_keys SET enabled = ? WHERE id = ?",
                (enabled as i64, id),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to set key enabled: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_limits(&self, id: &str, limits: KeyLimits) -> Result<bool, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE api_keys SET rate_limit_per_minute = ?, rate_limit_per_day = ? WHERE id = ?",
                (
                    limits.rate_limit_per_minute.map(|v| v as i64),
                    limits.rate_limit_per_day.map(|v| v as i64),
                    id,
                ),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to set key limits: {e}")))?;
        Ok(affected > 0)
    }

    pub async fn set_allowed_origins(
        &self,
        id: &str,
        origins: Vec<String>,
    ) -> Result<bool, GateError> {
        let origins_json = serde_json::to_string(&origins)
            .map_err(|e| GateError::DatabaseError(format!("Failed to encode origins: {e}")))?;
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE api_keys SET allowed_origins = ? WHERE id = ?",
                (origins_json.as_str(), id),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to set origins: {e}")))?;
        Ok(affected > 0)
    }

    /// Bump last_used_at and the lifetime counter
    pub async fn touch(&self, id: &str, now: u64) -> Result<(), GateError> {
        let conn = db::get_conn()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?, usage_count = usage_count + 1 WHERE id = ?",
            (now as i64, id),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to touch API key: {e}")))?;
        Ok(())
    }
}

impl Default for CredentialsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_authenticate() {
        crate::db::init_test_db().await;
        let store = CredentialsStore::new();
        let account = uuid::Uuid::new_v4().to_string();

        let (cred, raw_key) = store
            .create(&account, "test key", None, KeyLimits::default(), Vec::new(), 1_000)
            .await
            .unwrap();
        assert!(raw_key.starts_with("ck_"));
        assert!(raw_key.contains('.'));

        let found = store.authenticate(&raw_key).await.unwrap().unwrap();
        assert_eq!(found.id, cred.id);
        assert_eq!(found.account_id, account);

        // Wrong secret with a valid key id fails
        let bad_key = format!("{}.{}", cred.key_id, "not-the-secret");
        assert!(store.authenticate(&bad_key).await.unwrap().is_none());

        // Garbage fails without error
        assert!(store.authenticate("garbage").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoked_key_still_resolves_but_is_disabled() {
        crate::db::init_test_db().await;
        let store = CredentialsStore::new();
        let account = uuid::Uuid::new_v4().to_string();

        let (cred, raw_key) = store
            .create(&account, "revocable", None, KeyLimits::default(), Vec::new(), 1_000)
            .await
            .unwrap();
        assert!(store.set_enabled(&cred.id, false).await.unwrap());

        let found = store.authenticate(&raw_key).await.unwrap().unwrap();
        assert!(!found.enabled);
    }

    #[test]
    fn origin_allow_list() {
        let mut cred = Credential {
            id: "id".into(),
            key_id: "ck_x".into(),
            account_id: "a".into(),
            name: "n".into(),
            enabled: true,
            created_at: 0,
            expires_at: None,
            last_used_at: None,
            usage_count: 0,
            limits: KeyLimits::default(),
            allowed_origins: Vec::new(),
        };
        assert!(cred.origin_allowed("https://anywhere.example"));

        cred.allowed_origins = vec!["https://app.example.com".into()];
        assert!(cred.origin_allowed("https://app.example.com"));
        assert!(!cred.origin_allowed("https://evil.example.com"));
    }

    #[test]
    fn expiry_boundary() {
        let cred = Credential {
            id: "id".into(),
            key_id: "ck_x".into(),
            account_id: "a".into(),
            name: "n".into(),
            enabled: true,
            created_at: 0,
            expires_at: Some(5_000),
            last_used_at: None,
            usage_count: 0,
            limits: KeyLimits::default(),
            allowed_origins: Vec::new(),
        };
        assert!(!cred.is_expired(4_999));
        assert!(cred.is_expired(5_000));
    }
}
