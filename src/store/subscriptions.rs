use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::plans::Plan;
use crate::db::{self, get_u64, opt_u64};
use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    Suspended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "cancelled" => Some(SubscriptionStatus::Cancelled),
            "expired" => Some(SubscriptionStatus::Expired),
            "suspended" => Some(SubscriptionStatus::Suspended),
            _ => None,
        }
    }
}

/// An account's time-bound binding to a plan
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub account_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub started_at: u64,
    pub expires_at: Option<u64>,
    pub amount_paid_cents: i64,
    /// Requests consumed in the current billing cycle
    pub cycle_usage: u64,
    pub last_reset_at: u64,
}

const SUB_COLUMNS: &str = "id, account_id, plan_id, status, started_at, expires_at, \
                           amount_paid_cents, cycle_usage, last_reset_at";

fn subscription_from_row(row: &turso::Row) -> Option<Subscription> {
    let id = row.get::<String>(0).ok()?;
    let status = row
        .get::<String>(3)
        .ok()
        .and_then(|s| SubscriptionStatus::parse(&s))?;
    Some(Subscription {
        id,
        account_id: row.get::<String>(1).unwrap_or_default(),
        plan_id: row.get::<String>(2).unwrap_or_default(),
        status,
        started_at: get_u64(row, 4),
        expires_at: opt_u64(row, 5),
        amount_paid_cents: row.get::<i64>(6).unwrap_or(0),
        cycle_usage: get_u64(row, 7),
        last_reset_at: get_u64(row, 8),
    })
}

pub struct SubscriptionsStore;

impl SubscriptionsStore {
    pub fn new() -> Self {
        Self
    }

    /// Create an active subscription. At most one active subscription may
    /// exist per account.
    pub async fn create(
        &self,
        account_id: &str,
        plan_id: &str,
        expires_at: Option<u64>,
        amount_paid_cents: i64,
        now: u64,
    ) -> Result<Subscription, GateError> {
        let conn = db::get_conn()?;

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM subscriptions WHERE account_id = ? AND status = 'active'",
                [account_id],
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to check subscriptions: {e}")))?;
        let active: i64 = rows
            .next()
            .await
            .ok()
            .flatten()
            .and_then(|r| r.get::<i64>(0).ok())
            .unwrap_or(0);
        if active > 0 {
            return Err(GateError::Conflict(
                "Account already has an active subscription".into(),
            ));
        }

        let mut rows = conn
            .query("SELECT COUNT(*) FROM plans WHERE id = ?", [plan_id])
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to check plan: {e}")))?;
        let plan_exists: i64 = rows
            .next()
            .await
            .ok()
            .flatten()
            .and_then(|r| r.get::<i64>(0).ok())
            .unwrap_or(0);
        if plan_exists == 0 {
            return Err(GateError::NotFound("Plan"));
        }

        let sub = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            plan_id: plan_id.to_string(),
            status: SubscriptionStatus::Active,
            started_at: now,
            expires_at,
            amount_paid_cents,
            cycle_usage: 0,
            last_reset_at: now,
        };

        conn.execute(
            "INSERT INTO subscriptions (id, account_id, plan_id, status, started_at, expires_at, \
             amount_paid_cents, cycle_usage, last_reset_at) VALUES (?, ?, ?, 'active', ?, ?, ?, 0, ?)",
            (
                sub.id.as_str(),
                sub.account_id.as_str(),
                sub.plan_id.as_str(),
                sub.started_at as i64,
                sub.expires_at.map(|v| v as i64),
                sub.amount_paid_cents,
                sub.last_reset_at as i64,
            ),
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE") {
                GateError::Conflict("Account already has an active subscription".into())
            } else {
                GateError::DatabaseError(format!("Failed to create subscription: {msg}"))
            }
        })?;

        Ok(sub)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Subscription>, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query(
                &format!("SELECT {SUB_COLUMNS} FROM subscriptions WHERE id = ?"),
                [id],
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to get subscription: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read subscription: {e}")))?
        else {
            return Ok(None);
        };
        Ok(subscription_from_row(&row))
    }

    pub async fn list(&self, account_id: Option<&str>) -> Result<Vec<Subscription>, GateError> {
        let conn = db::get_conn()?;
        let mut subs = Vec::new();

        if let Some(account) = account_id {
            let mut rows = conn
                .query(
                    &format!(
                        "SELECT {SUB_COLUMNS} FROM subscriptions WHERE account_id = ? \
                         ORDER BY started_at DESC"
                    ),
                    [account],
                )
                .await
                .map_err(|e| {
                    GateError::DatabaseError(format!("Failed to list subscriptions: {e}"))
                })?;
            while let Ok(Some(row)) = rows.next().await {
                if let Some(sub) = subscription_from_row(&row) {
                    subs.push(sub);
                }
            }
        } else {
            let mut rows = conn
                .query(
                    &format!("SELECT {SUB_COLUMNS} FROM subscriptions ORDER BY started_at DESC"),
                    (),
                )
                .await
                .map_err(|e| {
                    GateError::DatabaseError(format!("Failed to list subscriptions: {e}"))
                })?;
            while let Ok(Some(row)) = rows.next().await {
                if let Some(sub) = subscription_from_row(&row) {
                    subs.push(sub);
                }
            }
        }
        Ok(subs)
    }

    /// The account's current active subscription joined with its plan.
    /// A subscription whose expiry has passed does not count as active.
    pub async fn active_for_account(
        &self,
        account_id: &str,
        now: u64,
    ) -> Result<Option<(Subscription, Plan)>, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query(
                "SELECT s.id, s.account_id, s.plan_id, s.status, s.started_at, s.expires_at, \
                 s.amount_paid_cents, s.cycle_usage, s.last_reset_at, \
                 p.id, p.name, p.price_cents, p.monthly_request_limit, p.concurrent_limit, \
                 p.rate_limit_per_minute, p.features, p.enabled, p.sort_order \
                 FROM subscriptions s JOIN plans p ON s.plan_id = p.id \
                 WHERE s.account_id = ? AND s.status = 'active' \
                 AND (s.expires_at IS NULL OR s.expires_at > ?) \
                 ORDER BY s.started_at DESC LIMIT 1",
                (account_id, now as i64),
            )
            .await
            .map_err(|e| {
                GateError::DatabaseError(format!("Failed to query active subscription: {e}"))
            })?;

        let Some(row) = rows.next().await.map_err(|e| {
            GateError::DatabaseError(format!("Failed to read subscription row: {e}"))
        })?
        else {
            return Ok(None);
        };

        let Some(sub) = subscription_from_row(&row) else {
            return Ok(None);
        };
        let plan = Plan {
            id: row.get::<String>(9).unwrap_or_default(),
            name: row.get::<String>(10).unwrap_or_default(),
            price_cents: row.get::<i64>(11).unwrap_or(0),
            monthly_request_limit: opt_u64(&row, 12),
            concurrent_limit: get_u64(&row, 13),
            rate_limit_per_minute: get_u64(&row, 14),
            features: row
                .get::<Option<String>>(15)
                .ok()
                .flatten()
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            enabled: row.get::<i64>(16).unwrap_or(1) != 0,
            sort_order: row.get::<i64>(17).unwrap_or(0),
        };
        Ok(Some((sub, plan)))
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: SubscriptionStatus,
    ) -> Result<bool, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE subscriptions SET status = ? WHERE id = ?",
                (status.as_str(), id),
            )
            .await
            .map_err(|e| {
                GateError::DatabaseError(format!("Failed to update subscription status: {e}"))
            })?;
        Ok(affected > 0)
    }

    /// Current-cycle usage counter, read fresh from storage
    pub async fn cycle_usage(&self, id: &str) -> Result<Option<u64>, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query("SELECT cycle_usage FROM subscriptions WHERE id = ?", [id])
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read cycle usage: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read cycle row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(Some(get_u64(&row, 0)))
    }

    pub async fn add_cycle_usage(&self, id: &str, cost: u64) -> Result<(), GateError> {
        let conn = db::get_conn()?;
        conn.execute(
            "UPDATE subscriptions SET cycle_usage = cycle_usage + ? WHERE id = ?",
            (cost as i64, id),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to add cycle usage: {e}")))?;
        Ok(())
    }

    /// Zero the cycle counter and stamp the reset time. No-op when
    /// `last_reset_at` already falls inside the billing cycle of `as_of`,
    /// which makes repeated invocations for the same cycle safe.
    pub async fn reset_cycle(&self, id: &str, as_of: u64) -> Result<bool, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query("SELECT last_reset_at FROM subscriptions WHERE id = ?", [id])
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read last reset: {e}")))?;
        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read reset row: {e}")))?
        else {
            return Err(GateError::NotFound("Subscription"));
        };
        let last_reset_at = get_u64(&row, 0);

        if last_reset_at > 0 && crate::quota::clock::same_cycle(last_reset_at, as_of) {
            return Ok(false);
        }

        conn.execute(
            "UPDATE subscriptions SET cycle_usage = 0, last_reset_at = ? WHERE id = ?",
            (as_of as i64, id),
        )
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to reset cycle: {e}")))?;
        Ok(true)
    }

    /// Mark active subscriptions whose expiry has passed as expired.
    /// Returns the number of rows transitioned.
    pub async fn expire_sweep(&self, now: u64) -> Result<u64, GateError> {
        let conn = db::get_conn()?;
        let affected = conn
            .execute(
                "UPDATE subscriptions SET status = 'expired' \
                 WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?",
                [now as i64],
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to expire subscriptions: {e}")))?;
        Ok(affected)
    }
}

impl Default for SubscriptionsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PlansStore;

    async fn test_plan() -> Plan {
        PlansStore::new()
            .create(
                &format!("plan-{}", uuid::Uuid::new_v4()),
                0,
                None,
                5,
                60,
                Default::default(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn at_most_one_active_subscription_per_account() {
        crate::db::init_test_db().await;
        let store = SubscriptionsStore::new();
        let plan = test_plan().await;
        let account = uuid::Uuid::new_v4().to_string();

        let first = store.create(&account, &plan.id, None, 0, 1_000).await.unwrap();
        assert_eq!(first.status, SubscriptionStatus::Active);

        // A second active subscription for the same account is refused
        assert!(matches!(
            store.create(&account, &plan.id, None, 0, 2_000).await,
            Err(GateError::Conflict(_))
        ));

        // Cancelling frees the slot
        assert!(store
            .set_status(&first.id, SubscriptionStatus::Cancelled)
            .await
            .unwrap());
        let second = store.create(&account, &plan.id, None, 0, 3_000).await.unwrap();
        assert_eq!(second.status, SubscriptionStatus::Active);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn create_requires_existing_plan() {
        crate::db::init_test_db().await;
        let store = SubscriptionsStore::new();
        let account = uuid::Uuid::new_v4().to_string();

        assert!(matches!(
            store.create(&account, "no-such-plan", None, 0, 1_000).await,
            Err(GateError::NotFound("Plan"))
        ));
    }

    #[tokio::test]
    async fn expiry_sweep_transitions_only_past_expiry() {
        crate::db::init_test_db().await;
        let store = SubscriptionsStore::new();
        let plan = test_plan().await;

        let expiring_account = uuid::Uuid::new_v4().to_string();
        let open_account = uuid::Uuid::new_v4().to_string();
        let expiring = store
            .create(&expiring_account, &plan.id, Some(5_000), 0, 1_000)
            .await
            .unwrap();
        let open_ended = store
            .create(&open_account, &plan.id, None, 0, 1_000)
            .await
            .unwrap();

        let swept = store.expire_sweep(6_000).await.unwrap();
        assert!(swept >= 1);

        let expired = store.get(&expiring.id).await.unwrap().unwrap();
        assert_eq!(expired.status, SubscriptionStatus::Expired);
        let untouched = store.get(&open_ended.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, SubscriptionStatus::Active);

        // An expired subscription no longer resolves as active
        assert!(store
            .active_for_account(&expiring_account, 7_000)
            .await
            .unwrap()
            .is_none());
    }
}
