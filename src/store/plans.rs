use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::{self, get_u64, opt_u64};
use crate::error::GateError;

/// A service-tier catalog entry. Referenced by subscriptions and never
/// deleted while one points at it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    /// Monthly request quota; None = unlimited
    pub monthly_request_limit: Option<u64>,
    pub concurrent_limit: u64,
    pub rate_limit_per_minute: u64,
    /// Capability name -> bool/string flags
    #[serde(default)]
    pub features: HashMap<String, serde_json::Value>,
    pub enabled: bool,
    pub sort_order: i64,
}

fn features_from_json(raw: Option<String>) -> HashMap<String, serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn plan_from_row(row: &turso::Row) -> Option<Plan> {
    let id = row.get::<String>(0).ok()?;
    Some(Plan {
        id,
        name: row.get::<String>(1).unwrap_or_default(),
        price_cents: row.get::<i64>(2).unwrap_or(0),
        monthly_request_limit: opt_u64(row, 3),
        concurrent_limit: get_u64(row, 4),
        rate_limit_per_minute: get_u64(row, 5),
        features: features_from_json(row.get::<Option<String>>(6).ok().flatten()),
        enabled: row.get::<i64>(7).unwrap_or(1) != 0,
        sort_order: row.get::<i64>(8).unwrap_or(0),
    })
}

const PLAN_COLUMNS: &str = "id, name, price_cents, monthly_request_limit, concurrent_limit, \
                            rate_limit_per_minute, features, enabled, sort_order";

pub struct PlansStore;

impl PlansStore {
    pub fn new() -> Self {
        Self
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        name: &str,
        price_cents: i64,
        monthly_request_limit: Option<u64>,
        concurrent_limit: u64,
        rate_limit_per_minute: u64,
        features: HashMap<String, serde_json::Value>,
    ) -> Result<Plan, GateError> {
        let conn = db::get_conn()?;

        // Append at the end of the display order
        let mut rows = conn
            .query("SELECT COALESCE(MAX(sort_order), -1) + 1 FROM plans", ())
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to get max sort_order: {e}")))?;
        let next_order: i64 = rows
            .next()
            .await
            .ok()
            .flatten()
            .and_then(|r| r.get::<i64>(0).ok())
            .unwrap_or(0);

        let plan = Plan {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            price_cents,
            monthly_request_limit,
            concurrent_limit,
            rate_limit_per_minute,
            features,
            enabled: true,
            sort_order: next_order,
        };

        let features_json = serde_json::to_string(&plan.features)
            .map_err(|e| GateError::DatabaseError(format!("Failed to encode features: {e}")))?;

        conn.execute(
            "INSERT INTO plans (id, name, price_cents, monthly_request_limit, concurrent_limit, \
             rate_limit_per_minute, features, enabled, sort_order) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)",
            (
                plan.id.as_str(),
                plan.name.as_str(),
                plan.price_cents,
                plan.monthly_request_limit.map(|v| v as i64),
                plan.concurrent_limit as i64,
                plan.rate_limit_per_minute as i64,
                features_json.as_str(),
                plan.sort_order,
            ),
        )
        .await
        .map_err(|e| {
            let msg = e.to_string();
            if msg.contains("UNIQUE") {
                GateError::Conflict(format!("Plan '{name}' already exists"))
            } else {
                GateError::DatabaseError(format!("Failed to create plan: {msg}"))
            }
        })?;

        Ok(plan)
    }

    pub async fn list(&self) -> Result<Vec<Plan>, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query(
                &format!("SELECT {PLAN_COLUMNS} FROM plans ORDER BY sort_order"),
                (),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to list plans: {e}")))?;

        let mut plans = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Some(plan) = plan_from_row(&row) {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Plan>, GateError> {
        let conn = db::get_conn()?;
        let mut rows = conn
            .query(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = ?"), [id])
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to get plan: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to read plan row: {e}")))?
        else {
            return Ok(None);
        };
        Ok(plan_from_row(&row))
    }

    /// Partial update; None fields keep their current values
    #[allow(clippy::too_many_arguments)]
    pub async fn update(
        &self,
        id: &str,
        price_cents: Option<i64>,
        monthly_request_limit: Option<Option<u64>>,
        concurrent_limit: Option<u64>,
        rate_limit_per_minute: Option<u64>,
        enabled: Option<bool>,
    ) -> Result<bool, GateError> {
        let conn = db::get_conn()?;

        // monthly_request_limit is itself nullable, so "don't change" and
        // "set unlimited" need different encodings
        if let Some(limit) = monthly_request_limit {
            conn.execute(
                "UPDATE plans SET monthly_request_limit = ? WHERE id = ?",
                (limit.map(|v| v as i64), id),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to update plan quota: {e}")))?;
        }

        let affected = conn
            .execute(
                "UPDATE plans SET \
                 price_cents = COALESCE(?, price_cents), \
                 concurrent_limit = COALESCE(?, concurrent_limit), \
                 rate_limit_per_minute = COALESCE(?, rate_limit_per_minute), \
                 enabled = COALESCE(?, enabled) \
                 WHERE id = ?",
                (
                    price_cents,
                    concurrent_limit.map(|v| v as i64),
                    rate_limit_per_minute.map(|v| v as i64),
                    enabled.map(|v| v as i64),
                    id,
                ),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to update plan: {e}")))?;
        Ok(affected > 0)
    }

    /// Delete a plan. Restricted while any subscription references it.
    pub async fn delete(&self, id: &str) -> Result<bool, GateError> {
        let conn = db::get_conn()?;

        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM subscriptions WHERE plan_id = ?",
                [id],
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to check plan refs: {e}")))?;
        let refs: i64 = rows
            .next()
            .await
            .ok()
            .flatten()
            .and_then(|r| r.get::<i64>(0).ok())
            .unwrap_or(0);

        if refs > 0 {
            return Err(GateError::Conflict(
                "Plan is referenced by subscriptions and cannot be deleted".into(),
            ));
        }

        let affected = conn
            .execute("DELETE FROM plans WHERE id = ?", [id])
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to delete plan: {e}")))?;
        Ok(affected > 0)
    }

    /// Reorder plans (accepts list of plan IDs in desired display order)
    pub async fn reorder(&self, ids: Vec<String>) -> Result<(), GateError> {
        let conn = db::get_conn()?;
        for (i, id) in ids.iter().enumerate() {
            conn.execute(
                "UPDATE plans SET sort_order = ? WHERE id = ?",
                (i as i64, id.as_str()),
            )
            .await
            .map_err(|e| GateError::DatabaseError(format!("Failed to reorder plans: {e}")))?;
        }
        Ok(())
    }
}

impl Default for PlansStore {
    fn default() -> Self {
        Self::new()
    }
}
