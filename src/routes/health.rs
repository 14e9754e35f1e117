use axum::response::Json;
use serde_json::{Value, json};

use crate::{BUILD_TIME, GIT_HASH, VERSION};

/// Liveness plus storage readiness. Reports "degraded" once the database
/// stops handing out connections, since every admission decision fails
/// closed without one.
pub async fn health() -> Json<Value> {
    let database = crate::db::get_conn().is_ok();
    Json(json!({
        "status": if database { "ok" } else { "degraded" },
        "database": database,
    }))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "service": "captcha-gate",
        "version": VERSION,
        "git_hash": GIT_HASH,
        "build_time": BUILD_TIME,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_database_readiness() {
        crate::db::init_test_db().await;
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], true);
    }

    #[tokio::test]
    async fn version_names_the_service() {
        let Json(body) = version().await;
        assert_eq!(body["service"], "captcha-gate");
        assert!(body["version"].is_string());
    }
}
