mod config;
mod db;
mod error;
mod quota;
mod routes;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use clap::Parser;
use config::{Config, CorsMode};
use quota::{QuotaEngine, SystemClock};
use store::{CredentialsStore, EventsStore, PlansStore, SubscriptionsStore, TokensStore};
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_axum::{router::OpenApiRouter, routes};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

/// Token GC and subscription expiry sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Usage aggregation cadence
const AGGREGATE_INTERVAL: Duration = Duration::from_secs(600);
/// How many days of durable day counters to keep
const DAY_COUNTER_RETENTION_DAYS: u64 = 35;

pub struct AppState {
    pub plans: PlansStore,
    pub subscriptions: SubscriptionsStore,
    pub credentials: CredentialsStore,
    pub tokens: TokensStore,
    pub engine: Arc<QuotaEngine>,
    pub admin_credentials: (String, String),
    /// When true, admin auth middleware is bypassed (for local development)
    pub disable_auth: bool,
}

#[derive(Parser)]
#[command(name = "captcha-gate")]
#[command(about = "Usage metering and rate limiting for a CAPTCHA service")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "CAPTCHA_GATE_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "CAPTCHA_GATE_PORT")]
    port: Option<u16>,
}

/// Middleware for admin routes authentication (Basic Auth)
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.disable_auth {
        return next.run(request).await;
    }

    let (username, password) = &state.admin_credentials;

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth_value) = auth_header else {
        return unauthorized_response();
    };

    let Some(encoded) = auth_value.strip_prefix("Basic ") else {
        return unauthorized_response();
    };

    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return unauthorized_response();
    };

    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized_response();
    };

    let Some((provided_user, provided_pass)) = credentials.split_once(':') else {
        return unauthorized_response();
    };

    // Constant-time comparison to prevent timing attacks
    let user_match = provided_user.as_bytes().ct_eq(username.as_bytes());
    let pass_match = provided_pass.as_bytes().ct_eq(password.as_bytes());

    if user_match.into() && pass_match.into() {
        next.run(request).await
    } else {
        unauthorized_response()
    }
}

fn unauthorized_response() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

/// Periodic housekeeping: expired token GC and subscription expiry sweep
fn spawn_sweeper(engine: Arc<QuotaEngine>, subscriptions: SubscriptionsStore) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let now = engine.now_ms();

            match engine.expire_stale_tokens(now).await {
                Ok(n) if n > 0 => info!("Collected {n} expired challenge tokens"),
                Ok(_) => {}
                Err(e) => warn!("Token GC failed: {e}"),
            }

            match subscriptions.expire_sweep(now).await {
                Ok(n) if n > 0 => info!("Expired {n} subscriptions"),
                Ok(_) => {}
                Err(e) => warn!("Subscription expiry sweep failed: {e}"),
            }
        }
    });
}

/// Periodic usage aggregation plus day-counter pruning
fn spawn_aggregator(engine: Arc<QuotaEngine>, events: EventsStore) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(AGGREGATE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let now = engine.now_ms();

            match quota::aggregate::aggregate(now).await {
                Ok(outcome) if outcome.daily_events > 0 || outcome.monthly_events > 0 => {
                    info!(
                        "Aggregated {} daily / {} monthly events",
                        outcome.daily_events, outcome.monthly_events
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Usage aggregation failed: {e}"),
            }

            let today = now / (24 * 3600 * 1000);
            if let Err(e) = events
                .prune_day_counters(today, DAY_COUNTER_RETENTION_DAYS)
                .await
            {
                warn!("Day counter pruning failed: {e}");
            }
        }
    });
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    db::init_db(&config.db_path())
        .await
        .expect("Failed to initialize database");

    let host = args.host.unwrap_or(config.host);
    let port = args.port.unwrap_or(config.port);

    let engine = Arc::new(QuotaEngine::new(Arc::new(SystemClock)));

    let disable_auth = config.disable_auth;
    if disable_auth {
        tracing::warn!("Admin authentication is DISABLED (CAPTCHA_GATE_DISABLE_AUTH=1)");
    }

    let state = Arc::new(AppState {
        plans: PlansStore::new(),
        subscriptions: SubscriptionsStore::new(),
        credentials: CredentialsStore::new(),
        tokens: TokensStore::new(),
        engine: engine.clone(),
        admin_credentials: (config.admin_username, config.admin_password),
        disable_auth,
    });

    spawn_sweeper(engine.clone(), SubscriptionsStore::new());
    spawn_aggregator(engine, EventsStore::new());

    // CORS configuration based on environment
    let cors_origins = config.cors_mode.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    // Admin API routes with OpenAPI spec generation
    let (api_router, openapi) = OpenApiRouter::with_openapi(Default::default())
        // Plans
        .routes(routes!(routes::admin::create_plan, routes::admin::list_plans))
        .routes(routes!(
            routes::admin::update_plan,
            routes::admin::delete_plan
        ))
        .routes(routes!(routes::admin::reorder_plans))
        // Subscriptions
        .routes(routes!(
            routes::admin::create_subscription,
            routes::admin::list_subscriptions
        ))
        .routes(routes!(routes::admin::cancel_subscription))
        .routes(routes!(routes::admin::suspend_subscription))
        .routes(routes!(routes::admin::resume_subscription))
        .routes(routes!(routes::admin::reset_subscription_cycle))
        // Keys
        .routes(routes!(routes::admin::create_key, routes::admin::list_keys))
        .routes(routes!(routes::admin::delete_key))
        .routes(routes!(routes::admin::set_key_enabled))
        .routes(routes!(routes::admin::update_key_limits))
        .routes(routes!(routes::admin::set_key_origins))
        .routes(routes!(routes::admin::get_key_usage))
        // Usage
        .routes(routes!(routes::admin::get_usage_timeseries))
        .routes(routes!(routes::admin::get_usage_by_key))
        .routes(routes!(routes::admin::get_daily_summaries))
        .routes(routes!(routes::admin::get_monthly_summaries))
        .split_for_parts();

    // Swagger UI + OpenAPI spec (accessible without authentication)
    let swagger_routes = Router::new().merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger").url("/api-docs/openapi.json", openapi),
    );

    // Protected admin routes (Basic Auth)
    let protected_routes = api_router.layer(middleware::from_fn_with_state(
        state.clone(),
        admin_auth_middleware,
    ));

    let admin_routes = Router::new().merge(swagger_routes).merge(protected_routes);

    // Metered client API
    let api_routes = Router::new()
        .route("/challenge", post(routes::captcha::create_challenge))
        .route("/verify", post(routes::captcha::verify_token))
        .route("/usage", get(routes::captcha::usage));

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .nest("/admin", admin_routes)
            .nest("/v1", api_routes)
            .layer(cors)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting captcha-gate v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);
    info!("Admin API: http://{}/admin (docs at /admin/swagger)", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .await
    .unwrap();
}
