use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use utoipa::ToSchema;

use super::clock::{SharedClock, day_bucket, minute_bucket};
use super::decision::{Admission, Decision, DenyReason};
use super::inflight::{InflightGate, InflightPermit};
use crate::error::GateError;
use crate::store::{
    Credential, CredentialsStore, EventsStore, Plan, Subscription, SubscriptionsStore, TokensStore,
};

/// In-memory fixed-window counter for the minute limit. The bucket rolls
/// forward lazily; the day and month counters live in storage.
struct MinuteWindow {
    bucket: u64,
    count: u64,
}

/// Everything needed to evaluate one request, loaded up front
struct RequestContext {
    credential: Credential,
    subscription: Subscription,
    plan: Plan,
}

/// Outcome of `admit`: an admission plus the in-flight permit, or a refusal.
/// Dropping the permit releases the in-flight slot on every exit path.
pub enum Admit {
    Granted {
        admission: Admission,
        permit: InflightPermit,
    },
    Refused(DenyReason),
}

/// Read-only view of a credential's current consumption
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub minute_used: u64,
    pub minute_limit: u64,
    pub day_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_limit: Option<u64>,
    pub month_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month_limit: Option<u64>,
}

/// Decides whether to admit requests and accounts for admitted consumption.
///
/// The three-counter check-and-increment runs under a per-credential lock
/// (plus a per-subscription lock for the monthly counter), so concurrent
/// callers can never both observe capacity and both increment past a limit.
/// There is no global lock across credentials.
pub struct QuotaEngine {
    clock: SharedClock,
    credentials: CredentialsStore,
    subscriptions: SubscriptionsStore,
    events: EventsStore,
    tokens: TokensStore,
    inflight: InflightGate,
    minute_windows: StdMutex<HashMap<String, Arc<AsyncMutex<MinuteWindow>>>>,
    subscription_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl QuotaEngine {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_events(clock, EventsStore::new())
    }

    /// Seam for tests that need a misbehaving event store; production code
    /// always goes through `new`.
    fn with_events(clock: SharedClock, events: EventsStore) -> Self {
        Self {
            clock,
            credentials: CredentialsStore::new(),
            subscriptions: SubscriptionsStore::new(),
            events,
            tokens: TokensStore::new(),
            inflight: InflightGate::new(),
            minute_windows: StdMutex::new(HashMap::new()),
            subscription_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn minute_window_handle(&self, credential_id: &str) -> Arc<AsyncMutex<MinuteWindow>> {
        let mut guard = self.minute_windows.lock().unwrap();
        guard
            .entry(credential_id.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(MinuteWindow {
                    bucket: 0,
                    count: 0,
                }))
            })
            .clone()
    }

    fn subscription_lock_handle(&self, subscription_id: &str) -> Arc<AsyncMutex<()>> {
        let mut guard = self.subscription_locks.lock().unwrap();
        guard
            .entry(subscription_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Resolve credential, active subscription, and plan, turning every
    /// failure mode into its deny reason.
    async fn load_context(&self, credential_id: &str) -> Result<RequestContext, DenyReason> {
        let now = self.clock.now_ms();

        let credential = match self.credentials.get(credential_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return Err(DenyReason::CredentialInactive),
            Err(e) => {
                warn!("credential lookup failed: {e}");
                return Err(DenyReason::InternalError);
            }
        };
        if !credential.enabled {
            return Err(DenyReason::CredentialInactive);
        }
        if credential.is_expired(now) {
            return Err(DenyReason::CredentialExpired);
        }

        let (subscription, plan) = match self
            .subscriptions
            .active_for_account(&credential.account_id, now)
            .await
        {
            Ok(Some(pair)) => pair,
            Ok(None) => return Err(DenyReason::NoActiveSubscription),
            Err(e) => {
                warn!("subscription lookup failed: {e}");
                return Err(DenyReason::InternalError);
            }
        };

        Ok(RequestContext {
            credential,
            subscription,
            plan,
        })
    }

    /// Check minute, day, and month limits in that order and, on allow,
    /// atomically increment all three counters and append a usage event.
    /// Denial leaves every counter untouched.
    pub async fn check_and_reserve(
        &self,
        credential_id: &str,
        endpoint: &str,
        cost: u64,
    ) -> Decision {
        match self.load_context(credential_id).await {
            Ok(ctx) => self.reserve(&ctx, endpoint, cost).await,
            Err(reason) => Decision::Deny(reason),
        }
    }

    /// `check_and_reserve` plus the concurrent-request gate. The permit is
    /// claimed before the counters so a refusal on concurrency consumes no
    /// quota.
    pub async fn admit(&self, credential_id: &str, endpoint: &str, cost: u64) -> Admit {
        let ctx = match self.load_context(credential_id).await {
            Ok(ctx) => ctx,
            Err(reason) => return Admit::Refused(reason),
        };

        let Some(permit) = self
            .inflight
            .try_acquire(&ctx.credential.id, ctx.plan.concurrent_limit)
        else {
            return Admit::Refused(DenyReason::ConcurrencyExceeded);
        };

        match self.reserve(&ctx, endpoint, cost).await {
            Decision::Allow(admission) => Admit::Granted { admission, permit },
            Decision::Deny(reason) => Admit::Refused(reason),
        }
    }

    async fn reserve(&self, ctx: &RequestContext, endpoint: &str, cost: u64) -> Decision {
        let now = self.clock.now_ms();

        let window = self.minute_window_handle(&ctx.credential.id);
        let mut win = window.lock().await;
        let cycle_lock = self.subscription_lock_handle(&ctx.subscription.id);
        let _cycle_guard = cycle_lock.lock().await;

        // Minute window: roll the bucket lazily; a timestamp exactly on the
        // boundary lands in the new bucket
        let bucket = minute_bucket(now);
        if win.bucket != bucket {
            win.bucket = bucket;
            win.count = 0;
        }
        let minute_limit = ctx
            .credential
            .limits
            .rate_limit_per_minute
            .unwrap_or(ctx.plan.rate_limit_per_minute);
        if win.count + cost > minute_limit {
            return Decision::Deny(DenyReason::RateMinuteExceeded);
        }

        // Day counter (durable, per credential)
        let day = day_bucket(now);
        let day_used = match self.events.day_count(&ctx.credential.id, day).await {
            Ok(v) => v,
            Err(e) => {
                warn!("day counter read failed: {e}");
                return Decision::Deny(DenyReason::InternalError);
            }
        };
        if let Some(limit) = ctx.credential.limits.rate_limit_per_day
            && day_used + cost > limit
        {
            return Decision::Deny(DenyReason::RateDayExceeded);
        }

        // Monthly quota, re-read under the cycle lock so a concurrent reset
        // cannot race the increment. An absent plan limit skips the check.
        let cycle_used = match self.subscriptions.cycle_usage(&ctx.subscription.id).await {
            Ok(Some(v)) => v,
            Ok(None) => return Decision::Deny(DenyReason::NoActiveSubscription),
            Err(e) => {
                warn!("cycle usage read failed: {e}");
                return Decision::Deny(DenyReason::InternalError);
            }
        };
        if let Some(limit) = ctx.plan.monthly_request_limit
            && cycle_used + cost > limit
        {
            return Decision::Deny(DenyReason::QuotaMonthExceeded);
        }

        // Durable increments + event append. Any failure fails closed; a
        // partial increment can leave counters high but never admits an
        // unaccounted request.
        if let Err(e) = self.events.add_day_count(&ctx.credential.id, day, cost).await {
            warn!("day counter increment failed: {e}");
            return Decision::Deny(DenyReason::InternalError);
        }
        if let Err(e) = self
            .subscriptions
            .add_cycle_usage(&ctx.subscription.id, cost)
            .await
        {
            warn!("cycle usage increment failed: {e}");
            return Decision::Deny(DenyReason::InternalError);
        }
        let event_id = match self
            .events
            .append(&ctx.credential.id, &ctx.credential.account_id, endpoint, now, cost)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("usage event append failed: {e}");
                return Decision::Deny(DenyReason::InternalError);
            }
        };

        win.count += cost;

        if let Err(e) = self.credentials.touch(&ctx.credential.id, now).await {
            warn!("failed to touch credential {}: {e}", ctx.credential.id);
        }

        Decision::Allow(Admission {
            event_id,
            minute_remaining: Some(minute_limit.saturating_sub(win.count)),
            day_remaining: ctx
                .credential
                .limits
                .rate_limit_per_day
                .map(|l| l.saturating_sub(day_used + cost)),
            month_remaining: ctx
                .plan
                .monthly_request_limit
                .map(|l| l.saturating_sub(cycle_used + cost)),
        })
    }

    /// Attach response metadata to an admitted event. A failure here never
    /// revokes the admission already returned to the caller.
    pub async fn record_outcome(
        &self,
        event_id: &str,
        success: bool,
        status_code: u16,
        latency_ms: u64,
    ) -> Result<bool, GateError> {
        self.events
            .record_outcome(event_id, success, status_code, latency_ms)
            .await
    }

    /// Zero a subscription's cycle counter at a billing boundary. Idempotent
    /// within one cycle; serialized against increments for the same
    /// subscription.
    pub async fn reset_cycle(&self, subscription_id: &str, as_of: u64) -> Result<bool, GateError> {
        let cycle_lock = self.subscription_lock_handle(subscription_id);
        let _cycle_guard = cycle_lock.lock().await;
        self.subscriptions.reset_cycle(subscription_id, as_of).await
    }

    /// Delete challenge tokens whose expiry has passed. Pure GC.
    pub async fn expire_stale_tokens(&self, now: u64) -> Result<u64, GateError> {
        self.tokens.expire_stale(now).await
    }

    /// Drop a credential's in-flight semaphore so the next request re-sizes
    /// it from the (possibly changed) plan.
    pub fn forget_inflight(&self, credential_id: &str) {
        self.inflight.forget(credential_id);
    }

    /// Current usage across all three windows, without mutating anything.
    /// Credential and subscription problems surface as the same deny
    /// reasons `check_and_reserve` would report.
    pub async fn current_usage(
        &self,
        credential_id: &str,
    ) -> Result<UsageSnapshot, DenyReason> {
        let ctx = self.load_context(credential_id).await?;
        let now = self.clock.now_ms();

        let window = self.minute_window_handle(&ctx.credential.id);
        let win = window.lock().await;
        let minute_used = if win.bucket == minute_bucket(now) {
            win.count
        } else {
            0
        };
        drop(win);

        let day_used = match self
            .events
            .day_count(&ctx.credential.id, day_bucket(now))
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!("day counter read failed: {e}");
                return Err(DenyReason::InternalError);
            }
        };
        let month_used = match self.subscriptions.cycle_usage(&ctx.subscription.id).await {
            Ok(Some(v)) => v,
            Ok(None) => return Err(DenyReason::NoActiveSubscription),
            Err(e) => {
                warn!("cycle usage read failed: {e}");
                return Err(DenyReason::InternalError);
            }
        };

        Ok(UsageSnapshot {
            minute_used,
            minute_limit: ctx
                .credential
                .limits
                .rate_limit_per_minute
                .unwrap_or(ctx.plan.rate_limit_per_minute),
            day_used,
            day_limit: ctx.credential.limits.rate_limit_per_day,
            month_used,
            month_limit: ctx.plan.monthly_request_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::quota::clock::{DAY_MS, MINUTE_MS, TimeSource};
    use crate::store::{KeyLimits, PlansStore};

    /// Test clock driven by hand
    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn new(start_ms: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(start_ms)))
        }

        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl TimeSource for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// 2024-06-10 00:00:00 UTC, mid-month so cycle tests can cross boundaries
    const BASE_MS: u64 = 1_717_977_600_000;

    struct Fixture {
        engine: Arc<QuotaEngine>,
        clock: Arc<ManualClock>,
        credential_id: String,
        subscription_id: String,
    }

    async fn fixture(
        plan_minute_limit: u64,
        day_limit: Option<u64>,
        monthly_limit: Option<u64>,
        concurrent_limit: u64,
    ) -> Fixture {
        crate::db::init_test_db().await;
        let clock = ManualClock::new(BASE_MS);
        let now = clock.now_ms();

        let plan = PlansStore::new()
            .create(
                &format!("plan-{}", uuid::Uuid::new_v4()),
                900,
                monthly_limit,
                concurrent_limit,
                plan_minute_limit,
                HashMap::new(),
            )
            .await
            .unwrap();

        let account = uuid::Uuid::new_v4().to_string();
        let sub = SubscriptionsStore::new()
            .create(&account, &plan.id, None, 900, now)
            .await
            .unwrap();
        let (cred, _raw) = CredentialsStore::new()
            .create(
                &account,
                "test",
                None,
                KeyLimits {
                    rate_limit_per_minute: None,
                    rate_limit_per_day: day_limit,
                },
                Vec::new(),
                now,
            )
            .await
            .unwrap();

        Fixture {
            engine: Arc::new(QuotaEngine::new(clock.clone())),
            clock,
            credential_id: cred.id,
            subscription_id: sub.id,
        }
    }

    #[tokio::test]
    async fn minute_limit_admits_exactly_the_limit() {
        let f = fixture(60, None, None, 10).await;

        let mut allows = 0;
        let mut denies = Vec::new();
        for _ in 0..61 {
            match f.engine.check_and_reserve(&f.credential_id, "/v1/challenge", 1).await {
                Decision::Allow(_) => allows += 1,
                Decision::Deny(r) => denies.push(r),
            }
        }
        assert_eq!(allows, 60);
        assert_eq!(denies, vec![DenyReason::RateMinuteExceeded]);

        // Next minute bucket admits again
        f.clock.advance(MINUTE_MS);
        assert!(
            f.engine
                .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                .await
                .is_allow()
        );
    }

    #[tokio::test]
    async fn monthly_quota_boundary() {
        let f = fixture(10_000, None, Some(1_000), 10).await;

        // Bring the cycle counter to 999 directly
        SubscriptionsStore::new()
            .add_cycle_usage(&f.subscription_id, 999)
            .await
            .unwrap();

        match f.engine.check_and_reserve(&f.credential_id, "/v1/challenge", 1).await {
            Decision::Allow(admission) => assert_eq!(admission.month_remaining, Some(0)),
            Decision::Deny(r) => panic!("expected allow, got {r}"),
        }
        assert_eq!(
            SubscriptionsStore::new()
                .cycle_usage(&f.subscription_id)
                .await
                .unwrap(),
            Some(1_000)
        );

        match f.engine.check_and_reserve(&f.credential_id, "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::QuotaMonthExceeded) => {}
            other => panic!("expected month quota deny, got {:?}", other.is_allow()),
        }
    }

    #[tokio::test]
    async fn unlimited_monthly_plan_never_hits_quota() {
        let f = fixture(1_000_000, None, None, 10).await;

        for _ in 0..500 {
            assert!(
                f.engine
                    .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                    .await
                    .is_allow()
            );
        }
    }

    #[tokio::test]
    async fn day_limit_enforced_and_rolls_over() {
        let f = fixture(10_000, Some(5), None, 10).await;

        for _ in 0..5 {
            assert!(
                f.engine
                    .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                    .await
                    .is_allow()
            );
        }
        match f.engine.check_and_reserve(&f.credential_id, "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::RateDayExceeded) => {}
            _ => panic!("expected day limit deny"),
        }

        f.clock.advance(DAY_MS);
        assert!(
            f.engine
                .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                .await
                .is_allow()
        );
    }

    #[tokio::test]
    async fn denial_is_side_effect_free() {
        let f = fixture(2, Some(100), Some(100), 10).await;

        for _ in 0..2 {
            assert!(
                f.engine
                    .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                    .await
                    .is_allow()
            );
        }

        let day = day_bucket(f.clock.now_ms());
        let events = EventsStore::new();
        let day_before = events.day_count(&f.credential_id, day).await.unwrap();
        let cycle_before = SubscriptionsStore::new()
            .cycle_usage(&f.subscription_id)
            .await
            .unwrap();

        for _ in 0..5 {
            assert!(
                !f.engine
                    .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                    .await
                    .is_allow()
            );
        }

        assert_eq!(events.day_count(&f.credential_id, day).await.unwrap(), day_before);
        assert_eq!(
            SubscriptionsStore::new()
                .cycle_usage(&f.subscription_id)
                .await
                .unwrap(),
            cycle_before
        );
    }

    #[tokio::test]
    async fn first_violated_constraint_wins() {
        // Minute and month both at their limit after one call; the minute
        // reason must be reported
        let f = fixture(1, None, Some(1), 10).await;

        assert!(
            f.engine
                .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                .await
                .is_allow()
        );
        match f.engine.check_and_reserve(&f.credential_id, "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::RateMinuteExceeded) => {}
            _ => panic!("minute limit must be reported first"),
        }
    }

    #[tokio::test]
    async fn credential_state_reasons() {
        let f = fixture(100, None, None, 10).await;
        let creds = CredentialsStore::new();

        // Unknown credential
        match f.engine.check_and_reserve("no-such-key", "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::CredentialInactive) => {}
            _ => panic!("unknown key must be inactive"),
        }

        // Revoked credential
        creds.set_enabled(&f.credential_id, false).await.unwrap();
        match f.engine.check_and_reserve(&f.credential_id, "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::CredentialInactive) => {}
            _ => panic!("revoked key must be inactive"),
        }
        creds.set_enabled(&f.credential_id, true).await.unwrap();

        // Account without a subscription
        let account = uuid::Uuid::new_v4().to_string();
        let (orphan, _) = creds
            .create(&account, "orphan", None, KeyLimits::default(), Vec::new(), BASE_MS)
            .await
            .unwrap();
        match f.engine.check_and_reserve(&orphan.id, "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::NoActiveSubscription) => {}
            _ => panic!("expected no_active_subscription"),
        }

        // Expired credential
        let (expired, _) = creds
            .create(
                &account,
                "expired",
                Some(BASE_MS - 1),
                KeyLimits::default(),
                Vec::new(),
                BASE_MS - 10_000,
            )
            .await
            .unwrap();
        match f.engine.check_and_reserve(&expired.id, "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::CredentialExpired) => {}
            _ => panic!("expected credential_expired"),
        }
    }

    #[tokio::test]
    async fn reset_cycle_is_idempotent() {
        let f = fixture(10_000, None, Some(1_000), 10).await;
        let subs = SubscriptionsStore::new();

        subs.add_cycle_usage(&f.subscription_id, 10).await.unwrap();

        // ~July 2024, the next billing cycle
        let next_month = BASE_MS + 31 * DAY_MS;
        assert!(f.engine.reset_cycle(&f.subscription_id, next_month).await.unwrap());
        assert_eq!(subs.cycle_usage(&f.subscription_id).await.unwrap(), Some(0));

        subs.add_cycle_usage(&f.subscription_id, 5).await.unwrap();

        // Second reset inside the same cycle is a no-op
        assert!(
            !f.engine
                .reset_cycle(&f.subscription_id, next_month + 1_000)
                .await
                .unwrap()
        );
        assert_eq!(subs.cycle_usage(&f.subscription_id).await.unwrap(), Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_over_admit() {
        let capacity = 5u64;
        let f = fixture(capacity, None, None, 10).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let engine = f.engine.clone();
            let cred = f.credential_id.clone();
            handles.push(tokio::spawn(async move {
                engine.check_and_reserve(&cred, "/v1/challenge", 1).await.is_allow()
            }));
        }

        let mut allows = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allows += 1;
            }
        }
        assert_eq!(allows, capacity);
    }

    #[tokio::test]
    async fn inflight_gate_is_separate_from_rate_limits() {
        let f = fixture(100, None, None, 1).await;

        let first = f.engine.admit(&f.credential_id, "/v1/challenge", 1).await;
        let Admit::Granted { permit, .. } = first else {
            panic!("first admit must be granted");
        };

        match f.engine.admit(&f.credential_id, "/v1/challenge", 1).await {
            Admit::Refused(DenyReason::ConcurrencyExceeded) => {}
            _ => panic!("second in-flight request must be refused"),
        }

        drop(permit);
        assert!(matches!(
            f.engine.admit(&f.credential_id, "/v1/challenge", 1).await,
            Admit::Granted { .. }
        ));
    }

    #[tokio::test]
    async fn usage_snapshot_reflects_counters() {
        let f = fixture(50, Some(100), Some(1_000), 10).await;

        for _ in 0..3 {
            assert!(
                f.engine
                    .check_and_reserve(&f.credential_id, "/v1/challenge", 1)
                    .await
                    .is_allow()
            );
        }

        let snap = f.engine.current_usage(&f.credential_id).await.unwrap();
        assert_eq!(snap.minute_used, 3);
        assert_eq!(snap.minute_limit, 50);
        assert_eq!(snap.day_used, 3);
        assert_eq!(snap.day_limit, Some(100));
        assert_eq!(snap.month_used, 3);
        assert_eq!(snap.month_limit, Some(1_000));
    }

    #[tokio::test]
    async fn usage_reports_credential_state() {
        let f = fixture(50, None, None, 10).await;
        let creds = CredentialsStore::new();

        creds.set_enabled(&f.credential_id, false).await.unwrap();
        assert!(matches!(
            f.engine.current_usage(&f.credential_id).await,
            Err(DenyReason::CredentialInactive)
        ));

        creds.set_enabled(&f.credential_id, true).await.unwrap();
        assert!(f.engine.current_usage(&f.credential_id).await.is_ok());

        assert!(matches!(
            f.engine.current_usage("no-such-key").await,
            Err(DenyReason::CredentialInactive)
        ));
    }

    #[tokio::test]
    async fn storage_failure_fails_closed() {
        let f = fixture(100, None, Some(100), 10).await;

        // Same credential, but an engine whose event writes error
        let clock = ManualClock::new(BASE_MS);
        let engine = QuotaEngine::with_events(clock, EventsStore::failing());

        match engine.check_and_reserve(&f.credential_id, "/v1/challenge", 1).await {
            Decision::Deny(DenyReason::InternalError) => {}
            _ => panic!("a failing store must deny, never admit"),
        }

        // Nothing durable moved: cycle and day counters untouched
        assert_eq!(
            SubscriptionsStore::new()
                .cycle_usage(&f.subscription_id)
                .await
                .unwrap(),
            Some(0)
        );
        let day = day_bucket(BASE_MS);
        assert_eq!(
            EventsStore::new().day_count(&f.credential_id, day).await.unwrap(),
            0
        );
    }
}
