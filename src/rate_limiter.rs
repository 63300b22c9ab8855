// =============================================================================
// Aggressive Rate Limiter — per-endpoint windows, bans, emergency latch
// =============================================================================
//
// Defends the exchange-facing surface from exceeding per-endpoint and global
// limits, punishes repeat offenders with escalating bans, and latches an
// emergency stop on systemic breach.
//
// Locking: one Mutex around deque/counter state, held only for mutation —
// never across IO. The emergency latch mirrors into `AccountState` (the
// authoritative flag) strictly AFTER the limiter lock is released.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::account_state::AccountState;
use crate::config::{RateLimiterConfig, RequestKind};
use crate::errors::OrderError;

/// Window horizon used by the periodic cleanup.
const WINDOW_RETENTION: Duration = Duration::from_secs(3600);
/// Violations are discarded after this age.
const VIOLATION_RETENTION: Duration = Duration::from_secs(24 * 3600);
/// Hard cap on any single request-timestamp deque.
const WINDOW_CAP: usize = 1000;
/// Ban ceiling in seconds.
const MAX_BAN_SECS: u64 = 300;
/// Adaptive-delay bounds and steps.
const DELAY_FLOOR: f64 = 0.1;
const DELAY_CAP: f64 = 10.0;
const DELAY_DECAY: f64 = 0.8;
const DELAY_GROWTH: f64 = 1.5;
/// Successes in a row before the adaptive delay starts shrinking.
const SUCCESS_STREAK_THRESHOLD: u32 = 5;

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

/// How badly a limit was breached, from the count/limit ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ViolationSeverity {
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.0 {
            Self::Critical
        } else if ratio >= 0.9 {
            Self::High
        } else if ratio >= 0.7 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone)]
struct Violation {
    limit_type: String,
    current: u32,
    limit: u32,
    severity: ViolationSeverity,
    client_id: String,
    at: Instant,
    at_utc: DateTime<Utc>,
}

/// Serialisable view of a recorded violation.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationSnapshot {
    pub limit_type: String,
    pub client: String,
    pub severity: ViolationSeverity,
    pub timestamp: String,
    pub current: u32,
    pub limit: u32,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct LimiterStats {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub violations: u64,
    pub emergency_activations: u64,
    pub banned_clients: u64,
    pub emergency_stop_active: bool,
    pub emergency_reason: Option<String>,
    pub active_bans: usize,
    pub total_violations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointUsage {
    pub current: u32,
    pub limit: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub client_id: String,
    pub is_banned: bool,
    pub ban_expires_in_secs: Option<u64>,
    pub violation_count: u32,
    pub current_requests: HashMap<String, EndpointUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatus {
    pub emergency_stop_active: bool,
    pub emergency_reason: Option<String>,
    pub emergency_since: Option<String>,
    pub banned_clients_count: usize,
    pub total_violations: usize,
    pub stats: LimiterStats,
    pub recent_violations: Vec<ViolationSnapshot>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    client_id: String,
    symbol: Option<String>,
    kind: RequestKind,
}

struct EmergencyState {
    reason: String,
    since: DateTime<Utc>,
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    blocked_requests: u64,
    violations: u64,
    emergency_activations: u64,
    banned_clients: u64,
}

struct Inner {
    windows: HashMap<WindowKey, VecDeque<Instant>>,
    violations: Vec<Violation>,
    banned: HashMap<String, Instant>,
    violation_counts: HashMap<String, u32>,
    adaptive_delays: HashMap<String, f64>,
    success_streak: HashMap<String, u32>,
    failure_streak: HashMap<String, u32>,
    emergency: Option<EmergencyState>,
    stats: StatsInner,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Aggressive request gate in front of every exchange call.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    account: Arc<AccountState>,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig, account: Arc<AccountState>) -> Self {
        info!(
            global_per_minute = cfg.global_per_minute,
            global_per_second = cfg.global_per_second,
            "RateLimiter initialised"
        );
        Self {
            cfg,
            account,
            inner: Mutex::new(Inner {
                windows: HashMap::new(),
                violations: Vec::new(),
                banned: HashMap::new(),
                violation_counts: HashMap::new(),
                adaptive_delays: HashMap::new(),
                success_streak: HashMap::new(),
                failure_streak: HashMap::new(),
                emergency: None,
                stats: StatsInner::default(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Acquisition
    // -------------------------------------------------------------------------

    /// Record a request if permitted, reject otherwise.
    ///
    /// Check order: emergency latch, client ban, global ceilings, endpoint
    /// limits (minute → second → 10 s burst), then record + threshold warning.
    pub fn acquire(
        &self,
        kind: RequestKind,
        client_id: &str,
        symbol: Option<&str>,
    ) -> Result<(), OrderError> {
        let now = Instant::now();
        let mut latch_reason: Option<String> = None;

        let result = {
            let mut inner = self.inner.lock();
            inner.stats.total_requests += 1;
            self.acquire_locked(&mut inner, kind, client_id, symbol, now, &mut latch_reason)
        };

        // Mirror the latch into the authoritative flag outside our own lock.
        if let Some(reason) = latch_reason {
            self.account.latch_emergency_stop(&reason);
        }

        result
    }

    fn acquire_locked(
        &self,
        inner: &mut Inner,
        kind: RequestKind,
        client_id: &str,
        symbol: Option<&str>,
        now: Instant,
        latch_reason: &mut Option<String>,
    ) -> Result<(), OrderError> {
        // 1. Emergency latch.
        if let Some(em) = &inner.emergency {
            inner.stats.blocked_requests += 1;
            return Err(OrderError::EmergencyStop {
                reason: format!("{} (since {})", em.reason, em.since.to_rfc3339()),
            });
        }

        // 2. Client bans.
        if let Some(until) = inner.banned.get(client_id).copied() {
            if now < until {
                inner.stats.blocked_requests += 1;
                let remaining = (until - now).as_secs();
                return Err(OrderError::RateLimitExceeded {
                    scope: client_id.to_string(),
                    message: format!("client banned for another {remaining}s"),
                });
            }
            // Ban elapsed — clear it together with the violation counter.
            inner.banned.remove(client_id);
            inner.violation_counts.insert(client_id.to_string(), 0);
            info!(client_id, "client ban elapsed — unbanned");
        }

        // 3. Global ceilings across all clients.
        let minute = Duration::from_secs(60);
        let second = Duration::from_secs(1);
        let mut global_minute: u32 = 0;
        let mut global_second: u32 = 0;
        for window in inner.windows.values() {
            for &ts in window.iter() {
                let age = now.duration_since(ts);
                if age < minute {
                    global_minute += 1;
                    if age < second {
                        global_second += 1;
                    }
                }
            }
        }

        if global_minute >= self.cfg.global_per_minute {
            let reason = format!(
                "global limit breached: {global_minute}/{} requests per minute",
                self.cfg.global_per_minute
            );
            Self::activate_emergency(inner, &reason, latch_reason);
            inner.stats.blocked_requests += 1;
            return Err(OrderError::RateLimitExceeded {
                scope: "global".to_string(),
                message: reason,
            });
        }
        if global_second >= self.cfg.global_per_second {
            inner.stats.blocked_requests += 1;
            return Err(OrderError::RateLimitExceeded {
                scope: "global".to_string(),
                message: format!(
                    "global limit breached: {global_second}/{} requests per second",
                    self.cfg.global_per_second
                ),
            });
        }

        // 4. Endpoint limits (unknown kinds fall back to the strictest table).
        let limits = self.cfg.limits_for(kind);
        let key = WindowKey {
            client_id: client_id.to_string(),
            symbol: symbol.map(|s| s.to_string()),
            kind,
        };

        let window = inner.windows.entry(key.clone()).or_default();
        while window
            .front()
            .is_some_and(|&ts| now.duration_since(ts) >= minute)
        {
            window.pop_front();
        }

        let minute_count = window.len() as u32;
        let second_count = window
            .iter()
            .filter(|&&ts| now.duration_since(ts) < second)
            .count() as u32;
        let burst = Duration::from_secs(10);
        let burst_count = window
            .iter()
            .filter(|&&ts| now.duration_since(ts) < burst)
            .count() as u32;

        if minute_count >= limits.per_minute {
            let violation = Violation {
                limit_type: format!("{kind}_per_minute"),
                current: minute_count,
                limit: limits.per_minute,
                severity: ViolationSeverity::from_ratio(
                    minute_count as f64 / limits.per_minute as f64,
                ),
                client_id: client_id.to_string(),
                at: now,
                at_utc: Utc::now(),
            };
            self.handle_violation(inner, violation, latch_reason);
            inner.stats.blocked_requests += 1;
            return Err(OrderError::RateLimitExceeded {
                scope: format!("{client_id}:{kind}"),
                message: format!(
                    "{minute_count}/{} requests per minute",
                    limits.per_minute
                ),
            });
        }
        if second_count >= limits.per_second {
            inner.stats.blocked_requests += 1;
            return Err(OrderError::RateLimitExceeded {
                scope: format!("{client_id}:{kind}"),
                message: format!(
                    "{second_count}/{} requests per second",
                    limits.per_second
                ),
            });
        }
        if burst_count >= limits.burst_limit {
            inner.stats.blocked_requests += 1;
            return Err(OrderError::RateLimitExceeded {
                scope: format!("{client_id}:{kind}"),
                message: format!(
                    "burst of {burst_count}/{} requests in 10s",
                    limits.burst_limit
                ),
            });
        }

        // 5. Record, capped.
        let window = inner.windows.get_mut(&key).expect("window created above");
        window.push_back(now);
        while window.len() > WINDOW_CAP {
            window.pop_front();
        }

        // 6. Warn when approaching the minute ceiling.
        let after = minute_count + 1;
        let threshold = (limits.per_minute as f64 * limits.emergency_threshold) as u32;
        if after >= threshold {
            warn!(
                client_id,
                endpoint = %kind,
                current = after,
                limit = limits.per_minute,
                "approaching rate limit"
            );
        }

        debug!(client_id, endpoint = %kind, symbol = ?symbol, "request permitted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Violation handling
    // -------------------------------------------------------------------------

    fn handle_violation(
        &self,
        inner: &mut Inner,
        violation: Violation,
        latch_reason: &mut Option<String>,
    ) {
        inner.stats.violations += 1;
        let count = inner
            .violation_counts
            .entry(violation.client_id.clone())
            .or_insert(0);
        *count += 1;
        let client_violations = *count;

        error!(
            limit_type = %violation.limit_type,
            current = violation.current,
            limit = violation.limit,
            client = %violation.client_id,
            violations = client_violations,
            "rate limit violation"
        );

        // Escalating ban for repeat offenders.
        if client_violations >= self.cfg.ban_escalation_threshold {
            let ban_secs = MAX_BAN_SECS.min(60 * client_violations as u64);
            inner.banned.insert(
                violation.client_id.clone(),
                violation.at + Duration::from_secs(ban_secs),
            );
            inner.stats.banned_clients += 1;
            error!(
                client = %violation.client_id,
                ban_secs,
                violations = client_violations,
                "client banned for repeated violations"
            );
        }

        // Systemic breach latches the emergency stop.
        if violation.severity >= ViolationSeverity::Critical
            || client_violations >= self.cfg.emergency_violation_threshold
        {
            let reason = format!(
                "critical rate violation: {} by client {}",
                violation.limit_type, violation.client_id
            );
            Self::activate_emergency(inner, &reason, latch_reason);
        }

        inner.violations.push(violation);
    }

    fn activate_emergency(inner: &mut Inner, reason: &str, latch_reason: &mut Option<String>) {
        if inner.emergency.is_none() {
            inner.emergency = Some(EmergencyState {
                reason: reason.to_string(),
                since: Utc::now(),
            });
            inner.stats.emergency_activations += 1;
            error!(reason, "rate limiter EMERGENCY STOP latched");
            *latch_reason = Some(reason.to_string());
        }
    }

    /// Release the emergency latch. Requires an explicit admin override; the
    /// authoritative `AccountState` flag is cleared as well.
    pub fn deactivate_emergency_stop(&self, admin_override: bool) -> bool {
        if !admin_override {
            return false;
        }

        let was_latched = {
            let mut inner = self.inner.lock();
            inner.emergency.take().is_some()
        };

        let account_was_latched = self.account.emergency_stop();
        self.account.set_emergency_stop(false);

        if was_latched || account_was_latched {
            info!("emergency stop deactivated by administrator");
            true
        } else {
            false
        }
    }

    // -------------------------------------------------------------------------
    // Preflight
    // -------------------------------------------------------------------------

    /// Side-effect-free check: would `acquire` succeed right now? Recomputes
    /// the adaptive-delay hint but never records a request.
    pub fn can_make_request(
        &self,
        kind: RequestKind,
        client_id: &str,
        symbol: Option<&str>,
    ) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock();

        if inner.emergency.is_some() {
            return false;
        }
        if let Some(until) = inner.banned.get(client_id) {
            if now < *until {
                return false;
            }
        }

        let limits = self.cfg.limits_for(kind);
        let key = WindowKey {
            client_id: client_id.to_string(),
            symbol: symbol.map(|s| s.to_string()),
            kind,
        };

        let minute = Duration::from_secs(60);
        let second = Duration::from_secs(1);

        match inner.windows.get(&key) {
            None => true,
            Some(window) => {
                let minute_count = window
                    .iter()
                    .filter(|&&ts| now.duration_since(ts) < minute)
                    .count() as u32;
                let second_count = window
                    .iter()
                    .filter(|&&ts| now.duration_since(ts) < second)
                    .count() as u32;
                minute_count < limits.per_minute && second_count < limits.per_second
            }
        }
    }

    /// Current adaptive delay hint for an endpoint, in seconds.
    pub fn adaptive_delay(&self, endpoint: &str) -> f64 {
        self.inner
            .lock()
            .adaptive_delays
            .get(endpoint)
            .copied()
            .unwrap_or(1.0)
    }

    /// Shrink the adaptive delay after a success streak.
    pub fn record_api_success(&self, endpoint: &str) {
        let mut inner = self.inner.lock();
        let streak = inner.success_streak.entry(endpoint.to_string()).or_insert(0);
        *streak += 1;
        let streak = *streak;
        inner.failure_streak.insert(endpoint.to_string(), 0);

        if streak >= SUCCESS_STREAK_THRESHOLD {
            let delay = inner
                .adaptive_delays
                .entry(endpoint.to_string())
                .or_insert(1.0);
            *delay = (*delay * DELAY_DECAY).max(DELAY_FLOOR);
        }
    }

    /// Grow the adaptive delay on failure.
    pub fn record_api_failure(&self, endpoint: &str) {
        let mut inner = self.inner.lock();
        let streak = inner.failure_streak.entry(endpoint.to_string()).or_insert(0);
        *streak += 1;
        inner.success_streak.insert(endpoint.to_string(), 0);

        let delay = inner
            .adaptive_delays
            .entry(endpoint.to_string())
            .or_insert(1.0);
        *delay = (*delay * DELAY_GROWTH).min(DELAY_CAP);
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> LimiterStats {
        let inner = self.inner.lock();
        LimiterStats {
            total_requests: inner.stats.total_requests,
            blocked_requests: inner.stats.blocked_requests,
            violations: inner.stats.violations,
            emergency_activations: inner.stats.emergency_activations,
            banned_clients: inner.stats.banned_clients,
            emergency_stop_active: inner.emergency.is_some(),
            emergency_reason: inner.emergency.as_ref().map(|e| e.reason.clone()),
            active_bans: inner.banned.len(),
            total_violations: inner.violations.len(),
        }
    }

    pub fn client_status(&self, client_id: &str) -> ClientStatus {
        let inner = self.inner.lock();
        let now = Instant::now();

        let ban_expires_in_secs = inner.banned.get(client_id).and_then(|&until| {
            (now < until).then(|| (until - now).as_secs())
        });

        let minute = Duration::from_secs(60);
        let mut current_requests: HashMap<String, EndpointUsage> = HashMap::new();
        for (key, window) in &inner.windows {
            if key.client_id != client_id {
                continue;
            }
            let count = window
                .iter()
                .filter(|&&ts| now.duration_since(ts) < minute)
                .count() as u32;
            let limit = self.cfg.limits_for(key.kind).per_minute;
            let usage = current_requests
                .entry(key.kind.to_string())
                .or_insert(EndpointUsage {
                    current: 0,
                    limit,
                    percentage: 0.0,
                });
            usage.current += count;
            usage.percentage = if limit > 0 {
                (usage.current as f64 / limit as f64) * 100.0
            } else {
                0.0
            };
        }

        ClientStatus {
            client_id: client_id.to_string(),
            is_banned: ban_expires_in_secs.is_some(),
            ban_expires_in_secs,
            violation_count: inner.violation_counts.get(client_id).copied().unwrap_or(0),
            current_requests,
        }
    }

    pub fn global_status(&self) -> GlobalStatus {
        let stats = self.stats();
        let inner = self.inner.lock();

        let recent_violations = inner
            .violations
            .iter()
            .rev()
            .take(10)
            .map(|v| ViolationSnapshot {
                limit_type: v.limit_type.clone(),
                client: v.client_id.clone(),
                severity: v.severity,
                timestamp: v.at_utc.to_rfc3339(),
                current: v.current,
                limit: v.limit,
            })
            .collect();

        GlobalStatus {
            emergency_stop_active: inner.emergency.is_some(),
            emergency_reason: inner.emergency.as_ref().map(|e| e.reason.clone()),
            emergency_since: inner.emergency.as_ref().map(|e| e.since.to_rfc3339()),
            banned_clients_count: inner.banned.len(),
            total_violations: inner.violations.len(),
            stats,
            recent_violations,
        }
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    /// One cleanup pass: evict stale window entries, discard old violations,
    /// and release expired bans.
    pub fn cleanup_once(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        for window in inner.windows.values_mut() {
            while window
                .front()
                .is_some_and(|&ts| now.duration_since(ts) >= WINDOW_RETENTION)
            {
                window.pop_front();
            }
        }
        inner.windows.retain(|_, w| !w.is_empty());

        inner
            .violations
            .retain(|v| now.duration_since(v.at) <= VIOLATION_RETENTION);

        let expired: Vec<String> = inner
            .banned
            .iter()
            .filter(|(_, &until)| now >= until)
            .map(|(client, _)| client.clone())
            .collect();
        for client in expired {
            inner.banned.remove(&client);
            inner.violation_counts.insert(client.clone(), 0);
            info!(client, "expired ban released by cleanup");
        }
    }

    /// Spawn the periodic cleanup loop.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = Duration::from_secs(self.cfg.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                limiter.cleanup_once();
            }
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RateLimiter")
            .field("windows", &inner.windows.len())
            .field("banned", &inner.banned.len())
            .field("emergency", &inner.emergency.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountStateConfig, EndpointLimits};

    fn account() -> Arc<AccountState> {
        Arc::new(AccountState::new(AccountStateConfig::default()))
    }

    fn limiter_with(cfg: RateLimiterConfig) -> (RateLimiter, Arc<AccountState>) {
        let acct = account();
        (RateLimiter::new(cfg, acct.clone()), acct)
    }

    /// Generous config so only the dimension under test can trip.
    fn open_config() -> RateLimiterConfig {
        let open = EndpointLimits::new(1000, 1000, 1000, 1, 0.99);
        RateLimiterConfig {
            order_create: open,
            order_cancel: open,
            position_query: open,
            balance_query: open,
            market_data: open,
            unknown: open,
            global_per_minute: 100_000,
            global_per_second: 100_000,
            ..RateLimiterConfig::default()
        }
    }

    #[test]
    fn acquire_within_limits_succeeds() {
        let (rl, _) = limiter_with(open_config());
        for _ in 0..5 {
            rl.acquire(RequestKind::PositionQuery, "bot", Some("BTCUSDT"))
                .unwrap();
        }
        let stats = rl.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.blocked_requests, 0);
    }

    #[test]
    fn per_second_limit_rejects_without_violation() {
        let mut cfg = open_config();
        cfg.order_create = EndpointLimits::new(1000, 2, 1000, 1, 0.99);
        let (rl, acct) = limiter_with(cfg);

        rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap();
        rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap();
        let err = rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap_err();
        assert!(matches!(err, OrderError::RateLimitExceeded { .. }));

        // Per-second rejections are not violations and never latch.
        assert_eq!(rl.stats().violations, 0);
        assert!(!acct.emergency_stop());
    }

    #[test]
    fn burst_limit_rejects() {
        let mut cfg = open_config();
        cfg.market_data = EndpointLimits::new(1000, 1000, 3, 1, 0.99);
        let (rl, _) = limiter_with(cfg);

        for _ in 0..3 {
            rl.acquire(RequestKind::MarketData, "bot", None).unwrap();
        }
        let err = rl.acquire(RequestKind::MarketData, "bot", None).unwrap_err();
        match err {
            OrderError::RateLimitExceeded { message, .. } => {
                assert!(message.contains("burst"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn minute_violation_latches_emergency_and_mirrors_to_account() {
        let mut cfg = open_config();
        cfg.order_create = EndpointLimits::new(2, 1000, 1000, 1, 0.99);
        let (rl, acct) = limiter_with(cfg);

        rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap();
        rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap();
        let err = rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap_err();
        assert!(matches!(err, OrderError::RateLimitExceeded { .. }));

        let stats = rl.stats();
        assert_eq!(stats.violations, 1);
        assert!(stats.emergency_stop_active);
        assert_eq!(stats.emergency_activations, 1);
        assert!(acct.emergency_stop(), "latch mirrors into AccountState");

        // Latched: everything now fails with EmergencyStop.
        let err = rl.acquire(RequestKind::MarketData, "bot", None).unwrap_err();
        assert!(matches!(err, OrderError::EmergencyStop { .. }));
    }

    #[test]
    fn deactivation_requires_admin_override() {
        let mut cfg = open_config();
        cfg.order_create = EndpointLimits::new(1, 1000, 1000, 1, 0.99);
        let (rl, acct) = limiter_with(cfg);

        rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap();
        let _ = rl.acquire(RequestKind::OrderCreate, "bot", None);
        assert!(acct.emergency_stop());

        assert!(!rl.deactivate_emergency_stop(false));
        assert!(acct.emergency_stop());

        assert!(rl.deactivate_emergency_stop(true));
        assert!(!acct.emergency_stop());
        assert!(!rl.stats().emergency_stop_active);
    }

    #[test]
    fn repeat_offender_gets_banned() {
        let mut cfg = open_config();
        cfg.order_create = EndpointLimits::new(1, 1000, 1000, 1, 0.99);
        let (rl, _) = limiter_with(cfg);

        // Saturate the 1-per-minute window, then violate three times.
        // Each minute-violation is Critical and latches, so deactivate
        // between rounds to keep the ban path reachable.
        rl.acquire(RequestKind::OrderCreate, "offender", None).unwrap();
        for _ in 0..3 {
            let err = rl.acquire(RequestKind::OrderCreate, "offender", None);
            assert!(err.is_err());
            rl.deactivate_emergency_stop(true);
        }

        let status = rl.client_status("offender");
        assert_eq!(status.violation_count, 3);
        assert!(status.is_banned);

        let err = rl
            .acquire(RequestKind::OrderCreate, "offender", None)
            .unwrap_err();
        match err {
            OrderError::RateLimitExceeded { message, .. } => {
                assert!(message.contains("banned"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Other clients are unaffected by the ban.
        rl.acquire(RequestKind::MarketData, "innocent", None).unwrap();
    }

    #[test]
    fn elapsed_ban_clears_on_next_acquire() {
        let (rl, _) = limiter_with(open_config());
        {
            let mut inner = rl.inner.lock();
            inner.banned.insert("bot".to_string(), Instant::now());
            inner.violation_counts.insert("bot".to_string(), 4);
        }

        rl.acquire(RequestKind::MarketData, "bot", None).unwrap();
        let status = rl.client_status("bot");
        assert!(!status.is_banned);
        assert_eq!(status.violation_count, 0, "counter reset with the ban");
    }

    #[test]
    fn global_per_second_ceiling() {
        let mut cfg = open_config();
        cfg.global_per_second = 3;
        let (rl, acct) = limiter_with(cfg);

        for i in 0..3 {
            rl.acquire(RequestKind::MarketData, &format!("client{i}"), None)
                .unwrap();
        }
        let err = rl
            .acquire(RequestKind::MarketData, "client9", None)
            .unwrap_err();
        match err {
            OrderError::RateLimitExceeded { scope, .. } => assert_eq!(scope, "global"),
            other => panic!("unexpected error: {other}"),
        }
        // Per-second global breach does not latch.
        assert!(!acct.emergency_stop());
    }

    #[test]
    fn global_per_minute_breach_latches() {
        let mut cfg = open_config();
        cfg.global_per_minute = 3;
        cfg.global_per_second = 1000;
        let (rl, acct) = limiter_with(cfg);

        for i in 0..3 {
            rl.acquire(RequestKind::MarketData, &format!("client{i}"), None)
                .unwrap();
        }
        let err = rl
            .acquire(RequestKind::MarketData, "client9", None)
            .unwrap_err();
        assert!(matches!(err, OrderError::RateLimitExceeded { .. }));
        assert!(acct.emergency_stop());
        assert!(rl.stats().emergency_stop_active);
    }

    #[test]
    fn preflight_never_records() {
        let (rl, _) = limiter_with(open_config());
        for _ in 0..50 {
            assert!(rl.can_make_request(RequestKind::OrderCreate, "bot", None));
        }
        assert_eq!(rl.stats().total_requests, 0);
        rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap();
        assert_eq!(rl.stats().total_requests, 1);
    }

    #[test]
    fn preflight_false_when_banned_or_latched() {
        let (rl, _) = limiter_with(open_config());
        {
            let mut inner = rl.inner.lock();
            inner.banned.insert(
                "bot".to_string(),
                Instant::now() + Duration::from_secs(60),
            );
        }
        assert!(!rl.can_make_request(RequestKind::MarketData, "bot", None));
        assert!(rl.can_make_request(RequestKind::MarketData, "other", None));

        {
            let mut inner = rl.inner.lock();
            inner.emergency = Some(EmergencyState {
                reason: "test".into(),
                since: Utc::now(),
            });
        }
        assert!(!rl.can_make_request(RequestKind::MarketData, "other", None));
    }

    #[test]
    fn adaptive_delays_track_streaks() {
        let (rl, _) = limiter_with(open_config());
        assert_eq!(rl.adaptive_delay("order_create"), 1.0);

        rl.record_api_failure("order_create");
        assert!((rl.adaptive_delay("order_create") - 1.5).abs() < 1e-9);
        rl.record_api_failure("order_create");
        assert!((rl.adaptive_delay("order_create") - 2.25).abs() < 1e-9);

        // Cap at 10 s.
        for _ in 0..20 {
            rl.record_api_failure("order_create");
        }
        assert_eq!(rl.adaptive_delay("order_create"), DELAY_CAP);

        // Below the streak threshold nothing shrinks.
        for _ in 0..4 {
            rl.record_api_success("order_create");
        }
        assert_eq!(rl.adaptive_delay("order_create"), DELAY_CAP);

        // Fifth consecutive success starts the decay; floor at 0.1 s.
        for _ in 0..60 {
            rl.record_api_success("order_create");
        }
        assert_eq!(rl.adaptive_delay("order_create"), DELAY_FLOOR);
    }

    #[test]
    fn window_deques_are_capped_on_record() {
        let mut cfg = open_config();
        cfg.market_data = EndpointLimits::new(100_000, 100_000, 100_000, 1, 0.999);
        cfg.global_per_minute = 1_000_000;
        cfg.global_per_second = 1_000_000;
        let (rl, _) = limiter_with(cfg);

        let key = WindowKey {
            client_id: "bot".to_string(),
            symbol: None,
            kind: RequestKind::MarketData,
        };
        {
            let mut inner = rl.inner.lock();
            let now = Instant::now();
            let window: VecDeque<Instant> = (0..WINDOW_CAP).map(|_| now).collect();
            inner.windows.insert(key.clone(), window);
        }

        // Recording the next request must not grow the deque past the cap.
        rl.acquire(RequestKind::MarketData, "bot", None).unwrap();
        let inner = rl.inner.lock();
        assert_eq!(inner.windows.get(&key).unwrap().len(), WINDOW_CAP);
    }

    #[test]
    fn cleanup_releases_expired_state() {
        let (rl, _) = limiter_with(open_config());
        // A monotonic clock younger than the window horizon cannot produce a
        // stale timestamp; skip eviction checks in that case.
        let old = Instant::now().checked_sub(Duration::from_secs(7200));

        {
            let mut inner = rl.inner.lock();
            if let Some(old) = old {
                inner.windows.insert(
                    WindowKey {
                        client_id: "bot".to_string(),
                        symbol: None,
                        kind: RequestKind::MarketData,
                    },
                    VecDeque::from(vec![old]),
                );
            }
            inner.banned.insert("bot".to_string(), Instant::now());
            inner.violation_counts.insert("bot".to_string(), 3);
            inner.violations.push(Violation {
                limit_type: "market_data_per_minute".into(),
                current: 10,
                limit: 10,
                severity: ViolationSeverity::Critical,
                client_id: "bot".into(),
                at: Instant::now(),
                at_utc: Utc::now(),
            });
        }

        rl.cleanup_once();

        let inner = rl.inner.lock();
        if old.is_some() {
            assert!(inner.windows.is_empty(), "stale window evicted");
        }
        assert!(inner.banned.is_empty(), "expired ban released");
        assert_eq!(inner.violation_counts.get("bot"), Some(&0));
        // The violation is fresh — within the 24 h retention.
        assert_eq!(inner.violations.len(), 1);
    }

    #[test]
    fn global_status_reports_recent_violations() {
        let mut cfg = open_config();
        cfg.order_create = EndpointLimits::new(1, 1000, 1000, 1, 0.99);
        let (rl, _) = limiter_with(cfg);

        rl.acquire(RequestKind::OrderCreate, "bot", None).unwrap();
        let _ = rl.acquire(RequestKind::OrderCreate, "bot", None);

        let status = rl.global_status();
        assert!(status.emergency_stop_active);
        assert_eq!(status.recent_violations.len(), 1);
        assert_eq!(status.recent_violations[0].client, "bot");
        assert_eq!(
            status.recent_violations[0].severity,
            ViolationSeverity::Critical
        );
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(ViolationSeverity::from_ratio(1.2), ViolationSeverity::Critical);
        assert_eq!(ViolationSeverity::from_ratio(0.95), ViolationSeverity::High);
        assert_eq!(ViolationSeverity::from_ratio(0.75), ViolationSeverity::Medium);
        assert_eq!(ViolationSeverity::from_ratio(0.3), ViolationSeverity::Low);
    }
}
