// =============================================================================
// Error Handler — classification, recovery strategies, circuit breaker
// =============================================================================
//
// Single choke point for every failure raised in the core. A rule table maps
// each failure kind to a severity and a recovery strategy; a per
// (strategy, operation) circuit breaker short-circuits repeat offenders.
//
// Circuit life-cycle: Closed -> Open after N consecutive Critical/High
// failures; Open rejects (raising EmergencyStop) for a cooldown; on expiry
// the next event probes Half-Open; the first recorded success closes it,
// another failure re-opens it.
//
// The handler sleeps for retry backoff, so `handle` is async. The internal
// lock is never held across a sleep or a callback.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account_state::AccountState;
use crate::config::ErrorHandlerConfig;
use crate::errors::{FailureKind, OrderError};

// ---------------------------------------------------------------------------
// Severity / recovery taxonomy
// ---------------------------------------------------------------------------

/// Ascending order so that `>=` comparisons read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryStrategy {
    EmergencyStop,
    StrategyRestart,
    RetryWithBackoff,
    SkipIteration,
    Ignore,
    Custom,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EmergencyStop => "emergency_stop",
            Self::StrategyRestart => "strategy_restart",
            Self::RetryWithBackoff => "retry_backoff",
            Self::SkipIteration => "skip_iteration",
            Self::Ignore => "ignore",
            Self::Custom => "custom_handler",
        };
        write!(f, "{s}")
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    Retry { attempt: u32, backoff_secs: f64 },
    RestartStrategy { strategy: String },
    Skip { reason: String },
    Ignore,
}

/// Custom per-rule handler. Failures degrade to SkipIteration.
pub type CustomHandler =
    Arc<dyn Fn(FailureKind, &ErrorContext) -> anyhow::Result<RecoveryAction> + Send + Sync>;

/// Monitoring hook invoked (best-effort) on emergency stops.
pub type MonitoringCallback = Arc<dyn Fn(&str, &ErrorContext) + Send + Sync>;

/// One row of the recovery rule table.
#[derive(Clone)]
pub struct ErrorRule {
    pub severity: Severity,
    pub recovery: RecoveryStrategy,
    pub max_retries: u32,
    pub backoff_secs: f64,
    pub custom_handler: Option<CustomHandler>,
    pub description: String,
}

impl ErrorRule {
    fn new(severity: Severity, recovery: RecoveryStrategy, description: &str) -> Self {
        Self {
            severity,
            recovery,
            max_retries: 3,
            backoff_secs: 1.0,
            custom_handler: None,
            description: description.to_string(),
        }
    }

    fn with_retries(mut self, max_retries: u32, backoff_secs: f64) -> Self {
        self.max_retries = max_retries;
        self.backoff_secs = backoff_secs;
        self
    }
}

impl std::fmt::Debug for ErrorRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRule")
            .field("severity", &self.severity)
            .field("recovery", &self.recovery)
            .field("max_retries", &self.max_retries)
            .field("backoff_secs", &self.backoff_secs)
            .field("custom_handler", &self.custom_handler.is_some())
            .finish()
    }
}

/// Execution context attached to every handled failure.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub timestamp: DateTime<Utc>,
    pub strategy: String,
    pub symbol: String,
    pub operation: String,
    pub user_data: serde_json::Value,
    pub correlation_id: String,
}

impl ErrorContext {
    pub fn new(strategy: &str, symbol: &str, operation: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            operation: operation.to_string(),
            user_data: serde_json::Value::Null,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitState {
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    state: CircuitBreakerState,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            state: CircuitBreakerState::Closed,
        }
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub kind: String,
    pub message: String,
    pub strategy: String,
    pub symbol: String,
    pub operation: String,
    pub severity: Severity,
    pub recovery: RecoveryStrategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub failure_count: u32,
    pub state: CircuitBreakerState,
    pub seconds_since_last_failure: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub error_counts: HashMap<String, u64>,
    pub recovery_stats: HashMap<String, u64>,
    pub circuit_states: HashMap<String, CircuitSnapshot>,
    pub recent_errors: Vec<ErrorRecord>,
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

struct Inner {
    rules: HashMap<FailureKind, ErrorRule>,
    error_counts: HashMap<String, u64>,
    history: VecDeque<ErrorRecord>,
    recovery_stats: HashMap<String, u64>,
    retry_attempts: HashMap<String, u32>,
    circuits: HashMap<String, CircuitState>,
}

/// Centralised failure classification and recovery.
pub struct ErrorHandler {
    cfg: ErrorHandlerConfig,
    account: Arc<AccountState>,
    inner: Mutex<Inner>,
    callbacks: RwLock<Vec<MonitoringCallback>>,
}

/// What `handle` decided while the lock was held; executed after release.
enum Decision {
    CircuitTripped { circuit_key: String },
    EmergencyStop,
    RestartStrategy,
    RetrySleep { attempt: u32, backoff_secs: f64 },
    RetriesExhausted,
    Skip,
    Ignore,
    Custom { handler: CustomHandler },
}

impl ErrorHandler {
    pub fn new(cfg: ErrorHandlerConfig, account: Arc<AccountState>) -> Self {
        info!("ErrorHandler initialised with default rule table");
        Self {
            cfg,
            account,
            inner: Mutex::new(Inner {
                rules: Self::default_rules(),
                error_counts: HashMap::new(),
                history: VecDeque::new(),
                recovery_stats: HashMap::new(),
                retry_attempts: HashMap::new(),
                circuits: HashMap::new(),
            }),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    fn default_rules() -> HashMap<FailureKind, ErrorRule> {
        let mut rules = HashMap::new();

        for kind in [
            FailureKind::EmergencyStop,
            FailureKind::ApiKeyLeak,
            FailureKind::ThreadSafetyViolation,
        ] {
            rules.insert(
                kind,
                ErrorRule::new(
                    Severity::Critical,
                    RecoveryStrategy::EmergencyStop,
                    "critical system failure",
                ),
            );
        }

        for kind in [FailureKind::RiskLimitExceeded, FailureKind::PositionConflict] {
            rules.insert(
                kind,
                ErrorRule::new(
                    Severity::High,
                    RecoveryStrategy::StrategyRestart,
                    "high-priority failure",
                )
                .with_retries(2, 30.0),
            );
        }

        for kind in [FailureKind::OrderRejection, FailureKind::RateLimit] {
            rules.insert(
                kind,
                ErrorRule::new(
                    Severity::Medium,
                    RecoveryStrategy::RetryWithBackoff,
                    "recoverable failure",
                )
                .with_retries(3, 5.0),
            );
        }

        rules.insert(
            FailureKind::InvalidArgument,
            ErrorRule::new(
                Severity::Medium,
                RecoveryStrategy::SkipIteration,
                "invalid parameter value",
            ),
        );

        rules.insert(
            FailureKind::ConnectionError,
            ErrorRule::new(
                Severity::Medium,
                RecoveryStrategy::RetryWithBackoff,
                "network failure",
            )
            .with_retries(5, 10.0),
        );

        rules.insert(
            FailureKind::Other,
            ErrorRule::new(
                Severity::High,
                RecoveryStrategy::StrategyRestart,
                "unclassified failure",
            )
            .with_retries(1, 1.0),
        );

        rules
    }

    /// Replace the rule for one failure kind.
    pub fn set_rule(&self, kind: FailureKind, rule: ErrorRule) {
        self.inner.lock().rules.insert(kind, rule);
    }

    pub fn add_monitoring_callback(&self, callback: MonitoringCallback) {
        self.callbacks.write().push(callback);
    }

    // -------------------------------------------------------------------------
    // Handling
    // -------------------------------------------------------------------------

    /// Classify and handle an `OrderError`.
    pub async fn handle_order_error(
        &self,
        err: &OrderError,
        ctx: &ErrorContext,
    ) -> Result<RecoveryAction, OrderError> {
        self.handle(FailureKind::from(err), &err.to_string(), ctx).await
    }

    /// Classify and handle a failure by kind.
    ///
    /// Returns the recovery directive, or `Err(EmergencyStop)` when the rule
    /// or circuit breaker demands a full halt. The account-state latch is set
    /// before the error unwinds.
    pub async fn handle(
        &self,
        kind: FailureKind,
        message: &str,
        ctx: &ErrorContext,
    ) -> Result<RecoveryAction, OrderError> {
        let decision = {
            let mut inner = self.inner.lock();
            let rule = Self::lookup_rule(&inner.rules, kind);

            Self::log_failure(kind, message, ctx, &rule);
            self.record_failure(&mut inner, kind, message, ctx, &rule);

            if let Some(circuit_key) = self.check_circuit(&mut inner, ctx, &rule) {
                Decision::CircuitTripped { circuit_key }
            } else {
                let recovery_key = format!("{}:{}", rule.recovery, ctx.strategy);
                *inner.recovery_stats.entry(recovery_key).or_insert(0) += 1;

                match rule.recovery {
                    RecoveryStrategy::EmergencyStop => Decision::EmergencyStop,
                    RecoveryStrategy::StrategyRestart => Decision::RestartStrategy,
                    RecoveryStrategy::SkipIteration => Decision::Skip,
                    RecoveryStrategy::Ignore => Decision::Ignore,
                    RecoveryStrategy::Custom => match rule.custom_handler.clone() {
                        Some(handler) => Decision::Custom { handler },
                        None => Decision::Skip,
                    },
                    RecoveryStrategy::RetryWithBackoff => {
                        let retry_key =
                            format!("{}:{}:{}", ctx.strategy, ctx.operation, ctx.symbol);
                        let attempt = inner.retry_attempts.entry(retry_key.clone()).or_insert(0);
                        *attempt += 1;
                        let attempt = *attempt;

                        if attempt <= rule.max_retries {
                            let backoff_secs =
                                rule.backoff_secs * 2f64.powi(attempt as i32 - 1);
                            Decision::RetrySleep {
                                attempt,
                                backoff_secs,
                            }
                        } else {
                            // Exhausted: clear the counter and escalate.
                            inner.retry_attempts.remove(&retry_key);
                            Decision::RetriesExhausted
                        }
                    }
                }
            }
        };

        // Lock released — latching, callbacks, and sleeps happen out here.
        match decision {
            Decision::CircuitTripped { circuit_key } => {
                let reason = format!("circuit breaker open for {circuit_key}");
                error!(circuit = %circuit_key, "circuit breaker tripped — halting");
                self.notify_monitors(&reason, ctx);
                self.account.latch_emergency_stop(&reason);
                Err(OrderError::EmergencyStop { reason })
            }
            Decision::EmergencyStop => {
                let reason = format!("{kind}: {message}");
                self.notify_monitors(&reason, ctx);
                self.account.latch_emergency_stop(&reason);
                Err(OrderError::EmergencyStop { reason })
            }
            Decision::RestartStrategy => {
                warn!(strategy = %ctx.strategy, "strategy restart requested");
                Ok(RecoveryAction::RestartStrategy {
                    strategy: ctx.strategy.clone(),
                })
            }
            Decision::RetrySleep {
                attempt,
                backoff_secs,
            } => {
                info!(
                    strategy = %ctx.strategy,
                    operation = %ctx.operation,
                    attempt,
                    backoff_secs,
                    "retrying with backoff"
                );
                tokio::time::sleep(Duration::from_secs_f64(backoff_secs)).await;
                Ok(RecoveryAction::Retry {
                    attempt,
                    backoff_secs,
                })
            }
            Decision::RetriesExhausted => {
                warn!(
                    strategy = %ctx.strategy,
                    operation = %ctx.operation,
                    "retries exhausted — escalating to strategy restart"
                );
                Ok(RecoveryAction::RestartStrategy {
                    strategy: ctx.strategy.clone(),
                })
            }
            Decision::Skip => Ok(RecoveryAction::Skip {
                reason: message.to_string(),
            }),
            Decision::Ignore => {
                debug!(strategy = %ctx.strategy, "failure ignored");
                Ok(RecoveryAction::Ignore)
            }
            Decision::Custom { handler } => match handler(kind, ctx) {
                Ok(action) => Ok(action),
                Err(e) => {
                    warn!(error = %e, "custom handler failed — degrading to skip");
                    self.emergency_fallback(&format!("custom handler failure: {e}"));
                    Ok(RecoveryAction::Skip {
                        reason: message.to_string(),
                    })
                }
            },
        }
    }

    fn lookup_rule(rules: &HashMap<FailureKind, ErrorRule>, kind: FailureKind) -> ErrorRule {
        // Exact match, then walk the kind hierarchy, then the fallback.
        let mut probe = Some(kind);
        while let Some(k) = probe {
            if let Some(rule) = rules.get(&k) {
                return rule.clone();
            }
            probe = k.parent();
        }
        rules
            .get(&FailureKind::Other)
            .cloned()
            .unwrap_or_else(|| {
                ErrorRule::new(
                    Severity::High,
                    RecoveryStrategy::StrategyRestart,
                    "fallback",
                )
            })
    }

    fn log_failure(kind: FailureKind, message: &str, ctx: &ErrorContext, rule: &ErrorRule) {
        match rule.severity {
            Severity::Critical | Severity::High => error!(
                kind = %kind,
                severity = %rule.severity,
                strategy = %ctx.strategy,
                symbol = %ctx.symbol,
                operation = %ctx.operation,
                recovery = %rule.recovery,
                correlation_id = %ctx.correlation_id,
                message,
                "failure handled"
            ),
            Severity::Medium => warn!(
                kind = %kind,
                strategy = %ctx.strategy,
                operation = %ctx.operation,
                recovery = %rule.recovery,
                message,
                "failure handled"
            ),
            Severity::Low | Severity::Info => info!(
                kind = %kind,
                strategy = %ctx.strategy,
                message,
                "failure noted"
            ),
        }
    }

    fn record_failure(
        &self,
        inner: &mut Inner,
        kind: FailureKind,
        message: &str,
        ctx: &ErrorContext,
        rule: &ErrorRule,
    ) {
        let count_key = format!("{}:{}", kind, ctx.strategy);
        *inner.error_counts.entry(count_key).or_insert(0) += 1;

        inner.history.push_back(ErrorRecord {
            timestamp: ctx.timestamp.to_rfc3339(),
            kind: kind.as_str().to_string(),
            message: message.to_string(),
            strategy: ctx.strategy.clone(),
            symbol: ctx.symbol.clone(),
            operation: ctx.operation.clone(),
            severity: rule.severity,
            recovery: rule.recovery,
        });
        while inner.history.len() > self.cfg.history_size {
            inner.history.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    /// Register the failure against the circuit; returns the circuit key when
    /// the operation must be short-circuited.
    fn check_circuit(
        &self,
        inner: &mut Inner,
        ctx: &ErrorContext,
        rule: &ErrorRule,
    ) -> Option<String> {
        if rule.severity < Severity::High {
            return None;
        }

        let key = format!("{}:{}", ctx.strategy, ctx.operation);
        let cooldown = Duration::from_secs(self.cfg.circuit_cooldown_secs);
        let threshold = self.cfg.circuit_failure_threshold;

        let circuit = inner
            .circuits
            .entry(key.clone())
            .or_insert_with(CircuitState::closed);
        circuit.failure_count += 1;
        circuit.last_failure = Some(Instant::now());

        match circuit.state {
            CircuitBreakerState::Closed => {
                if circuit.failure_count >= threshold {
                    circuit.state = CircuitBreakerState::Open;
                    circuit.opened_at = Some(Instant::now());
                    error!(
                        circuit = %key,
                        failures = circuit.failure_count,
                        "circuit breaker OPEN"
                    );
                    Some(key)
                } else {
                    None
                }
            }
            CircuitBreakerState::Open => {
                let expired = circuit
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= cooldown);
                if expired {
                    // Cooldown elapsed, but this event is itself a failure:
                    // the half-open probe fails straight back to Open.
                    circuit.opened_at = Some(Instant::now());
                }
                Some(key)
            }
            CircuitBreakerState::HalfOpen => {
                circuit.state = CircuitBreakerState::Open;
                circuit.opened_at = Some(Instant::now());
                warn!(circuit = %key, "half-open probe failed — circuit re-opened");
                Some(key)
            }
        }
    }

    /// Record a successful operation: closes a half-open circuit, and moves
    /// an open circuit whose cooldown has expired through half-open to
    /// closed.
    pub fn record_success(&self, strategy: &str, operation: &str) {
        let key = format!("{strategy}:{operation}");
        let cooldown = Duration::from_secs(self.cfg.circuit_cooldown_secs);
        let mut inner = self.inner.lock();

        if let Some(circuit) = inner.circuits.get_mut(&key) {
            match circuit.state {
                CircuitBreakerState::HalfOpen => {
                    *circuit = CircuitState::closed();
                    info!(circuit = %key, "circuit breaker closed after successful probe");
                }
                CircuitBreakerState::Open => {
                    if circuit.opened_at.is_some_and(|at| at.elapsed() >= cooldown) {
                        *circuit = CircuitState::closed();
                        info!(circuit = %key, "circuit breaker closed after cooldown + success");
                    }
                }
                CircuitBreakerState::Closed => {
                    circuit.failure_count = 0;
                }
            }
        }
    }

    /// Whether operations through this circuit are currently admitted.
    pub fn circuit_allows(&self, strategy: &str, operation: &str) -> bool {
        let key = format!("{strategy}:{operation}");
        let cooldown = Duration::from_secs(self.cfg.circuit_cooldown_secs);
        let mut inner = self.inner.lock();

        match inner.circuits.get_mut(&key) {
            None => true,
            Some(circuit) => match circuit.state {
                CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
                CircuitBreakerState::Open => {
                    if circuit.opened_at.is_some_and(|at| at.elapsed() >= cooldown) {
                        circuit.state = CircuitBreakerState::HalfOpen;
                        info!(circuit = %key, "circuit breaker half-open after cooldown");
                        true
                    } else {
                        false
                    }
                }
            },
        }
    }

    /// Administrative reset of one circuit.
    pub fn reset_circuit_breaker(&self, circuit_key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.circuits.get_mut(circuit_key) {
            Some(circuit) => {
                *circuit = CircuitState::closed();
                info!(circuit = %circuit_key, "circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub fn circuit_state(&self, strategy: &str, operation: &str) -> Option<CircuitBreakerState> {
        let key = format!("{strategy}:{operation}");
        self.inner.lock().circuits.get(&key).map(|c| c.state)
    }

    // -------------------------------------------------------------------------
    // Monitoring / fallback
    // -------------------------------------------------------------------------

    fn notify_monitors(&self, reason: &str, ctx: &ErrorContext) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            // Best-effort: a broken monitor must never block the halt.
            callback(reason, ctx);
        }
    }

    /// Last-resort logging when the normal path cannot be trusted. Appends a
    /// plain line to the emergency log file; failures degrade to stderr.
    pub fn emergency_fallback(&self, message: &str) {
        let path = std::path::Path::new(&self.cfg.emergency_log_path);
        let write_result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{} - ERROR HANDLER FALLBACK - {}", Utc::now().to_rfc3339(), message)
        })();

        if let Err(e) = write_result {
            eprintln!("EMERGENCY: error handler fallback failed: {e} ({message})");
        }
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    pub fn error_statistics(&self) -> ErrorStatistics {
        let inner = self.inner.lock();
        ErrorStatistics {
            total_errors: inner.history.len(),
            error_counts: inner.error_counts.clone(),
            recovery_stats: inner.recovery_stats.clone(),
            circuit_states: inner
                .circuits
                .iter()
                .map(|(key, c)| {
                    (
                        key.clone(),
                        CircuitSnapshot {
                            failure_count: c.failure_count,
                            state: c.state,
                            seconds_since_last_failure: c
                                .last_failure
                                .map(|at| at.elapsed().as_secs()),
                        },
                    )
                })
                .collect(),
            recent_errors: inner.history.iter().rev().take(10).cloned().collect(),
        }
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ErrorHandler")
            .field("rules", &inner.rules.len())
            .field("history", &inner.history.len())
            .field("circuits", &inner.circuits.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
