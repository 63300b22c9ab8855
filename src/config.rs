// =============================================================================
// Runtime Configuration — safety-core settings with atomic save
// =============================================================================
//
// Every tunable of the core lives here: order-manager guards, rate-limiter
// tables, error-handler rules, and account-state knobs. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Persistence uses a tmp + rename pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_max_orders_per_minute() -> u32 {
    10
}

fn default_min_symbol_interval_secs() -> f64 {
    2.0
}

fn default_worker_count() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    128
}

fn default_order_timeout_secs() -> f64 {
    10.0
}

fn default_max_worker_retries() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> f64 {
    0.5
}

fn default_retry_backoff_cap_secs() -> f64 {
    5.0
}

fn default_pending_duplicate_window_secs() -> f64 {
    10.0
}

fn default_retryable_ret_codes() -> Vec<i32> {
    vec![-1001, -1002, -1020]
}

fn default_global_per_minute() -> u32 {
    200
}

fn default_global_per_second() -> u32 {
    20
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_ban_escalation_threshold() -> u32 {
    3
}

fn default_emergency_violation_threshold() -> u32 {
    5
}

fn default_history_size() -> usize {
    1000
}

fn default_emergency_log_path() -> String {
    "data/logs/emergency_error.log".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown_secs() -> u64 {
    60
}

fn default_signal_strength_ring_size() -> usize {
    100
}

fn default_sync_log_interval_secs() -> u64 {
    30
}

fn default_journal_path() -> String {
    "data/trade_journal.csv".to_string()
}

fn default_strategy_log_dir() -> String {
    "logs/strategies".to_string()
}

fn default_active_strategies_path() -> String {
    "data/active_strategies.txt".to_string()
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

// =============================================================================
// OrderManagerConfig
// =============================================================================

/// Guards applied by the order manager during admission and by its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderManagerConfig {
    /// Hard ceiling of successful submissions per symbol per 60 s window.
    #[serde(default = "default_max_orders_per_minute")]
    pub max_orders_per_minute: u32,

    /// Minimum wall-time between two successful submissions on one symbol.
    #[serde(default = "default_min_symbol_interval_secs")]
    pub min_symbol_interval_secs: f64,

    /// Worker tasks consuming the submission queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Bound of the submission queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long `submit` waits for a worker to resolve the order.
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: f64,

    /// Worker-level retry attempts on transient exchange failures.
    #[serde(default = "default_max_worker_retries")]
    pub max_worker_retries: u32,

    /// First retry delay; doubles per attempt.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,

    /// Ceiling of the exponential retry delay.
    #[serde(default = "default_retry_backoff_cap_secs")]
    pub retry_backoff_cap_secs: f64,

    /// Window within which an identical fingerprint counts as a duplicate.
    #[serde(default = "default_pending_duplicate_window_secs")]
    pub pending_duplicate_window_secs: f64,

    /// Exchange ret-codes treated as transient and retried by workers.
    #[serde(default = "default_retryable_ret_codes")]
    pub retryable_ret_codes: Vec<i32>,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            max_orders_per_minute: default_max_orders_per_minute(),
            min_symbol_interval_secs: default_min_symbol_interval_secs(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            order_timeout_secs: default_order_timeout_secs(),
            max_worker_retries: default_max_worker_retries(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_backoff_cap_secs: default_retry_backoff_cap_secs(),
            pending_duplicate_window_secs: default_pending_duplicate_window_secs(),
            retryable_ret_codes: default_retryable_ret_codes(),
        }
    }
}

// =============================================================================
// Rate-limiter configuration
// =============================================================================

/// Limits for one endpoint kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EndpointLimits {
    pub per_minute: u32,
    pub per_second: u32,
    /// 10-second bucket ceiling.
    pub burst_limit: u32,
    pub cooldown_seconds: u64,
    /// Fraction of `per_minute` at which a warning is emitted (0.0–1.0).
    pub emergency_threshold: f64,
}

impl EndpointLimits {
    pub const fn new(
        per_minute: u32,
        per_second: u32,
        burst_limit: u32,
        cooldown_seconds: u64,
        emergency_threshold: f64,
    ) -> Self {
        Self {
            per_minute,
            per_second,
            burst_limit,
            cooldown_seconds,
            emergency_threshold,
        }
    }
}

fn default_order_create_limits() -> EndpointLimits {
    EndpointLimits::new(20, 1, 3, 30, 0.7)
}

fn default_order_cancel_limits() -> EndpointLimits {
    EndpointLimits::new(30, 2, 5, 15, 0.8)
}

fn default_position_query_limits() -> EndpointLimits {
    EndpointLimits::new(60, 5, 10, 10, 0.9)
}

fn default_balance_query_limits() -> EndpointLimits {
    EndpointLimits::new(30, 3, 5, 20, 0.8)
}

fn default_market_data_limits() -> EndpointLimits {
    EndpointLimits::new(120, 10, 20, 5, 0.95)
}

fn default_unknown_limits() -> EndpointLimits {
    // Unknown endpoints get the strictest limits.
    EndpointLimits::new(10, 1, 2, 60, 0.5)
}

/// Request classes the limiter distinguishes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    OrderCreate,
    OrderCancel,
    PositionQuery,
    BalanceQuery,
    MarketData,
    Other,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderCreate => "order_create",
            Self::OrderCancel => "order_cancel",
            Self::PositionQuery => "position_query",
            Self::BalanceQuery => "balance_query",
            Self::MarketData => "market_data",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full rate-limiter configuration: per-endpoint tables plus global ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_order_create_limits")]
    pub order_create: EndpointLimits,
    #[serde(default = "default_order_cancel_limits")]
    pub order_cancel: EndpointLimits,
    #[serde(default = "default_position_query_limits")]
    pub position_query: EndpointLimits,
    #[serde(default = "default_balance_query_limits")]
    pub balance_query: EndpointLimits,
    #[serde(default = "default_market_data_limits")]
    pub market_data: EndpointLimits,
    /// Fallback for unknown endpoint kinds.
    #[serde(default = "default_unknown_limits")]
    pub unknown: EndpointLimits,

    #[serde(default = "default_global_per_minute")]
    pub global_per_minute: u32,
    #[serde(default = "default_global_per_second")]
    pub global_per_second: u32,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Violations at which a client gets banned.
    #[serde(default = "default_ban_escalation_threshold")]
    pub ban_escalation_threshold: u32,
    /// Violations at which the emergency stop latches.
    #[serde(default = "default_emergency_violation_threshold")]
    pub emergency_violation_threshold: u32,
}

impl RateLimiterConfig {
    /// Limits for a request kind, falling back to the strictest config for
    /// unknown kinds.
    pub fn limits_for(&self, kind: RequestKind) -> EndpointLimits {
        match kind {
            RequestKind::OrderCreate => self.order_create,
            RequestKind::OrderCancel => self.order_cancel,
            RequestKind::PositionQuery => self.position_query,
            RequestKind::BalanceQuery => self.balance_query,
            RequestKind::MarketData => self.market_data,
            RequestKind::Other => self.unknown,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            order_create: default_order_create_limits(),
            order_cancel: default_order_cancel_limits(),
            position_query: default_position_query_limits(),
            balance_query: default_balance_query_limits(),
            market_data: default_market_data_limits(),
            unknown: default_unknown_limits(),
            global_per_minute: default_global_per_minute(),
            global_per_second: default_global_per_second(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            ban_escalation_threshold: default_ban_escalation_threshold(),
            emergency_violation_threshold: default_emergency_violation_threshold(),
        }
    }
}

// =============================================================================
// Error-handler / account-state configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    /// Rolling error-history bound.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Last-resort log file when the handler itself fails.
    #[serde(default = "default_emergency_log_path")]
    pub emergency_log_path: String,

    /// Consecutive Critical/High failures that open a circuit.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Open-circuit cooldown before the half-open probe.
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            emergency_log_path: default_emergency_log_path(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStateConfig {
    /// Ring-buffer size for per-strategy signal strengths.
    #[serde(default = "default_signal_strength_ring_size")]
    pub signal_strength_ring_size: usize,

    /// Minimum spacing of sync-with-exchange log lines per symbol.
    #[serde(default = "default_sync_log_interval_secs")]
    pub sync_log_interval_secs: u64,
}

impl Default for AccountStateConfig {
    fn default() -> Self {
        Self {
            signal_strength_ring_size: default_signal_strength_ring_size(),
            sync_log_interval_secs: default_sync_log_interval_secs(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the safety core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Symbols the orchestrator trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Use the exchange testnet.
    #[serde(default)]
    pub testnet: bool,

    #[serde(default)]
    pub order_manager: OrderManagerConfig,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub error_handler: ErrorHandlerConfig,

    #[serde(default)]
    pub account: AccountStateConfig,

    /// Append-only trade journal CSV.
    #[serde(default = "default_journal_path")]
    pub journal_path: String,

    /// Per-strategy signal log directory.
    #[serde(default = "default_strategy_log_dir")]
    pub strategy_log_dir: String,

    /// Newline-separated active strategy identifiers.
    #[serde(default = "default_active_strategies_path")]
    pub active_strategies_path: String,

    /// Orchestrator tick interval.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Position sync-with-exchange interval.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Heartbeat probe interval.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            testnet: false,
            order_manager: OrderManagerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            error_handler: ErrorHandlerConfig::default(),
            account: AccountStateConfig::default(),
            journal_path: default_journal_path(),
            strategy_log_dir: default_strategy_log_dir(),
            active_strategies_path: default_active_strategies_path(),
            tick_interval_secs: default_tick_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            testnet = config.testnet,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.order_manager.max_orders_per_minute, 10);
        assert_eq!(cfg.order_manager.min_symbol_interval_secs, 2.0);
        assert_eq!(cfg.order_manager.worker_count, 2);
        assert_eq!(cfg.order_manager.queue_capacity, 128);
        assert_eq!(cfg.order_manager.order_timeout_secs, 10.0);
        assert_eq!(cfg.order_manager.max_worker_retries, 3);
        assert_eq!(cfg.order_manager.retryable_ret_codes, vec![-1001, -1002, -1020]);
        assert_eq!(cfg.rate_limiter.global_per_minute, 200);
        assert_eq!(cfg.rate_limiter.global_per_second, 20);
        assert_eq!(cfg.rate_limiter.cleanup_interval_secs, 300);
        assert_eq!(cfg.error_handler.history_size, 1000);
        assert_eq!(cfg.error_handler.circuit_failure_threshold, 5);
        assert_eq!(cfg.account.signal_strength_ring_size, 100);
        assert_eq!(cfg.account.sync_log_interval_secs, 30);
    }

    #[test]
    fn unknown_endpoints_get_strictest_limits() {
        let cfg = RateLimiterConfig::default();
        let unknown = cfg.limits_for(RequestKind::Other);
        assert!(unknown.per_minute <= cfg.order_create.per_minute);
        assert!(unknown.per_second <= cfg.order_create.per_second);
        assert!(unknown.burst_limit <= cfg.order_create.burst_limit);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT"]);
        assert_eq!(cfg.order_manager.max_orders_per_minute, 10);
        assert_eq!(cfg.rate_limiter.order_create.per_minute, 20);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "order_manager": { "worker_count": 4 } }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.order_manager.worker_count, 4);
        assert_eq!(cfg.order_manager.queue_capacity, 128);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = BotConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(
            cfg.order_manager.max_orders_per_minute,
            cfg2.order_manager.max_orders_per_minute
        );
        assert_eq!(
            cfg.rate_limiter.global_per_minute,
            cfg2.rate_limiter.global_per_minute
        );
    }

    #[test]
    fn atomic_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bastion_config.json");

        let mut cfg = BotConfig::default();
        cfg.symbols = vec!["SOLUSDT".to_string()];
        cfg.save(&path).unwrap();

        let loaded = BotConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["SOLUSDT"]);
    }
}
