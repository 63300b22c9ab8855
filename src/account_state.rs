// =============================================================================
// Account State — single writable source of truth for positions and stats
// =============================================================================
//
// Every read and write is serialized by one RwLock. The exchange is never
// called from inside the lock: `sync_with_exchange` receives a record the
// caller already fetched and only re-enters to write.
//
// Invariants maintained here:
//   - size == 0  =>  side == Flat and owner_strategy == None
//   - size > 0   =>  side is Long or Short
//   - at most one PositionInfo per symbol
//   - trading_enabled() is `trading flag AND NOT emergency_stop`
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::AccountStateConfig;
use crate::types::{ExchangePosition, PositionSide, Side};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// A tracked position. One per symbol, mutated only by this module.
#[derive(Debug, Clone, Serialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub avg_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub leverage: f64,
    pub margin: f64,
    /// The strategy that opened this position.
    pub owner_strategy: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl PositionInfo {
    fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: PositionSide::Flat,
            size: 0.0,
            entry_price: 0.0,
            avg_price: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            leverage: 1.0,
            margin: 0.0,
            owner_strategy: None,
            last_update: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.size > 0.0
    }

    pub fn is_long(&self) -> bool {
        self.side == PositionSide::Long
    }

    pub fn is_short(&self) -> bool {
        self.side == PositionSide::Short
    }

    /// The order side that entered this position, if it is active.
    pub fn entry_side(&self) -> Option<Side> {
        self.side.entry_order_side()
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Monotonic session counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub max_drawdown: f64,
    pub start_time: DateTime<Utc>,
    pub last_trade_time: Option<DateTime<Utc>>,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            daily_pnl: 0.0,
            max_drawdown: 0.0,
            start_time: Utc::now(),
            last_trade_time: None,
        }
    }
}

/// Session stats plus derived metrics, for dashboards and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub stats: SessionStats,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_equity: f64,
}

/// Per-strategy aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub avg_pnl: f64,
    pub last_trade_time: Option<DateTime<Utc>>,
    /// Bounded ring of the most recent signal strengths.
    pub signal_strengths: VecDeque<f64>,
}

impl StrategyStats {
    fn new() -> Self {
        Self {
            trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            win_rate: 0.0,
            avg_pnl: 0.0,
            last_trade_time: None,
            signal_strengths: VecDeque::new(),
        }
    }
}

/// Operational snapshot of the whole state module.
#[derive(Debug, Clone, Serialize)]
pub struct StateDiagnostics {
    pub positions_count: usize,
    pub active_positions_count: usize,
    pub strategies_count: usize,
    pub emergency_stop: bool,
    pub trading_enabled: bool,
    pub risk_limits_exceeded: bool,
    pub uptime_seconds: i64,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    positions: HashMap<String, PositionInfo>,
    session: SessionStats,
    peak_total_pnl: f64,
    strategy_stats: HashMap<String, StrategyStats>,

    emergency_stop: bool,
    emergency_reason: Option<String>,
    trading_enabled: bool,
    risk_limits_exceeded: bool,

    // Sync log throttling.
    sync_counts: HashMap<String, u32>,
    last_sync_log: HashMap<String, Instant>,
}

// ---------------------------------------------------------------------------
// AccountState
// ---------------------------------------------------------------------------

/// Thread-safe account state shared across the core via `Arc<AccountState>`.
pub struct AccountState {
    cfg: AccountStateConfig,
    inner: RwLock<Inner>,
}

impl AccountState {
    pub fn new(cfg: AccountStateConfig) -> Self {
        info!("AccountState initialised");
        Self {
            cfg,
            inner: RwLock::new(Inner {
                positions: HashMap::new(),
                session: SessionStats::new(),
                peak_total_pnl: 0.0,
                strategy_stats: HashMap::new(),
                emergency_stop: false,
                emergency_reason: None,
                trading_enabled: true,
                risk_limits_exceeded: false,
                sync_counts: HashMap::new(),
                last_sync_log: HashMap::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Position management
    // -------------------------------------------------------------------------

    pub fn get_position(&self, symbol: &str) -> Option<PositionInfo> {
        self.inner.read().positions.get(symbol).cloned()
    }

    pub fn get_all_positions(&self) -> HashMap<String, PositionInfo> {
        self.inner.read().positions.clone()
    }

    pub fn get_active_positions(&self) -> HashMap<String, PositionInfo> {
        self.inner
            .read()
            .positions
            .iter()
            .filter(|(_, p)| p.is_active())
            .map(|(s, p)| (s.clone(), p.clone()))
            .collect()
    }

    /// Create or mutate a position. `size == 0` collapses to Flat and clears
    /// the owner.
    #[allow(clippy::too_many_arguments)]
    pub fn set_position(
        &self,
        symbol: &str,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        avg_price: f64,
        unrealized_pnl: f64,
        leverage: f64,
        owner_strategy: Option<&str>,
    ) {
        let mut inner = self.inner.write();
        let pos = inner
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| PositionInfo::flat(symbol));

        pos.side = side;
        pos.size = size;
        pos.entry_price = entry_price;
        pos.avg_price = if avg_price > 0.0 { avg_price } else { entry_price };
        pos.unrealized_pnl = unrealized_pnl;
        pos.leverage = leverage;
        pos.owner_strategy = owner_strategy.map(|s| s.to_string());
        pos.last_update = Utc::now();

        if size == 0.0 {
            pos.side = PositionSide::Flat;
            pos.entry_price = 0.0;
            pos.avg_price = 0.0;
            pos.unrealized_pnl = 0.0;
            pos.owner_strategy = None;
        }

        debug!(symbol, side = %pos.side, size, entry_price, "position updated");
    }

    /// Recompute unrealized P&L against the latest price.
    pub fn update_position_pnl(&self, symbol: &str, current_price: f64) {
        let mut inner = self.inner.write();
        let Some(pos) = inner.positions.get_mut(symbol) else {
            return;
        };
        if !pos.is_active() || pos.entry_price == 0.0 {
            return;
        }

        pos.unrealized_pnl = match pos.side {
            PositionSide::Long => (current_price - pos.entry_price) * pos.size,
            PositionSide::Short => (pos.entry_price - current_price) * pos.size,
            PositionSide::Flat => 0.0,
        };
        pos.last_update = Utc::now();
    }

    /// Close a position, computing realized P&L when the caller does not
    /// supply one, and fold the result into session statistics.
    ///
    /// Returns a snapshot of the just-closed position, or `None` when there
    /// was no active position for `symbol`.
    pub fn close_position(
        &self,
        symbol: &str,
        exit_price: f64,
        realized_pnl: Option<f64>,
    ) -> Option<PositionInfo> {
        let mut inner = self.inner.write();
        let pos = inner.positions.get(symbol)?;
        if !pos.is_active() {
            return None;
        }

        let pnl = realized_pnl.unwrap_or_else(|| match pos.side {
            PositionSide::Long => (exit_price - pos.entry_price) * pos.size,
            PositionSide::Short => (pos.entry_price - exit_price) * pos.size,
            PositionSide::Flat => 0.0,
        });

        let now = Utc::now();
        let closed = PositionInfo {
            realized_pnl: pnl,
            last_update: now,
            ..pos.clone()
        };

        // Session statistics.
        inner.session.trades += 1;
        inner.session.total_pnl += pnl;
        inner.session.daily_pnl += pnl;
        inner.session.last_trade_time = Some(now);
        if pnl > 0.0 {
            inner.session.wins += 1;
        } else {
            inner.session.losses += 1;
        }

        // Drawdown tracking from the running P&L peak.
        if inner.session.total_pnl > inner.peak_total_pnl {
            inner.peak_total_pnl = inner.session.total_pnl;
        }
        let drawdown = inner.peak_total_pnl - inner.session.total_pnl;
        if drawdown > inner.session.max_drawdown {
            inner.session.max_drawdown = drawdown;
        }

        // Collapse the live entry to Flat.
        let pos = inner
            .positions
            .get_mut(symbol)
            .expect("position present, checked above");
        pos.size = 0.0;
        pos.side = PositionSide::Flat;
        pos.entry_price = 0.0;
        pos.avg_price = 0.0;
        pos.unrealized_pnl = 0.0;
        pos.realized_pnl = pnl;
        pos.owner_strategy = None;
        pos.last_update = now;

        info!(symbol, exit_price, realized_pnl = pnl, "position closed");
        Some(closed)
    }

    /// Hard reset without statistics. Used by reconciliation when the
    /// exchange reports zero size.
    pub fn clear_position(&self, symbol: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(pos) = inner.positions.get_mut(symbol) else {
            return false;
        };
        if !pos.is_active() {
            return false;
        }

        pos.size = 0.0;
        pos.side = PositionSide::Flat;
        pos.entry_price = 0.0;
        pos.avg_price = 0.0;
        pos.unrealized_pnl = 0.0;
        pos.realized_pnl = 0.0;
        pos.owner_strategy = None;
        pos.last_update = Utc::now();

        info!(symbol, "position force-cleared");
        true
    }

    /// Translate an exchange position record into local state.
    ///
    /// The exchange call happens in the caller; this only writes. The current
    /// owner is preserved so that a routine sync does not orphan an active
    /// position. Logging is throttled per symbol.
    pub fn sync_with_exchange(&self, symbol: &str, exchange_position: &ExchangePosition) -> bool {
        let size = exchange_position.size_f64();
        let side = if size > 0.0 {
            match Side::parse(&exchange_position.side) {
                Some(s) => PositionSide::from_order_side(s),
                None => {
                    error!(symbol, raw_side = %exchange_position.side, "sync failed: unknown side");
                    return false;
                }
            }
        } else {
            PositionSide::Flat
        };
        let avg_price = exchange_position.avg_price_f64();
        let unrealized = exchange_position.unrealised_pnl_f64();
        let leverage = exchange_position.leverage_f64();

        let owner = {
            let mut inner = self.inner.write();

            // Throttled sync logging.
            let count = inner.sync_counts.entry(symbol.to_string()).or_insert(0);
            *count += 1;
            let count_snapshot = *count;
            let log_due = match inner.last_sync_log.get(symbol) {
                Some(last) => last.elapsed().as_secs() >= self.cfg.sync_log_interval_secs,
                None => true,
            };
            if log_due {
                debug!(symbol, syncs = count_snapshot, "exchange sync");
                inner.last_sync_log.insert(symbol.to_string(), Instant::now());
                inner.sync_counts.insert(symbol.to_string(), 0);
            }

            inner
                .positions
                .get(symbol)
                .and_then(|p| p.owner_strategy.clone())
        };

        self.set_position(
            symbol,
            side,
            size,
            avg_price,
            avg_price,
            unrealized,
            leverage,
            owner.as_deref(),
        );
        true
    }

    // -------------------------------------------------------------------------
    // Global flags
    // -------------------------------------------------------------------------

    pub fn emergency_stop(&self) -> bool {
        self.inner.read().emergency_stop
    }

    pub fn emergency_reason(&self) -> Option<String> {
        self.inner.read().emergency_reason.clone()
    }

    /// Latch the emergency stop with a reason. Idempotent.
    pub fn latch_emergency_stop(&self, reason: &str) {
        let mut inner = self.inner.write();
        if !inner.emergency_stop {
            inner.emergency_stop = true;
            inner.emergency_reason = Some(reason.to_string());
            error!(reason, "EMERGENCY STOP ACTIVATED — all order flow halted");
        }
    }

    /// Set or clear the emergency-stop latch, logging the transition.
    pub fn set_emergency_stop(&self, value: bool) {
        let mut inner = self.inner.write();
        if value != inner.emergency_stop {
            inner.emergency_stop = value;
            if value {
                inner.emergency_reason.get_or_insert_with(|| "manual".to_string());
                error!("EMERGENCY STOP ACTIVATED — all order flow halted");
            } else {
                inner.emergency_reason = None;
                info!("emergency stop deactivated");
            }
        }
    }

    /// Effective trading gate: enabled AND not emergency-stopped.
    pub fn trading_enabled(&self) -> bool {
        let inner = self.inner.read();
        inner.trading_enabled && !inner.emergency_stop
    }

    pub fn set_trading_enabled(&self, value: bool) {
        let mut inner = self.inner.write();
        if inner.trading_enabled != value {
            inner.trading_enabled = value;
            info!(enabled = value, "trading flag changed");
        }
    }

    pub fn risk_limits_exceeded(&self) -> bool {
        self.inner.read().risk_limits_exceeded
    }

    pub fn set_risk_limits_exceeded(&self, value: bool) {
        let mut inner = self.inner.write();
        inner.risk_limits_exceeded = value;
        if value {
            warn!("risk limits exceeded");
        }
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    pub fn session_stats(&self) -> SessionSnapshot {
        let inner = self.inner.read();
        let stats = inner.session.clone();

        let (win_rate, avg_pnl) = if stats.trades > 0 {
            (
                (stats.wins as f64 / stats.trades as f64) * 100.0,
                stats.total_pnl / stats.trades as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let unrealized: f64 = inner
            .positions
            .values()
            .filter(|p| p.is_active())
            .map(|p| p.unrealized_pnl)
            .sum();

        SessionSnapshot {
            total_equity: stats.total_pnl + unrealized,
            unrealized_pnl: unrealized,
            win_rate,
            avg_pnl,
            stats,
        }
    }

    /// Fold one trade into a strategy's aggregates.
    pub fn update_strategy_stats(&self, strategy: &str, pnl: f64, signal_strength: Option<f64>) {
        let ring_size = self.cfg.signal_strength_ring_size;
        let mut inner = self.inner.write();
        let stats = inner
            .strategy_stats
            .entry(strategy.to_string())
            .or_insert_with(StrategyStats::new);

        stats.trades += 1;
        stats.total_pnl += pnl;
        stats.last_trade_time = Some(Utc::now());
        if pnl > 0.0 {
            stats.wins += 1;
        } else {
            stats.losses += 1;
        }
        stats.win_rate = (stats.wins as f64 / stats.trades as f64) * 100.0;
        stats.avg_pnl = stats.total_pnl / stats.trades as f64;

        if let Some(strength) = signal_strength {
            stats.signal_strengths.push_back(strength);
            while stats.signal_strengths.len() > ring_size {
                stats.signal_strengths.pop_front();
            }
        }
    }

    pub fn get_strategy_stats(&self, strategy: &str) -> Option<StrategyStats> {
        self.inner.read().strategy_stats.get(strategy).cloned()
    }

    pub fn all_strategy_stats(&self) -> HashMap<String, StrategyStats> {
        self.inner.read().strategy_stats.clone()
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    pub fn diagnostics(&self) -> StateDiagnostics {
        let inner = self.inner.read();
        StateDiagnostics {
            positions_count: inner.positions.len(),
            active_positions_count: inner.positions.values().filter(|p| p.is_active()).count(),
            strategies_count: inner.strategy_stats.len(),
            emergency_stop: inner.emergency_stop,
            trading_enabled: inner.trading_enabled && !inner.emergency_stop,
            risk_limits_exceeded: inner.risk_limits_exceeded,
            uptime_seconds: (Utc::now() - inner.session.start_time).num_seconds(),
        }
    }

    /// Cross-check internal invariants; returns a list of anomalies.
    pub fn validate_state_consistency(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut issues = Vec::new();

        for (symbol, pos) in &inner.positions {
            if pos.size < 0.0 {
                issues.push(format!("negative position size for {symbol}: {}", pos.size));
            }
            if pos.is_active() && pos.entry_price <= 0.0 {
                issues.push(format!("active position {symbol} with zero entry price"));
            }
            if !pos.is_active() && pos.side != PositionSide::Flat {
                issues.push(format!(
                    "flat position {symbol} still carries side {}",
                    pos.side
                ));
            }
        }

        let s = &inner.session;
        if s.wins + s.losses != s.trades {
            issues.push(format!(
                "trade counters inconsistent: {} wins + {} losses != {} trades",
                s.wins, s.losses, s.trades
            ));
        }

        issues
    }
}

impl std::fmt::Debug for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("AccountState")
            .field("positions", &inner.positions.len())
            .field("emergency_stop", &inner.emergency_stop)
            .field("trading_enabled", &inner.trading_enabled)
            .field("trades", &inner.session.trades)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
