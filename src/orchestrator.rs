// =============================================================================
// Orchestrator — signals in, safe orders out
// =============================================================================
//
// The thin layer that drives strategies. Per tick it gates on the trading
// flag, refreshes positions from the exchange, polls each strategy for a
// signal, and turns entries/exits into `OrderManager` submissions. It never
// talks to the exchange directly for order placement, and it is the only
// place that maps signals onto account-state mutations.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::account_state::AccountState;
use crate::config::{BotConfig, RequestKind};
use crate::error_handler::{ErrorContext, ErrorHandler, RecoveryAction};
use crate::errors::OrderError;
use crate::exchange::ExchangeClient;
use crate::journal::{StrategySignalLog, TradeJournal, TradeRecord};
use crate::notifier::{NotificationEvent, Notifier};
use crate::order_manager::{OrderManager, OrderRequest};
use crate::rate_limiter::RateLimiter;
use crate::security::SecureLogger;
use crate::types::{Candle, PositionSide, Side};

/// Rate-limiter identity of the orchestrator loop.
const CLIENT_ID: &str = "orchestrator";
/// Attempts at attaching stops after a fill.
const STOP_ATTEMPTS: u32 = 3;
/// Pause between stop attempts.
const STOP_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    EnterLong,
    EnterShort,
    ExitLong,
    ExitShort,
}

impl SignalKind {
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::EnterLong | Self::EnterShort)
    }

    /// The order side this signal maps to.
    pub fn order_side(&self) -> Side {
        match self {
            Self::EnterLong | Self::ExitShort => Side::Buy,
            Self::EnterShort | Self::ExitLong => Side::Sell,
        }
    }

    /// The position side an exit signal expects to find.
    pub fn expected_position(&self) -> Option<PositionSide> {
        match self {
            Self::ExitLong => Some(PositionSide::Long),
            Self::ExitShort => Some(PositionSide::Short),
            _ => None,
        }
    }
}

/// A trading decision produced by a strategy.
#[derive(Debug, Clone)]
pub struct Signal {
    pub kind: SignalKind,
    /// Order size for entries; exits close the full position.
    pub qty: f64,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strength: Option<f64>,
    pub comment: String,
}

impl Signal {
    /// Structural validation before a signal is acted on.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind.is_entry() && self.qty <= 0.0 {
            return Err(format!("entry signal with non-positive qty {}", self.qty));
        }
        if let Some(strength) = self.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(format!("signal strength {strength} outside [0, 1]"));
            }
        }
        Ok(())
    }
}

/// What a strategy sees each tick.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub symbol: String,
    pub last_price: f64,
    pub candles: Vec<Candle>,
}

/// Strategy implementations are opaque to the core; they only speak signals.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&mut self, view: &MarketView) -> Option<Signal>;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    symbols: Vec<String>,
    tick_interval: Duration,
    sync_interval: Duration,

    account: Arc<AccountState>,
    rate_limiter: Arc<RateLimiter>,
    error_handler: Arc<ErrorHandler>,
    order_manager: Arc<OrderManager>,
    client: Arc<dyn ExchangeClient>,

    strategies: Vec<Box<dyn Strategy>>,
    journal: TradeJournal,
    signal_log: StrategySignalLog,
    secure_log: SecureLogger,
    notifier: Arc<Notifier>,

    last_sync: HashMap<String, Instant>,
    entry_times: HashMap<String, DateTime<Utc>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &BotConfig,
        account: Arc<AccountState>,
        rate_limiter: Arc<RateLimiter>,
        error_handler: Arc<ErrorHandler>,
        order_manager: Arc<OrderManager>,
        client: Arc<dyn ExchangeClient>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            symbols: config.symbols.clone(),
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            sync_interval: Duration::from_secs(config.sync_interval_secs.max(1)),
            account,
            rate_limiter,
            error_handler,
            order_manager,
            client,
            strategies: Vec::new(),
            journal: TradeJournal::new(&config.journal_path),
            signal_log: StrategySignalLog::new(&config.strategy_log_dir),
            secure_log: SecureLogger::new("orchestrator"),
            notifier,
            last_sync: HashMap::new(),
            entry_times: HashMap::new(),
        }
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn Strategy>) {
        info!(strategy = strategy.name(), "strategy registered");
        self.strategies.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    /// Drive ticks forever.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        info!(
            symbols = ?self.symbols,
            strategies = self.strategies.len(),
            "orchestrator loop starting"
        );
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One pass: gate, sync, poll, act.
    pub async fn tick(&mut self) {
        if !self.account.trading_enabled() {
            debug!("trading gate closed — tick skipped");
            return;
        }

        for symbol in self.symbols.clone() {
            self.maybe_sync_positions(&symbol).await;

            let Some(view) = self.fetch_market_view(&symbol).await else {
                continue;
            };

            let signals: Vec<(String, Signal)> = self
                .strategies
                .iter_mut()
                .filter_map(|s| {
                    let name = s.name().to_string();
                    s.evaluate(&view).map(|sig| (name, sig))
                })
                .collect();

            for (strategy, signal) in signals {
                if let Err(reason) = signal.validate() {
                    warn!(strategy = %strategy, reason = %reason, "invalid signal dropped");
                    continue;
                }

                if signal.kind.is_entry() {
                    self.handle_entry(&symbol, &strategy, &signal, view.last_price)
                        .await;
                } else {
                    self.handle_exit(&symbol, &strategy, &signal, view.last_price)
                        .await;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exchange sync
    // -------------------------------------------------------------------------

    async fn maybe_sync_positions(&mut self, symbol: &str) {
        let due = self
            .last_sync
            .get(symbol)
            .map_or(true, |at| at.elapsed() >= self.sync_interval);
        if !due {
            return;
        }

        if let Err(e) = self
            .rate_limiter
            .acquire(RequestKind::PositionQuery, CLIENT_ID, Some(symbol))
        {
            debug!(symbol, error = %e, "position sync deferred by rate limiter");
            return;
        }

        match self.client.get_positions(Some(symbol)).await {
            Ok(positions) if positions.ret_code == 0 => {
                match positions.active_position() {
                    Some(active) => {
                        self.account.sync_with_exchange(symbol, active);
                    }
                    None => {
                        if self
                            .account
                            .get_position(symbol)
                            .is_some_and(|p| p.is_active())
                        {
                            warn!(symbol, "exchange reports flat — clearing local position");
                            self.account.clear_position(symbol);
                        }
                    }
                }
                self.last_sync.insert(symbol.to_string(), Instant::now());
            }
            Ok(positions) => {
                warn!(
                    symbol,
                    ret_code = positions.ret_code,
                    ret_msg = %positions.ret_msg,
                    "position sync rejected by exchange"
                );
            }
            Err(e) => {
                self.rate_limiter.record_api_failure("position_query");
                warn!(symbol, error = %e, "position sync failed");
            }
        }
    }

    async fn fetch_market_view(&self, symbol: &str) -> Option<MarketView> {
        if let Err(e) = self
            .rate_limiter
            .acquire(RequestKind::MarketData, CLIENT_ID, Some(symbol))
        {
            debug!(symbol, error = %e, "market data deferred by rate limiter");
            return None;
        }

        match self.client.get_ohlcv(symbol, "1", 100).await {
            Ok(candles) => {
                let last_price = candles.last().map(|c| c.close)?;
                if last_price <= 0.0 {
                    return None;
                }
                self.rate_limiter.record_api_success("market_data");
                Some(MarketView {
                    symbol: symbol.to_string(),
                    last_price,
                    candles,
                })
            }
            Err(e) => {
                self.rate_limiter.record_api_failure("market_data");
                warn!(symbol, error = %e, "market data fetch failed");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Entries
    // -------------------------------------------------------------------------

    async fn handle_entry(&mut self, symbol: &str, strategy: &str, signal: &Signal, last_price: f64) {
        if self
            .account
            .get_position(symbol)
            .is_some_and(|p| p.is_active())
        {
            debug!(symbol, strategy, "entry skipped — position already active");
            return;
        }

        let side = signal.kind.order_side();
        let request = OrderRequest::market(symbol, side, signal.qty, strategy)
            .with_stops(signal.stop_loss, signal.take_profit);
        self.secure_log.log_order_request(&request);

        match self.order_manager.submit(self.client.clone(), request).await {
            Ok(response) => {
                self.secure_log
                    .log_api_response(&response, "entry order acknowledged", "entry order failed");
                let entry_price = signal.entry_price.unwrap_or(last_price);
                self.account.set_position(
                    symbol,
                    PositionSide::from_order_side(side),
                    signal.qty,
                    entry_price,
                    entry_price,
                    0.0,
                    1.0,
                    Some(strategy),
                );
                self.entry_times.insert(symbol.to_string(), Utc::now());

                info!(
                    symbol,
                    strategy,
                    side = %side,
                    qty = signal.qty,
                    entry_price,
                    order_id = %response.result.order_id,
                    "position opened"
                );

                self.attach_stops(symbol, signal).await;

                let wire_signal = if side == Side::Buy { "BUY" } else { "SELL" };
                if let Err(e) =
                    self.signal_log
                        .log_signal(strategy, wire_signal, entry_price, &signal.comment)
                {
                    warn!(strategy, error = %e, "signal log write failed");
                }

                self.notifier
                    .dispatch(&NotificationEvent::PositionOpened {
                        symbol: symbol.to_string(),
                        side,
                        strategy: strategy.to_string(),
                        entry_price,
                        stop_loss: signal.stop_loss,
                        take_profit: signal.take_profit,
                        size: signal.qty,
                        signal_strength: signal.strength,
                        comment: signal.comment.clone(),
                    })
                    .await;
            }
            Err(err) => self.handle_submit_failure(symbol, strategy, "open_position", err).await,
        }
    }

    /// Attach SL/TP after the fill, retrying a few times. Best-effort: the
    /// position is live either way and the failure is loud in the logs.
    async fn attach_stops(&self, symbol: &str, signal: &Signal) {
        if signal.stop_loss.is_none() && signal.take_profit.is_none() {
            return;
        }

        for attempt in 1..=STOP_ATTEMPTS {
            match self
                .client
                .set_trading_stop(
                    symbol,
                    signal.stop_loss,
                    signal.take_profit,
                    "MarkPrice",
                    "MarkPrice",
                )
                .await
            {
                Ok(resp) if resp.is_success() => {
                    info!(
                        symbol,
                        stop_loss = ?signal.stop_loss,
                        take_profit = ?signal.take_profit,
                        attempt,
                        "stops attached"
                    );
                    return;
                }
                Ok(resp) => {
                    warn!(
                        symbol,
                        attempt,
                        ret_code = resp.ret_code,
                        ret_msg = %resp.ret_msg,
                        "set_trading_stop rejected"
                    );
                }
                Err(e) => {
                    warn!(symbol, attempt, error = %e, "set_trading_stop failed");
                }
            }

            if attempt < STOP_ATTEMPTS {
                tokio::time::sleep(STOP_RETRY_DELAY).await;
            }
        }

        warn!(symbol, attempts = STOP_ATTEMPTS, "could not attach stops");
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    async fn handle_exit(&mut self, symbol: &str, strategy: &str, signal: &Signal, last_price: f64) {
        let Some(position) = self.account.get_position(symbol).filter(|p| p.is_active()) else {
            warn!(symbol, strategy, "exit signal with no active position");
            return;
        };

        if signal.kind.expected_position() != Some(position.side) {
            warn!(
                symbol,
                strategy,
                signal = ?signal.kind,
                position_side = %position.side,
                "exit signal does not match position side"
            );
            return;
        }

        // Non-owner closes are permitted but called out.
        if position
            .owner_strategy
            .as_deref()
            .is_some_and(|owner| owner != strategy)
        {
            warn!(
                symbol,
                strategy,
                owner = ?position.owner_strategy,
                "position closed by a non-owner strategy"
            );
        }

        let close_side = signal.kind.order_side();
        let request =
            OrderRequest::market(symbol, close_side, position.size, strategy).reduce_only();
        self.secure_log.log_order_request(&request);

        match self.order_manager.submit(self.client.clone(), request).await {
            Ok(response) => {
                self.secure_log
                    .log_api_response(&response, "close order acknowledged", "close order failed");
                let Some(closed) = self.account.close_position(symbol, last_price, None) else {
                    warn!(symbol, "position vanished during close");
                    return;
                };

                self.account
                    .update_strategy_stats(strategy, closed.realized_pnl, signal.strength);
                self.error_handler.record_success(strategy, "close_position");

                let duration_secs = self
                    .entry_times
                    .remove(symbol)
                    .map(|opened| (Utc::now() - opened).num_seconds());

                let record = TradeRecord::new(
                    symbol,
                    closed.side.entry_order_side().unwrap_or(close_side.opposite()),
                    closed.size,
                    closed.entry_price,
                    last_price,
                    closed.realized_pnl,
                    signal.stop_loss,
                    signal.take_profit,
                    strategy,
                    &signal.comment,
                );
                if let Err(e) = self.journal.append(&record) {
                    warn!(symbol, error = %e, "trade journal write failed");
                }

                let wire_signal = if close_side == Side::Buy { "BUY" } else { "SELL" };
                if let Err(e) =
                    self.signal_log
                        .log_signal(strategy, wire_signal, last_price, &signal.comment)
                {
                    warn!(strategy, error = %e, "signal log write failed");
                }

                info!(
                    symbol,
                    strategy,
                    pnl = closed.realized_pnl,
                    exit_price = last_price,
                    "position closed"
                );

                self.notifier
                    .dispatch(&NotificationEvent::PositionClosed {
                        symbol: symbol.to_string(),
                        side: closed.side.entry_order_side().unwrap_or(close_side.opposite()),
                        strategy: strategy.to_string(),
                        exit_price: last_price,
                        pnl: closed.realized_pnl,
                        duration_secs,
                    })
                    .await;
            }
            Err(err) => {
                self.handle_submit_failure(symbol, strategy, "close_position", err)
                    .await
            }
        }
    }

    // -------------------------------------------------------------------------
    // Failure routing
    // -------------------------------------------------------------------------

    async fn handle_submit_failure(
        &self,
        symbol: &str,
        strategy: &str,
        operation: &str,
        err: OrderError,
    ) {
        if let OrderError::EmergencyStop { reason } = &err {
            self.notifier
                .dispatch(&NotificationEvent::EmergencyStop {
                    reason: reason.clone(),
                })
                .await;
        }

        let ctx = ErrorContext::new(strategy, symbol, operation);
        match self.error_handler.handle_order_error(&err, &ctx).await {
            Ok(RecoveryAction::Retry { attempt, .. }) => {
                debug!(symbol, strategy, attempt, "will retry on a later tick");
            }
            Ok(RecoveryAction::RestartStrategy { strategy }) => {
                warn!(strategy = %strategy, "restart directive issued");
            }
            Ok(RecoveryAction::Skip { .. }) | Ok(RecoveryAction::Ignore) => {}
            Err(halt) => {
                warn!(symbol, strategy, error = %halt, "order flow halted");
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("symbols", &self.symbols)
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountStateConfig, ErrorHandlerConfig, OrderManagerConfig, RateLimiterConfig};
    use crate::exchange::MockExchange;
    use std::collections::VecDeque;

    /// Strategy that replays a scripted list of signals.
    struct Scripted {
        name: String,
        signals: VecDeque<Signal>,
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn evaluate(&mut self, _view: &MarketView) -> Option<Signal> {
            self.signals.pop_front()
        }
    }

    fn enter_long(qty: f64) -> Signal {
        Signal {
            kind: SignalKind::EnterLong,
            qty,
            entry_price: Some(100.0),
            stop_loss: None,
            take_profit: None,
            strength: Some(0.8),
            comment: "test entry".into(),
        }
    }

    fn exit_long() -> Signal {
        Signal {
            kind: SignalKind::ExitLong,
            qty: 0.0,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            strength: Some(0.6),
            comment: "test exit".into(),
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        account: Arc<AccountState>,
        mock: Arc<MockExchange>,
        _dir: tempfile::TempDir,
    }

    fn harness(signals: Vec<Signal>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BotConfig::default();
        config.symbols = vec!["BTCUSDT".to_string()];
        config.journal_path = dir
            .path()
            .join("journal.csv")
            .to_string_lossy()
            .into_owned();
        config.strategy_log_dir = dir
            .path()
            .join("logs/strategies")
            .to_string_lossy()
            .into_owned();
        config.order_manager = OrderManagerConfig {
            min_symbol_interval_secs: 0.0,
            order_timeout_secs: 2.0,
            ..OrderManagerConfig::default()
        };

        let account = Arc::new(AccountState::new(AccountStateConfig::default()));
        let rate_limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::default(),
            account.clone(),
        ));
        let error_handler = Arc::new(ErrorHandler::new(
            ErrorHandlerConfig::default(),
            account.clone(),
        ));
        let order_manager = OrderManager::new(config.order_manager.clone(), account.clone());
        let mock = Arc::new(MockExchange::new());
        let client: Arc<dyn ExchangeClient> = mock.clone();

        let mut orchestrator = Orchestrator::new(
            &config,
            account.clone(),
            rate_limiter,
            error_handler,
            order_manager,
            client,
            Arc::new(Notifier::without_sinks()),
        );
        orchestrator.add_strategy(Box::new(Scripted {
            name: "S1".into(),
            signals: signals.into(),
        }));

        Harness {
            orchestrator,
            account,
            mock,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn entry_signal_opens_position_and_logs() {
        let mut h = harness(vec![enter_long(0.01)]);

        h.orchestrator.tick().await;

        assert_eq!(h.mock.create_order_calls(), 1);
        let pos = h.account.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.size, 0.01);
        assert_eq!(pos.owner_strategy.as_deref(), Some("S1"));

        let log_path = h._dir.path().join("logs/strategies/S1.log");
        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("Signal: BUY at 100"));
    }

    #[tokio::test]
    async fn exit_signal_closes_position_and_journals() {
        let mut h = harness(vec![enter_long(0.01), exit_long()]);

        // Tick 1 opens.
        h.orchestrator.tick().await;
        // Exchange reflects the open position for the reduce-only admission.
        h.mock.set_position("BTCUSDT", Side::Buy, 0.01, 100.0);
        // Tick 2 closes.
        h.orchestrator.tick().await;

        let pos = h.account.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.side, PositionSide::Flat);
        assert_eq!(pos.size, 0.0);

        let stats = h.account.session_stats();
        assert_eq!(stats.stats.trades, 1);

        let strategy_stats = h.account.get_strategy_stats("S1").unwrap();
        assert_eq!(strategy_stats.trades, 1);

        let journal = TradeJournal::new(h._dir.path().join("journal.csv"));
        let rows = journal.read_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTCUSDT");
        assert_eq!(rows[0].strategy, "S1");
    }

    #[tokio::test]
    async fn closed_gate_suppresses_all_activity() {
        let mut h = harness(vec![enter_long(0.01)]);
        h.account.set_trading_enabled(false);

        h.orchestrator.tick().await;

        assert_eq!(h.mock.create_order_calls(), 0);
        assert_eq!(h.mock.get_positions_calls(), 0);
        assert!(h
            .account
            .get_position("BTCUSDT")
            .map_or(true, |p| !p.is_active()));
    }

    #[tokio::test]
    async fn entry_skipped_when_position_already_active() {
        let mut h = harness(vec![enter_long(0.01), enter_long(0.02)]);

        h.orchestrator.tick().await;
        h.mock.set_position("BTCUSDT", Side::Buy, 0.01, 100.0);
        h.orchestrator.tick().await;

        // Only the first entry reached the exchange.
        assert_eq!(h.mock.create_order_calls(), 1);
        let pos = h.account.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.size, 0.01);
    }

    #[tokio::test]
    async fn mismatched_exit_is_dropped() {
        let mut h = harness(vec![Signal {
            kind: SignalKind::ExitShort,
            ..exit_long()
        }]);
        h.account.set_position(
            "BTCUSDT",
            PositionSide::Long,
            0.01,
            100.0,
            100.0,
            0.0,
            1.0,
            Some("S1"),
        );
        h.mock.set_position("BTCUSDT", Side::Buy, 0.01, 100.0);

        h.orchestrator.tick().await;

        // ExitShort against a long position: nothing happens.
        assert_eq!(h.mock.create_order_calls(), 0);
        assert!(h.account.get_position("BTCUSDT").unwrap().is_active());
    }

    #[tokio::test]
    async fn invalid_signal_is_dropped() {
        let mut h = harness(vec![enter_long(-1.0)]);
        h.orchestrator.tick().await;
        assert_eq!(h.mock.create_order_calls(), 0);
    }

    #[test]
    fn signal_kind_mappings() {
        assert_eq!(SignalKind::EnterLong.order_side(), Side::Buy);
        assert_eq!(SignalKind::EnterShort.order_side(), Side::Sell);
        assert_eq!(SignalKind::ExitLong.order_side(), Side::Sell);
        assert_eq!(SignalKind::ExitShort.order_side(), Side::Buy);
        assert!(SignalKind::EnterLong.is_entry());
        assert!(!SignalKind::ExitLong.is_entry());
        assert_eq!(
            SignalKind::ExitLong.expected_position(),
            Some(PositionSide::Long)
        );
    }
}
