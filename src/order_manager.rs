// =============================================================================
// Order Manager — serialized admission, bounded queue, worker pool
// =============================================================================
//
// Single entry point for every order submission. Guarantees, in admission
// order under the per-symbol lock:
//
//   1. Nothing is admitted while the emergency stop is latched.
//   2. Per-symbol ceiling (orders/minute) and minimum spacing are enforced.
//   3. An identical in-flight request (same fingerprint) is a duplicate.
//   4. A request conflicting with the live exchange position is rejected.
//
// The symbol lock is released before the caller awaits the worker's result.
// Workers retry transient exchange codes with capped exponential backoff and
// remove the pending entry in every terminal branch; the caller-side timeout
// makes a late completion a silent no-op (the oneshot send just fails).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::account_state::AccountState;
use crate::config::OrderManagerConfig;
use crate::errors::OrderError;
use crate::exchange::ExchangeClient;
use crate::types::{OrderResponse, OrderType, Side};

/// Bound on waiting for a queue slot before rejecting with QueueFull.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
/// Sanity ceiling on order quantity.
const MAX_ORDER_QTY: f64 = 1000.0;

// ---------------------------------------------------------------------------
// OrderRequest
// ---------------------------------------------------------------------------

/// Immutable description of one order to be placed.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
    pub position_idx: Option<u8>,
    pub strategy_name: String,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    /// A market order with no stops attached.
    pub fn market(symbol: &str, side: Side, qty: f64, strategy_name: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            stop_loss: None,
            take_profit: None,
            reduce_only: false,
            position_idx: None,
            strategy_name: strategy_name.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_stops(mut self, stop_loss: Option<f64>, take_profit: Option<f64>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Deterministic identity for duplicate detection: two requests with the
    /// same side, type, quantity, price, and strategy are "the same".
    pub fn fingerprint(&self) -> String {
        let price = match self.price {
            Some(p) => p.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{}_{}_{}_{}_{}",
            self.side, self.order_type, self.qty, price, self.strategy_name
        )
    }

    /// Validate parameters; an empty vector means the request is well-formed.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let symbol = self.symbol.trim();
        if symbol.is_empty() {
            errors.push("symbol must not be empty".to_string());
        } else if symbol.len() < 3 {
            errors.push(format!("symbol '{symbol}' is too short"));
        }

        if self.qty <= 0.0 {
            errors.push("quantity must be positive".to_string());
        } else if self.qty > MAX_ORDER_QTY {
            errors.push(format!("quantity {} exceeds sanity cap {MAX_ORDER_QTY}", self.qty));
        }

        match self.order_type {
            OrderType::Limit => match self.price {
                None => errors.push("price is required for limit orders".to_string()),
                Some(p) if p <= 0.0 => errors.push("price must be positive".to_string()),
                _ => {}
            },
            OrderType::Market => {}
        }

        if let Some(sl) = self.stop_loss {
            if sl <= 0.0 {
                errors.push("stop loss must be positive".to_string());
            }
        }
        if let Some(tp) = self.take_profit {
            if tp <= 0.0 {
                errors.push("take profit must be positive".to_string());
            }
        }

        // Directional sanity when entry, SL and TP are all present.
        if let (Some(price), Some(sl), Some(tp)) = (self.price, self.stop_loss, self.take_profit) {
            if price > 0.0 && sl > 0.0 && tp > 0.0 {
                match self.side {
                    Side::Buy => {
                        if sl >= price {
                            errors.push("stop loss for a buy must be below entry".to_string());
                        }
                        if tp <= price {
                            errors.push("take profit for a buy must be above entry".to_string());
                        }
                    }
                    Side::Sell => {
                        if sl <= price {
                            errors.push("stop loss for a sell must be above entry".to_string());
                        }
                        if tp >= price {
                            errors.push("take profit for a sell must be below entry".to_string());
                        }
                    }
                }
            }
        }

        errors
    }
}

/// An admitted request awaiting exchange acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub request: OrderRequest,
    pub created_at: Instant,
}

/// Counters exposed by `stats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderStats {
    pub total_orders: u64,
    pub rejected_orders: u64,
    pub duplicate_blocks: u64,
    pub rate_limit_blocks: u64,
    pub pending_orders: usize,
    pub active_positions: usize,
    pub symbol_locks: usize,
    pub emergency_stop: bool,
}

// ---------------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------------

struct SubmitJob {
    request: OrderRequest,
    fingerprint: String,
    client: Arc<dyn ExchangeClient>,
    reply: oneshot::Sender<Result<OrderResponse, OrderError>>,
}

enum WorkerJob {
    Submit(Box<SubmitJob>),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Internal synchronous state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Managed {
    /// Lazily created per-symbol admission locks; creation is guarded by the
    /// surrounding manager lock.
    symbol_locks: HashMap<String, Arc<AsyncMutex<()>>>,
    /// symbol -> fingerprint -> pending entry.
    pending: HashMap<String, HashMap<String, PendingOrder>>,
    /// Per-symbol timestamps of successful submissions (60 s window).
    order_windows: HashMap<String, VecDeque<Instant>>,
    last_order_time: HashMap<String, Instant>,

    total_orders: u64,
    rejected_orders: u64,
    duplicate_blocks: u64,
    rate_limit_blocks: u64,
}

// ---------------------------------------------------------------------------
// OrderManager
// ---------------------------------------------------------------------------

/// Thread-safe order submission pipeline shared via `Arc<OrderManager>`.
pub struct OrderManager {
    cfg: OrderManagerConfig,
    account: Arc<AccountState>,
    sync: Mutex<Managed>,
    queue_tx: mpsc::Sender<WorkerJob>,
    shutdown_flag: AtomicBool,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl OrderManager {
    /// Construct the manager and spawn its worker pool. Must be called from
    /// within a tokio runtime.
    pub fn new(cfg: OrderManagerConfig, account: Arc<AccountState>) -> Arc<Self> {
        let worker_count = cfg.worker_count.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(cfg.queue_capacity.max(1));

        let manager = Arc::new(Self {
            cfg,
            account,
            sync: Mutex::new(Managed::default()),
            queue_tx,
            shutdown_flag: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let queue_rx = Arc::new(AsyncMutex::new(queue_rx));
        let mut handles = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let mgr = Arc::clone(&manager);
            let rx = Arc::clone(&queue_rx);
            handles.push(tokio::spawn(Self::worker_loop(mgr, rx, idx)));
        }
        *manager.workers.lock() = handles;

        info!(workers = worker_count, "OrderManager initialised");
        manager
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Submit one order through the full admission pipeline and await its
    /// outcome, bounded by the configured order timeout.
    pub async fn submit(
        &self,
        client: Arc<dyn ExchangeClient>,
        request: OrderRequest,
    ) -> Result<OrderResponse, OrderError> {
        if self.shutdown_flag.load(Ordering::SeqCst) {
            return Err(OrderError::ShuttingDown);
        }

        let validation_errors = request.validate();
        if !validation_errors.is_empty() {
            return Err(OrderError::InvalidArgument {
                message: validation_errors.join("; "),
            });
        }

        let symbol = request.symbol.clone();
        let fingerprint = request.fingerprint();
        let symbol_lock = self.symbol_lock(&symbol);

        // ── Admission, serialized per symbol ─────────────────────────────
        let reply_rx = {
            let _guard = symbol_lock.lock().await;

            debug!(
                symbol = %symbol,
                strategy = %request.strategy_name,
                side = %request.side,
                qty = request.qty,
                "admission checks started"
            );

            if self.account.emergency_stop() {
                return Err(OrderError::EmergencyStop {
                    reason: self
                        .account
                        .emergency_reason()
                        .unwrap_or_else(|| "latched".to_string()),
                });
            }

            self.check_rate(&symbol)?;
            self.check_duplicate(&symbol, &fingerprint)?;
            self.check_position_conflict(&client, &request).await?;

            self.register_pending(&symbol, &fingerprint, &request);

            let (reply_tx, reply_rx) = oneshot::channel();
            let job = WorkerJob::Submit(Box::new(SubmitJob {
                request: request.clone(),
                fingerprint: fingerprint.clone(),
                client,
                reply: reply_tx,
            }));

            match self.queue_tx.send_timeout(job, ENQUEUE_TIMEOUT).await {
                Ok(()) => reply_rx,
                Err(_) => {
                    self.remove_pending(&symbol, &fingerprint);
                    warn!(symbol = %symbol, "submission queue full — order rejected");
                    return Err(OrderError::QueueFull { symbol });
                }
            }
            // Symbol lock released here, before awaiting the worker.
        };

        // ── Await the worker's verdict ───────────────────────────────────
        let timeout = Duration::from_secs_f64(self.cfg.order_timeout_secs);
        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_elapsed) => {
                self.remove_pending(&symbol, &fingerprint);
                self.sync.lock().rejected_orders += 1;
                warn!(symbol = %symbol, timeout_secs = self.cfg.order_timeout_secs, "order timed out");
                Err(OrderError::Timeout {
                    symbol,
                    timeout_secs: self.cfg.order_timeout_secs,
                })
            }
            Ok(Err(_recv)) => {
                self.remove_pending(&symbol, &fingerprint);
                self.sync.lock().rejected_orders += 1;
                if self.shutdown_flag.load(Ordering::SeqCst) {
                    Err(OrderError::ShuttingDown)
                } else {
                    Err(OrderError::ExchangeUnavailable {
                        message: "order worker dropped the job".to_string(),
                    })
                }
            }
            Ok(Ok(Err(err))) => {
                // Pending entry was removed by the worker; removal here is a
                // no-op kept for the timeout race.
                self.remove_pending(&symbol, &fingerprint);
                self.sync.lock().rejected_orders += 1;
                Err(err)
            }
            Ok(Ok(Ok(response))) => {
                let now = Instant::now();
                {
                    let mut m = self.sync.lock();
                    let window = m.order_windows.entry(symbol.clone()).or_default();
                    Self::prune_window(window, now);
                    window.push_back(now);
                    m.last_order_time.insert(symbol.clone(), now);
                    m.total_orders += 1;
                }
                self.remove_pending(&symbol, &fingerprint);

                info!(
                    symbol = %symbol,
                    order_id = %response.result.order_id,
                    strategy = %request.strategy_name,
                    "order placed"
                );
                Ok(response)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Admission checks
    // -------------------------------------------------------------------------

    fn symbol_lock(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        let mut m = self.sync.lock();
        m.symbol_locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
        while window
            .front()
            .is_some_and(|&ts| now.duration_since(ts) >= Duration::from_secs(60))
        {
            window.pop_front();
        }
    }

    fn check_rate(&self, symbol: &str) -> Result<(), OrderError> {
        let now = Instant::now();
        let mut m = self.sync.lock();

        let window = m.order_windows.entry(symbol.to_string()).or_default();
        Self::prune_window(window, now);
        let count = window.len() as u32;

        if count >= self.cfg.max_orders_per_minute {
            m.rate_limit_blocks += 1;
            return Err(OrderError::RateLimitExceeded {
                scope: symbol.to_string(),
                message: format!(
                    "{count}/{} orders per minute",
                    self.cfg.max_orders_per_minute
                ),
            });
        }

        if let Some(last) = m.last_order_time.get(symbol) {
            let since = last.elapsed().as_secs_f64();
            if since < self.cfg.min_symbol_interval_secs {
                return Err(OrderError::RateLimitExceeded {
                    scope: symbol.to_string(),
                    message: format!(
                        "only {since:.2}s since last order (min {:.1}s)",
                        self.cfg.min_symbol_interval_secs
                    ),
                });
            }
        }

        Ok(())
    }

    fn check_duplicate(&self, symbol: &str, fingerprint: &str) -> Result<(), OrderError> {
        let mut m = self.sync.lock();
        if let Some(pending) = m.pending.get(symbol).and_then(|p| p.get(fingerprint)) {
            let age = pending.created_at.elapsed().as_secs_f64();
            if age < self.cfg.pending_duplicate_window_secs {
                m.duplicate_blocks += 1;
                return Err(OrderError::DuplicateOrder {
                    symbol: symbol.to_string(),
                    message: format!("identical order already in flight ({age:.1}s old)"),
                });
            }
        }
        Ok(())
    }

    /// Fetch live positions, fold them into the account state, and reject
    /// requests that fight the current exposure.
    async fn check_position_conflict(
        &self,
        client: &Arc<dyn ExchangeClient>,
        request: &OrderRequest,
    ) -> Result<(), OrderError> {
        let symbol = &request.symbol;

        let positions = client.get_positions(Some(symbol)).await.map_err(|e| {
            OrderError::ExchangeUnavailable {
                message: format!("position check failed: {e}"),
            }
        })?;

        if positions.ret_code != 0 {
            return Err(OrderError::ExchangeUnavailable {
                message: format!(
                    "position query returned ret_code {}: {}",
                    positions.ret_code, positions.ret_msg
                ),
            });
        }

        match positions.active_position() {
            Some(active) => {
                self.account.sync_with_exchange(symbol, active);

                if let Some(current_side) = Side::parse(&active.side) {
                    if !request.reduce_only && current_side != request.side {
                        return Err(OrderError::PositionConflict {
                            symbol: symbol.clone(),
                            message: format!(
                                "active {current_side} position, requested {} without reduce_only",
                                request.side
                            ),
                        });
                    }
                }
            }
            None => {
                // The exchange is flat; drop any stale local position.
                if self
                    .account
                    .get_position(symbol)
                    .is_some_and(|p| p.is_active())
                {
                    self.account.clear_position(symbol);
                }

                if request.reduce_only {
                    return Err(OrderError::PositionConflict {
                        symbol: symbol.clone(),
                        message: "reduce-only order without an active position".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn register_pending(&self, symbol: &str, fingerprint: &str, request: &OrderRequest) {
        let mut m = self.sync.lock();
        m.pending.entry(symbol.to_string()).or_default().insert(
            fingerprint.to_string(),
            PendingOrder {
                request: request.clone(),
                created_at: Instant::now(),
            },
        );
    }

    fn remove_pending(&self, symbol: &str, fingerprint: &str) {
        let mut m = self.sync.lock();
        if let Some(per_symbol) = m.pending.get_mut(symbol) {
            per_symbol.remove(fingerprint);
            if per_symbol.is_empty() {
                m.pending.remove(symbol);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Worker pool
    // -------------------------------------------------------------------------

    async fn worker_loop(
        mgr: Arc<Self>,
        queue_rx: Arc<AsyncMutex<mpsc::Receiver<WorkerJob>>>,
        idx: usize,
    ) {
        loop {
            let job = {
                let mut rx = queue_rx.lock().await;
                rx.recv().await
            };

            match job {
                None | Some(WorkerJob::Shutdown) => break,
                Some(WorkerJob::Submit(job)) => mgr.process_job(*job).await,
            }
        }
        debug!(worker = idx, "order worker stopped");
    }

    async fn process_job(&self, job: SubmitJob) {
        let symbol = job.request.symbol.clone();

        // Jobs drained after shutdown complete with ShuttingDown.
        if self.shutdown_flag.load(Ordering::SeqCst) {
            self.remove_pending(&symbol, &job.fingerprint);
            let _ = job.reply.send(Err(OrderError::ShuttingDown));
            return;
        }

        let max_attempts = self.cfg.max_worker_retries.max(1);
        for attempt in 0..max_attempts {
            let result = job
                .client
                .create_order(
                    &job.request.symbol,
                    job.request.side,
                    job.request.order_type,
                    job.request.qty,
                    job.request.price,
                    job.request.stop_loss,
                    job.request.take_profit,
                    job.request.reduce_only,
                    job.request.position_idx,
                )
                .await;

            match result {
                Ok(response) if response.is_success() => {
                    self.remove_pending(&symbol, &job.fingerprint);
                    // A late send after caller timeout fails silently.
                    let _ = job.reply.send(Ok(response));
                    return;
                }
                Ok(response) => {
                    let retryable = self.cfg.retryable_ret_codes.contains(&response.ret_code);
                    warn!(
                        symbol = %symbol,
                        ret_code = response.ret_code,
                        ret_msg = %response.ret_msg,
                        attempt = attempt + 1,
                        retryable,
                        "exchange returned error"
                    );

                    if retryable && attempt + 1 < max_attempts {
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                        continue;
                    }

                    self.remove_pending(&symbol, &job.fingerprint);
                    let _ = job.reply.send(Err(OrderError::OrderRejection {
                        symbol: symbol.clone(),
                        strategy: job.request.strategy_name.clone(),
                        ret_msg: response.ret_msg,
                    }));
                    return;
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        attempt = attempt + 1,
                        "transport failure while placing order"
                    );

                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                        continue;
                    }

                    self.remove_pending(&symbol, &job.fingerprint);
                    let _ = job.reply.send(Err(OrderError::ExchangeUnavailable {
                        message: e.to_string(),
                    }));
                    return;
                }
            }
        }

        // The loop returns from every branch; never leave a caller hanging
        // if that invariant is ever broken.
        self.remove_pending(&symbol, &job.fingerprint);
        let _ = job.reply.send(Err(OrderError::OrderRejection {
            symbol,
            strategy: job.request.strategy_name.clone(),
            ret_msg: "retries exhausted".to_string(),
        }));
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let delay = self.cfg.retry_base_delay_secs * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.cfg.retry_backoff_cap_secs))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Drain the workers and stop accepting submissions. Idempotent; joining
    /// is bounded by `timeout` and logged (never aborted) on overrun.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            return;
        }

        let worker_count = {
            let workers = self.workers.lock();
            workers.len()
        };
        for _ in 0..worker_count {
            let _ = self.queue_tx.send(WorkerJob::Shutdown).await;
        }

        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + timeout;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("order worker did not stop within the shutdown timeout");
            }
        }

        info!("OrderManager shut down");
    }

    /// Remove pending entries older than `max_age_seconds` (worker losses).
    pub fn cleanup_expired_pending(&self, max_age_seconds: u64) -> usize {
        let mut m = self.sync.lock();
        let mut removed = 0;

        m.pending.retain(|symbol, per_symbol| {
            per_symbol.retain(|fingerprint, pending| {
                let expired = pending.created_at.elapsed().as_secs() >= max_age_seconds;
                if expired {
                    removed += 1;
                    warn!(symbol = %symbol, fingerprint = %fingerprint, "expired pending order removed");
                }
                !expired
            });
            !per_symbol.is_empty()
        });

        removed
    }

    pub fn stats(&self) -> OrderStats {
        let m = self.sync.lock();
        OrderStats {
            total_orders: m.total_orders,
            rejected_orders: m.rejected_orders,
            duplicate_blocks: m.duplicate_blocks,
            rate_limit_blocks: m.rate_limit_blocks,
            pending_orders: m.pending.values().map(|p| p.len()).sum(),
            active_positions: self.account.get_active_positions().len(),
            symbol_locks: m.symbol_locks.len(),
            emergency_stop: self.account.emergency_stop(),
        }
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.sync.lock();
        f.debug_struct("OrderManager")
            .field("pending", &m.pending.values().map(|p| p.len()).sum::<usize>())
            .field("total_orders", &m.total_orders)
            .field("shutdown", &self.shutdown_flag.load(Ordering::SeqCst))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountStateConfig;
    use crate::exchange::MockExchange;
    use crate::types::PositionSide;

    fn fast_cfg() -> OrderManagerConfig {
        OrderManagerConfig {
            min_symbol_interval_secs: 0.0,
            retry_base_delay_secs: 0.01,
            retry_backoff_cap_secs: 0.05,
            order_timeout_secs: 2.0,
            ..OrderManagerConfig::default()
        }
    }

    fn setup(cfg: OrderManagerConfig) -> (Arc<OrderManager>, Arc<AccountState>, Arc<MockExchange>) {
        let account = Arc::new(AccountState::new(AccountStateConfig::default()));
        let manager = OrderManager::new(cfg, account.clone());
        let mock = Arc::new(MockExchange::new());
        (manager, account, mock)
    }

    fn client(mock: &Arc<MockExchange>) -> Arc<dyn ExchangeClient> {
        mock.clone() as Arc<dyn ExchangeClient>
    }

    #[test]
    fn fingerprint_is_deterministic_and_discriminating() {
        let a = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let b = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = OrderRequest::market("BTCUSDT", Side::Buy, 0.02, "S1");
        assert_ne!(a.fingerprint(), c.fingerprint());

        let d = OrderRequest::market("BTCUSDT", Side::Sell, 0.01, "S1");
        assert_ne!(a.fingerprint(), d.fingerprint());

        let e = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S2");
        assert_ne!(a.fingerprint(), e.fingerprint());
    }

    #[test]
    fn validation_catches_bad_parameters() {
        let ok = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        assert!(ok.validate().is_empty());

        let mut bad = OrderRequest::market("", Side::Buy, -1.0, "S1");
        bad.order_type = OrderType::Limit;
        let errors = bad.validate();
        assert!(errors.iter().any(|e| e.contains("symbol")));
        assert!(errors.iter().any(|e| e.contains("quantity")));
        assert!(errors.iter().any(|e| e.contains("price is required")));

        // SL/TP on the wrong side of entry.
        let mut inverted = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        inverted.order_type = OrderType::Limit;
        inverted.price = Some(100.0);
        inverted.stop_loss = Some(110.0);
        inverted.take_profit = Some(90.0);
        let errors = inverted.validate();
        assert!(errors.iter().any(|e| e.contains("stop loss for a buy")));
        assert!(errors.iter().any(|e| e.contains("take profit for a buy")));
    }

    #[tokio::test]
    async fn happy_path_places_order_and_books_stats() {
        let (mgr, _account, mock) = setup(fast_cfg());

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let response = mgr.submit(client(&mock), request).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.result.order_id, "MOCK-1");
        assert_eq!(mock.create_order_calls(), 1);

        let stats = mgr.stats();
        assert_eq!(stats.total_orders, 1);
        assert_eq!(stats.rejected_orders, 0);
        assert_eq!(stats.pending_orders, 0);
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_exchange() {
        let (mgr, _, mock) = setup(fast_cfg());
        let request = OrderRequest::market("BTCUSDT", Side::Buy, -5.0, "S1");

        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidArgument { .. }));
        assert_eq!(mock.create_order_calls(), 0);
        assert_eq!(mock.get_positions_calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_in_flight_is_blocked_and_exchange_called_once() {
        let (mgr, _, mock) = setup(fast_cfg());
        mock.set_order_latency(Duration::from_millis(400));

        let first_mgr = mgr.clone();
        let first_client = client(&mock);
        let first = tokio::spawn(async move {
            let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
            first_mgr.submit(first_client, request).await
        });

        // Let the first submission pass admission and reach the worker.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::DuplicateOrder { .. }));
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "duplicate rejection must be immediate"
        );

        let first = first.await.unwrap().unwrap();
        assert!(first.is_success());
        assert_eq!(mock.create_order_calls(), 1, "exchange touched once");
        assert_eq!(mgr.stats().duplicate_blocks, 1);
    }

    #[tokio::test]
    async fn per_minute_ceiling_blocks_fourth_order() {
        let cfg = OrderManagerConfig {
            max_orders_per_minute: 3,
            ..fast_cfg()
        };
        let (mgr, _, mock) = setup(cfg);

        for i in 1..=3 {
            // Distinct quantities keep the fingerprints distinct.
            let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01 * i as f64, "S1");
            mgr.submit(client(&mock), request).await.unwrap();
        }

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.04, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::RateLimitExceeded { .. }));

        assert_eq!(mock.create_order_calls(), 3);
        let stats = mgr.stats();
        assert_eq!(stats.rate_limit_blocks, 1);
        assert_eq!(stats.total_orders, 3);
    }

    #[tokio::test]
    async fn minimum_interval_is_enforced() {
        let cfg = OrderManagerConfig {
            min_symbol_interval_secs: 60.0,
            ..fast_cfg()
        };
        let (mgr, _, mock) = setup(cfg);

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        mgr.submit(client(&mock), request).await.unwrap();

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.02, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        match err {
            OrderError::RateLimitExceeded { message, .. } => {
                assert!(message.contains("since last order"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.create_order_calls(), 1);
        // The minimum-interval guard is not the ceiling counter.
        assert_eq!(mgr.stats().rate_limit_blocks, 0);
    }

    #[tokio::test]
    async fn opposite_side_position_conflicts_without_reduce_only() {
        let (mgr, account, mock) = setup(fast_cfg());
        mock.set_position("BTCUSDT", Side::Buy, 0.02, 30000.0);

        let request = OrderRequest::market("BTCUSDT", Side::Sell, 0.02, "S2");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::PositionConflict { .. }));
        assert_eq!(mock.create_order_calls(), 0, "no exchange order placed");

        // Admission synced the exchange position into the account state.
        let pos = account.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.size, 0.02);
    }

    #[tokio::test]
    async fn reduce_only_requires_active_position() {
        let (mgr, _, mock) = setup(fast_cfg());

        let request = OrderRequest::market("BTCUSDT", Side::Sell, 0.02, "S1").reduce_only();
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        match err {
            OrderError::PositionConflict { message, .. } => {
                assert!(message.contains("reduce-only"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.create_order_calls(), 0);
    }

    #[tokio::test]
    async fn reduce_only_against_opposite_position_is_admitted() {
        let (mgr, _, mock) = setup(fast_cfg());
        mock.set_position("BTCUSDT", Side::Buy, 0.02, 30000.0);

        let request = OrderRequest::market("BTCUSDT", Side::Sell, 0.02, "S1").reduce_only();
        let response = mgr.submit(client(&mock), request).await.unwrap();
        assert!(response.is_success());
        assert_eq!(mock.create_order_calls(), 1);
    }

    #[tokio::test]
    async fn stale_local_position_cleared_when_exchange_flat() {
        let (mgr, account, mock) = setup(fast_cfg());
        account.set_position(
            "BTCUSDT",
            PositionSide::Long,
            0.05,
            30000.0,
            30000.0,
            0.0,
            1.0,
            Some("S1"),
        );

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        mgr.submit(client(&mock), request).await.unwrap();

        let pos = account.get_position("BTCUSDT").unwrap();
        assert_eq!(pos.side, PositionSide::Flat, "reconciled against flat exchange");
    }

    #[tokio::test]
    async fn transient_codes_retry_then_succeed() {
        let (mgr, _, mock) = setup(fast_cfg());
        mock.push_order_response(OrderResponse::failure(-1001, "too many visits"));
        mock.push_order_response(OrderResponse::failure(-1001, "too many visits"));

        let started = Instant::now();
        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let response = mgr.submit(client(&mock), request).await.unwrap();

        assert!(response.is_success());
        assert_eq!(mock.create_order_calls(), 3);
        // Backoff 0.01 + 0.02 at minimum.
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn non_transient_code_fails_without_retry() {
        let (mgr, _, mock) = setup(fast_cfg());
        mock.push_order_response(OrderResponse::failure(-3005, "insufficient balance"));

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        match err {
            OrderError::OrderRejection { ret_msg, .. } => {
                assert!(ret_msg.contains("insufficient balance"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.create_order_calls(), 1);
        assert_eq!(mgr.stats().rejected_orders, 1);
        assert_eq!(mgr.stats().pending_orders, 0);
    }

    #[tokio::test]
    async fn transport_errors_exhaust_retries() {
        let (mgr, _, mock) = setup(fast_cfg());
        mock.push_transport_error("connection reset");
        mock.push_transport_error("connection reset");
        mock.push_transport_error("connection reset");

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::ExchangeUnavailable { .. }));
        assert_eq!(mock.create_order_calls(), 3);
    }

    #[tokio::test]
    async fn emergency_latch_short_circuits_admission() {
        let (mgr, account, mock) = setup(fast_cfg());
        account.latch_emergency_stop("test latch");

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::EmergencyStop { .. }));
        assert_eq!(mock.get_positions_calls(), 0, "no admission checks ran");
        assert_eq!(mock.create_order_calls(), 0);

        // Deactivation re-admits.
        account.set_emergency_stop(false);
        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        assert!(mgr.submit(client(&mock), request).await.is_ok());
    }

    #[tokio::test]
    async fn caller_timeout_drops_late_success() {
        let cfg = OrderManagerConfig {
            order_timeout_secs: 0.1,
            ..fast_cfg()
        };
        let (mgr, account, mock) = setup(cfg);
        mock.set_order_latency(Duration::from_millis(400));

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::Timeout { .. }));
        assert_eq!(mgr.stats().pending_orders, 0, "pending removed on timeout");

        // Let the worker finish late; its completion must be a silent no-op.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(mgr.stats().total_orders, 0);
        assert!(account
            .get_position("BTCUSDT")
            .map_or(true, |p| !p.is_active()));
    }

    #[tokio::test]
    async fn full_queue_rejects_within_a_second() {
        let cfg = OrderManagerConfig {
            worker_count: 1,
            queue_capacity: 1,
            order_timeout_secs: 10.0,
            ..fast_cfg()
        };
        let (mgr, _, mock) = setup(cfg);
        mock.set_order_latency(Duration::from_millis(1300));

        // First order occupies the single worker; second fills the queue.
        let m1 = mgr.clone();
        let c1 = client(&mock);
        let h1 = tokio::spawn(async move {
            m1.submit(c1, OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let m2 = mgr.clone();
        let c2 = client(&mock);
        let h2 = tokio::spawn(async move {
            m2.submit(c2, OrderRequest::market("BTCUSDT", Side::Buy, 0.02, "S1"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let err = mgr
            .submit(
                client(&mock),
                OrderRequest::market("BTCUSDT", Side::Buy, 0.03, "S1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::QueueFull { .. }));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1500), "waited {waited:?}");

        // The rejected order leaves no pending entry behind.
        assert!(h1.await.unwrap().is_ok());
        assert!(h2.await.unwrap().is_ok());
        assert_eq!(mgr.stats().pending_orders, 0);
    }

    #[tokio::test]
    async fn shutdown_is_graceful_and_idempotent() {
        let (mgr, _, mock) = setup(fast_cfg());

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        mgr.submit(client(&mock), request).await.unwrap();

        mgr.shutdown(Duration::from_secs(1)).await;
        mgr.shutdown(Duration::from_secs(1)).await; // no-op

        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.02, "S1");
        let err = mgr.submit(client(&mock), request).await.unwrap_err();
        assert!(matches!(err, OrderError::ShuttingDown));
    }

    #[tokio::test]
    async fn queued_jobs_complete_with_shutting_down() {
        let cfg = OrderManagerConfig {
            worker_count: 1,
            order_timeout_secs: 5.0,
            ..fast_cfg()
        };
        let (mgr, _, mock) = setup(cfg);
        mock.set_order_latency(Duration::from_millis(400));

        let m1 = mgr.clone();
        let c1 = client(&mock);
        let h1 = tokio::spawn(async move {
            m1.submit(c1, OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let m2 = mgr.clone();
        let c2 = client(&mock);
        let h2 = tokio::spawn(async move {
            m2.submit(c2, OrderRequest::market("BTCUSDT", Side::Buy, 0.02, "S1"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        mgr.shutdown(Duration::from_secs(2)).await;

        // The in-flight order resolves normally; the queued one is drained
        // with ShuttingDown.
        assert!(h1.await.unwrap().is_ok());
        let err = h2.await.unwrap().unwrap_err();
        assert!(matches!(err, OrderError::ShuttingDown));
    }

    #[tokio::test]
    async fn expired_pending_entries_are_collected() {
        let (mgr, _, _) = setup(fast_cfg());

        // Simulate a worker loss by planting a pending entry directly.
        {
            let mut m = mgr.sync.lock();
            let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
            m.pending.entry("BTCUSDT".to_string()).or_default().insert(
                request.fingerprint(),
                PendingOrder {
                    request,
                    created_at: Instant::now(),
                },
            );
        }

        // Younger than the cutoff: kept.
        assert_eq!(mgr.cleanup_expired_pending(60), 0);
        assert_eq!(mgr.stats().pending_orders, 1);

        // Zero cutoff expires everything.
        assert_eq!(mgr.cleanup_expired_pending(0), 1);
        assert_eq!(mgr.stats().pending_orders, 0);
    }

    #[tokio::test]
    async fn symbols_admit_in_parallel() {
        let (mgr, _, mock) = setup(fast_cfg());
        mock.set_order_latency(Duration::from_millis(200));

        let started = Instant::now();
        let mut handles = Vec::new();
        for (i, symbol) in ["BTCUSDT", "ETHUSDT"].iter().enumerate() {
            let m = mgr.clone();
            let c = client(&mock);
            let sym = symbol.to_string();
            handles.push(tokio::spawn(async move {
                m.submit(c, OrderRequest::market(&sym, Side::Buy, 0.01 + i as f64 * 0.01, "S1"))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        // Two workers, two symbols: the 200 ms latencies overlap.
        assert!(started.elapsed() < Duration::from_millis(390));
        assert_eq!(mgr.stats().total_orders, 2);
    }
}
