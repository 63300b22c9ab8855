// =============================================================================
// Deterministic mock exchange for tests
// =============================================================================
//
// The mock is fully scripted: tests seed the positions it reports and queue
// the responses (or transport errors) `create_order` hands out, in order.
// When the script runs dry, orders succeed with sequential MOCK-n ids. Every
// operation counts its calls so tests can assert exactly how often the
// exchange was touched.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::exchange::ExchangeClient;
use crate::types::{
    Candle, ExchangePosition, OpenOrdersResponse, OrderResponse, OrderType, PositionsResponse,
    PositionsResult, ServerTime, Side, WalletBalance,
};

/// One scripted outcome for `create_order`.
enum ScriptedOrder {
    Respond(OrderResponse),
    TransportError(String),
}

#[derive(Default)]
struct MockState {
    positions: HashMap<String, Vec<ExchangePosition>>,
    order_script: VecDeque<ScriptedOrder>,
    trading_stop_script: VecDeque<OrderResponse>,
    create_order_calls: u32,
    get_positions_calls: u32,
    set_trading_stop_calls: u32,
    cancel_all_calls: u32,
    next_order_seq: u32,
    order_latency: Option<Duration>,
    positions_unavailable: bool,
}

/// Scripted in-memory `ExchangeClient` implementation.
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Seed an active position the mock will report from `get_positions`.
    pub fn set_position(&self, symbol: &str, side: Side, size: f64, avg_price: f64) {
        let mut s = self.state.lock();
        s.positions.insert(
            symbol.to_string(),
            vec![ExchangePosition {
                symbol: symbol.to_string(),
                side: side.as_str().to_string(),
                size: size.to_string(),
                avg_price: avg_price.to_string(),
                unrealised_pnl: "0".to_string(),
                leverage: "1".to_string(),
                position_idx: None,
            }],
        );
    }

    /// Make the mock report no position for `symbol`.
    pub fn clear_position(&self, symbol: &str) {
        self.state.lock().positions.remove(symbol);
    }

    /// Queue an explicit response for the next `create_order` call.
    pub fn push_order_response(&self, response: OrderResponse) {
        self.state
            .lock()
            .order_script
            .push_back(ScriptedOrder::Respond(response));
    }

    /// Queue a transport-level failure for the next `create_order` call.
    pub fn push_transport_error(&self, message: &str) {
        self.state
            .lock()
            .order_script
            .push_back(ScriptedOrder::TransportError(message.to_string()));
    }

    /// Queue a response for the next `set_trading_stop` call.
    pub fn push_trading_stop_response(&self, response: OrderResponse) {
        self.state.lock().trading_stop_script.push_back(response);
    }

    /// Delay every `create_order` call by `latency` (for queue/timeout tests).
    pub fn set_order_latency(&self, latency: Duration) {
        self.state.lock().order_latency = Some(latency);
    }

    /// Make `get_positions` fail at the transport level.
    pub fn set_positions_unavailable(&self, unavailable: bool) {
        self.state.lock().positions_unavailable = unavailable;
    }

    // -------------------------------------------------------------------------
    // Call counters
    // -------------------------------------------------------------------------

    pub fn create_order_calls(&self) -> u32 {
        self.state.lock().create_order_calls
    }

    pub fn get_positions_calls(&self) -> u32 {
        self.state.lock().get_positions_calls
    }

    pub fn set_trading_stop_calls(&self) -> u32 {
        self.state.lock().set_trading_stop_calls
    }

    pub fn cancel_all_calls(&self) -> u32 {
        self.state.lock().cancel_all_calls
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_server_time(&self) -> Result<ServerTime> {
        Ok(ServerTime {
            time_second: "1700000000".to_string(),
            time_nano: "1700000000000000000".to_string(),
        })
    }

    async fn get_wallet_balance(&self) -> Result<WalletBalance> {
        Ok(WalletBalance {
            ret_code: 0,
            ret_msg: "OK".to_string(),
            ..Default::default()
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<PositionsResponse> {
        let mut s = self.state.lock();
        s.get_positions_calls += 1;

        if s.positions_unavailable {
            anyhow::bail!("mock: positions endpoint unavailable");
        }

        let list = match symbol {
            Some(sym) => s.positions.get(sym).cloned().unwrap_or_default(),
            None => s.positions.values().flatten().cloned().collect(),
        };

        Ok(PositionsResponse {
            ret_code: 0,
            ret_msg: "OK".to_string(),
            result: PositionsResult { list },
        })
    }

    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        _order_type: OrderType,
        qty: f64,
        _price: Option<f64>,
        _stop_loss: Option<f64>,
        _take_profit: Option<f64>,
        _reduce_only: bool,
        _position_idx: Option<u8>,
    ) -> Result<OrderResponse> {
        let (scripted, latency) = {
            let mut s = self.state.lock();
            s.create_order_calls += 1;
            s.next_order_seq += 1;
            let seq = s.next_order_seq;
            let scripted = match s.order_script.pop_front() {
                Some(ScriptedOrder::Respond(resp)) => Ok(resp),
                Some(ScriptedOrder::TransportError(msg)) => Err(msg),
                None => Ok(OrderResponse::success(
                    &format!("MOCK-{seq}"),
                    symbol,
                    side,
                    qty,
                )),
            };
            (scripted, s.order_latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match scripted {
            Ok(resp) => Ok(resp),
            Err(msg) => anyhow::bail!("mock transport error: {msg}"),
        }
    }

    async fn set_trading_stop(
        &self,
        _symbol: &str,
        _stop_loss: Option<f64>,
        _take_profit: Option<f64>,
        _sl_trigger_by: &str,
        _tp_trigger_by: &str,
    ) -> Result<OrderResponse> {
        let mut s = self.state.lock();
        s.set_trading_stop_calls += 1;
        Ok(s
            .trading_stop_script
            .pop_front()
            .unwrap_or_else(|| OrderResponse {
                ret_code: 0,
                ret_msg: "OK".to_string(),
                ..Default::default()
            }))
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> Result<OrderResponse> {
        let mut s = self.state.lock();
        s.cancel_all_calls += 1;
        Ok(OrderResponse {
            ret_code: 0,
            ret_msg: "OK".to_string(),
            ..Default::default()
        })
    }

    async fn get_open_orders(&self, _symbol: Option<&str>) -> Result<OpenOrdersResponse> {
        Ok(OpenOrdersResponse {
            ret_code: 0,
            ret_msg: "OK".to_string(),
            ..Default::default()
        })
    }

    async fn get_ohlcv(&self, _symbol: &str, _interval: &str, limit: u32) -> Result<Vec<Candle>> {
        // Flat synthetic series, good enough for orchestrator plumbing tests.
        let mut candles = Vec::with_capacity(limit as usize);
        for i in 0..limit {
            candles.push(Candle {
                timestamp: 1_700_000_000_000 + i as i64 * 60_000,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 10.0,
                turnover: 1000.0,
            });
        }
        Ok(candles)
    }
}

impl std::fmt::Debug for MockExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("MockExchange")
            .field("create_order_calls", &s.create_order_calls)
            .field("get_positions_calls", &s.get_positions_calls)
            .field("scripted_orders", &s.order_script.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
