// =============================================================================
// Exchange abstraction — the capability surface the safety core consumes
// =============================================================================
//
// The core talks to exactly this operation set and nothing else. `BybitClient`
// is the production implementation; `MockExchange` is the deterministic test
// double. Both are assumed internally thread-safe (shared behind `Arc`).
// =============================================================================

pub mod bybit;
pub mod heartbeat;
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    Candle, OpenOrdersResponse, OrderResponse, OrderType, PositionsResponse, ServerTime, Side,
    WalletBalance,
};

pub use bybit::BybitClient;
pub use heartbeat::{ConnectionHealth, HeartbeatMonitor};
pub use mock::MockExchange;

/// Capability interface over the exchange REST surface.
///
/// Transport failures surface as `Err`; exchange-level rejections come back
/// as a successful response carrying a non-zero `ret_code`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_server_time(&self) -> Result<ServerTime>;

    async fn get_wallet_balance(&self) -> Result<WalletBalance>;

    async fn get_positions(&self, symbol: Option<&str>) -> Result<PositionsResponse>;

    /// Submit an order. Quantities and prices are stringified at the wire.
    #[allow(clippy::too_many_arguments)]
    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        qty: f64,
        price: Option<f64>,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        reduce_only: bool,
        position_idx: Option<u8>,
    ) -> Result<OrderResponse>;

    async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        sl_trigger_by: &str,
        tp_trigger_by: &str,
    ) -> Result<OrderResponse>;

    async fn cancel_all_orders(&self, symbol: &str) -> Result<OrderResponse>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<OpenOrdersResponse>;

    async fn get_ohlcv(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;
}
