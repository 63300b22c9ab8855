// =============================================================================
// Shared types used across the Bastion safety core
// =============================================================================
//
// Wire-level conventions (Bybit v5): sides cross the boundary as "Buy"/"Sell",
// quantities and prices as strings. `ret_code == 0` means success; everything
// else carries a human-readable `ret_msg`.
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Wire representation expected by the exchange.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "Buy",
            Self::Sell => "Sell",
        }
    }

    /// The side that closes a position opened with `self`.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Parse the exchange's "Buy"/"Sell" strings (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "long" => Some(Self::Buy),
            "sell" | "short" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution type of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "Market",
            Self::Limit => "Limit",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a tracked position. `Flat` means no exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl PositionSide {
    /// Map an order side onto the position it opens.
    pub fn from_order_side(side: Side) -> Self {
        match side {
            Side::Buy => Self::Long,
            Side::Sell => Self::Short,
        }
    }

    /// The order side that increases a position in this direction.
    pub fn entry_order_side(&self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Buy),
            Self::Short => Some(Side::Sell),
            Self::Flat => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "Long"),
            Self::Short => write!(f, "Short"),
            Self::Flat => write!(f, "Flat"),
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange wire types
// ---------------------------------------------------------------------------

/// Parse a wire value that arrives as a string ("0.01") into `f64`, tolerating
/// an empty field.
pub fn parse_wire_f64(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    s.parse().unwrap_or(0.0)
}

/// Server time response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTime {
    #[serde(rename = "timeSecond", default)]
    pub time_second: String,
    #[serde(rename = "timeNano", default)]
    pub time_nano: String,
}

/// A single coin entry inside a wallet balance record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoinBalance {
    #[serde(default)]
    pub coin: String,
    #[serde(rename = "walletBalance", default)]
    pub wallet_balance: String,
    #[serde(rename = "usdValue", default)]
    pub usd_value: String,
}

/// One account entry in the wallet balance list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletAccount {
    #[serde(default)]
    pub coin: Vec<CoinBalance>,
    #[serde(rename = "totalEquity", default)]
    pub total_equity: String,
    #[serde(rename = "totalAvailableBalance", default)]
    pub total_available_balance: String,
}

/// Envelope of `get_wallet_balance`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletBalance {
    #[serde(rename = "retCode", default)]
    pub ret_code: i32,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: WalletBalanceResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletBalanceResult {
    #[serde(default)]
    pub list: Vec<WalletAccount>,
}

/// A position record as reported by the exchange. Numeric fields are strings
/// on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangePosition {
    #[serde(default)]
    pub symbol: String,
    /// "Buy", "Sell", or "" when flat.
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
    #[serde(rename = "unrealisedPnl", default)]
    pub unrealised_pnl: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(rename = "positionIdx", default)]
    pub position_idx: Option<u8>,
}

impl ExchangePosition {
    pub fn size_f64(&self) -> f64 {
        parse_wire_f64(&self.size)
    }

    pub fn avg_price_f64(&self) -> f64 {
        parse_wire_f64(&self.avg_price)
    }

    pub fn unrealised_pnl_f64(&self) -> f64 {
        parse_wire_f64(&self.unrealised_pnl)
    }

    pub fn leverage_f64(&self) -> f64 {
        let lev = parse_wire_f64(&self.leverage);
        if lev > 0.0 {
            lev
        } else {
            1.0
        }
    }

    pub fn is_active(&self) -> bool {
        self.size_f64() > 0.0
    }
}

/// Envelope of `get_positions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionsResponse {
    #[serde(rename = "retCode", default)]
    pub ret_code: i32,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: PositionsResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionsResult {
    #[serde(default)]
    pub list: Vec<ExchangePosition>,
}

impl PositionsResponse {
    /// The first active (size > 0) position in the list, if any.
    pub fn active_position(&self) -> Option<&ExchangePosition> {
        self.result.list.iter().find(|p| p.is_active())
    }
}

/// Result block of a successful order creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderResult {
    #[serde(rename = "orderId", default)]
    pub order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub qty: String,
    #[serde(rename = "orderStatus", default)]
    pub status: String,
}

/// Envelope of `create_order` / `set_trading_stop` / `cancel_all_orders`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "retCode", default)]
    pub ret_code: i32,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: OrderResult,
}

impl OrderResponse {
    pub fn is_success(&self) -> bool {
        self.ret_code == 0
    }

    /// Build a success envelope (used by the mock exchange and tests).
    pub fn success(order_id: &str, symbol: &str, side: Side, qty: f64) -> Self {
        Self {
            ret_code: 0,
            ret_msg: "OK".to_string(),
            result: OrderResult {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
                side: side.as_str().to_string(),
                qty: qty.to_string(),
                status: "New".to_string(),
            },
        }
    }

    /// Build a failure envelope with the given exchange code.
    pub fn failure(ret_code: i32, ret_msg: &str) -> Self {
        Self {
            ret_code,
            ret_msg: ret_msg.to_string(),
            result: OrderResult::default(),
        }
    }
}

/// Envelope of `get_open_orders`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenOrdersResponse {
    #[serde(rename = "retCode", default)]
    pub ret_code: i32,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: OpenOrdersResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenOrdersResult {
    #[serde(default)]
    pub list: Vec<OrderResult>,
}

/// A single OHLCV row: `[timestamp, open, high, low, close, volume, turnover]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_roundtrip_and_opposite() {
        assert_eq!(Side::parse("Buy"), Some(Side::Buy));
        assert_eq!(Side::parse("sell"), Some(Side::Sell));
        assert_eq!(Side::parse("LONG"), Some(Side::Buy));
        assert_eq!(Side::parse("flat"), None);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.as_str(), "Buy");
    }

    #[test]
    fn position_side_mapping() {
        assert_eq!(PositionSide::from_order_side(Side::Buy), PositionSide::Long);
        assert_eq!(PositionSide::from_order_side(Side::Sell), PositionSide::Short);
        assert_eq!(PositionSide::Long.entry_order_side(), Some(Side::Buy));
        assert_eq!(PositionSide::Flat.entry_order_side(), None);
    }

    #[test]
    fn wire_f64_parsing_tolerates_garbage() {
        assert_eq!(parse_wire_f64("0.01"), 0.01);
        assert_eq!(parse_wire_f64(""), 0.0);
        assert_eq!(parse_wire_f64("not-a-number"), 0.0);
    }

    #[test]
    fn exchange_position_accessors() {
        let pos = ExchangePosition {
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            size: "0.02".into(),
            avg_price: "30000.5".into(),
            unrealised_pnl: "-1.25".into(),
            leverage: "".into(),
            position_idx: None,
        };
        assert!(pos.is_active());
        assert_eq!(pos.size_f64(), 0.02);
        assert_eq!(pos.avg_price_f64(), 30000.5);
        assert_eq!(pos.unrealised_pnl_f64(), -1.25);
        assert_eq!(pos.leverage_f64(), 1.0);
    }

    #[test]
    fn positions_response_finds_active() {
        let resp = PositionsResponse {
            ret_code: 0,
            ret_msg: "OK".into(),
            result: PositionsResult {
                list: vec![
                    ExchangePosition {
                        symbol: "BTCUSDT".into(),
                        size: "0".into(),
                        ..Default::default()
                    },
                    ExchangePosition {
                        symbol: "BTCUSDT".into(),
                        side: "Sell".into(),
                        size: "0.05".into(),
                        ..Default::default()
                    },
                ],
            },
        };
        let active = resp.active_position().expect("one active position");
        assert_eq!(active.side, "Sell");
    }

    #[test]
    fn order_response_envelopes() {
        let ok = OrderResponse::success("X1", "BTCUSDT", Side::Buy, 0.01);
        assert!(ok.is_success());
        assert_eq!(ok.result.order_id, "X1");

        let err = OrderResponse::failure(-1001, "too many visits");
        assert!(!err.is_success());
        assert_eq!(err.ret_code, -1001);
    }

    #[test]
    fn positions_response_parses_bybit_payload() {
        let raw = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "list": [
                    {"symbol": "BTCUSDT", "side": "Buy", "size": "0.01",
                     "avgPrice": "42000", "unrealisedPnl": "0.5", "leverage": "10"}
                ]
            }
        }"#;
        let resp: PositionsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.ret_code, 0);
        let pos = resp.active_position().unwrap();
        assert_eq!(pos.avg_price_f64(), 42000.0);
        assert_eq!(pos.leverage_f64(), 10.0);
    }
}
