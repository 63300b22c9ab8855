// =============================================================================
// Bybit v5 REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-BAPI-API-KEY / X-BAPI-TIMESTAMP / X-BAPI-RECV-WINDOW / X-BAPI-SIGN
// headers with a recvWindow of 5 000 ms to tolerate minor clock drift.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use crate::exchange::ExchangeClient;
use crate::types::{
    parse_wire_f64, Candle, OpenOrdersResponse, OrderResponse, OrderType, PositionsResponse,
    ServerTime, Side, WalletBalance,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Bybit v5 REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BybitClient`.
    ///
    /// # Arguments
    /// * `api_key` — Bybit API key (sent as a header, never in query params).
    /// * `secret`  — Bybit secret key used exclusively for HMAC signing.
    /// * `testnet` — route requests to the testnet host.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url, "BybitClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Produce the v5 HMAC signature over `timestamp + api_key + recv_window
    /// + payload` (query string for GET, JSON body for POST).
    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let material = format!("{}{}{}{}", timestamp, self.api_key, RECV_WINDOW, payload);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(material.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signed GET returning the raw JSON envelope.
    async fn signed_get(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let sig = self.sign(ts, query);

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Bybit GET {} returned {}: {}", path, status, body);
        }

        Ok(body)
    }

    /// Signed POST with a JSON body returning the raw envelope.
    async fn signed_post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let payload = body.to_string();
        let sig = self.sign(ts, &payload);

        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("Bybit POST {} returned {}: {}", path, status, body);
        }

        Ok(body)
    }

    /// Format a float for the wire without trailing noise.
    fn wire_num(value: f64) -> String {
        format!("{value}")
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    #[instrument(skip(self), name = "bybit::get_server_time")]
    async fn get_server_time(&self) -> Result<ServerTime> {
        let body = self.signed_get("/v5/market/time", "").await?;
        let result = body.get("result").cloned().unwrap_or_default();
        let time: ServerTime =
            serde_json::from_value(result).context("failed to parse server time result")?;
        debug!(time_second = %time.time_second, "server time retrieved");
        Ok(time)
    }

    #[instrument(skip(self), name = "bybit::get_wallet_balance")]
    async fn get_wallet_balance(&self) -> Result<WalletBalance> {
        let body = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let balance: WalletBalance =
            serde_json::from_value(body).context("failed to parse wallet balance response")?;
        debug!(accounts = balance.result.list.len(), "wallet balance retrieved");
        Ok(balance)
    }

    #[instrument(skip(self), name = "bybit::get_positions")]
    async fn get_positions(&self, symbol: Option<&str>) -> Result<PositionsResponse> {
        let query = match symbol {
            Some(s) => format!("category=linear&symbol={s}"),
            None => "category=linear&settleCoin=USDT".to_string(),
        };
        let body = self.signed_get("/v5/position/list", &query).await?;
        let positions: PositionsResponse =
            serde_json::from_value(body).context("failed to parse positions response")?;
        debug!(count = positions.result.list.len(), "positions retrieved");
        Ok(positions)
    }

    #[instrument(
        skip(self, price, stop_loss, take_profit, position_idx),
        name = "bybit::create_order"
    )]
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
    ) -> Result<OrderResponse> {
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side.as_str(),
            "orderType": order_type.as_str(),
            "qty": Self::wire_num(qty),
            "reduceOnly": reduce_only,
        });

        if let Some(p) = price {
            body["price"] = serde_json::Value::String(Self::wire_num(p));
        }
        if let Some(sl) = stop_loss {
            body["stopLoss"] = serde_json::Value::String(Self::wire_num(sl));
        }
        if let Some(tp) = take_profit {
            body["takeProfit"] = serde_json::Value::String(Self::wire_num(tp));
        }
        if let Some(idx) = position_idx {
            body["positionIdx"] = serde_json::Value::from(idx);
        }

        debug!(symbol, side = %side, order_type = %order_type, qty, "placing order");

        let raw = self.signed_post("/v5/order/create", &body).await?;
        let response: OrderResponse =
            serde_json::from_value(raw).context("failed to parse order response")?;

        debug!(
            symbol,
            ret_code = response.ret_code,
            order_id = %response.result.order_id,
            "order response received"
        );
        Ok(response)
    }

    #[instrument(skip(self, stop_loss, take_profit), name = "bybit::set_trading_stop")]
    async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        sl_trigger_by: &str,
        tp_trigger_by: &str,
    ) -> Result<OrderResponse> {
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "slTriggerBy": sl_trigger_by,
            "tpTriggerBy": tp_trigger_by,
        });

        if let Some(sl) = stop_loss {
            body["stopLoss"] = serde_json::Value::String(Self::wire_num(sl));
        }
        if let Some(tp) = take_profit {
            body["takeProfit"] = serde_json::Value::String(Self::wire_num(tp));
        }

        let raw = self.signed_post("/v5/position/trading-stop", &body).await?;
        let response: OrderResponse =
            serde_json::from_value(raw).context("failed to parse trading-stop response")?;

        debug!(symbol, ret_code = response.ret_code, "trading stop response received");
        Ok(response)
    }

    #[instrument(skip(self), name = "bybit::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<OrderResponse> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
        });

        let raw = self.signed_post("/v5/order/cancel-all", &body).await?;
        let response: OrderResponse =
            serde_json::from_value(raw).context("failed to parse cancel-all response")?;

        debug!(symbol, ret_code = response.ret_code, "cancel-all response received");
        Ok(response)
    }

    #[instrument(skip(self), name = "bybit::get_open_orders")]
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<OpenOrdersResponse> {
        let query = match symbol {
            Some(s) => format!("category=linear&symbol={s}"),
            None => "category=linear&settleCoin=USDT".to_string(),
        };
        let body = self.signed_get("/v5/order/realtime", &query).await?;
        let orders: OpenOrdersResponse =
            serde_json::from_value(body).context("failed to parse open orders response")?;
        debug!(count = orders.result.list.len(), "open orders retrieved");
        Ok(orders)
    }

    /// GET /v5/market/kline (public).
    ///
    /// Rows arrive as arrays of strings:
    ///   [0] startTime, [1] open, [2] high, [3] low, [4] close,
    ///   [5] volume, [6] turnover
    #[instrument(skip(self), name = "bybit::get_ohlcv")]
    async fn get_ohlcv(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let query = format!("category=linear&symbol={symbol}&interval={interval}&limit={limit}");
        let body = self.signed_get("/v5/market/kline", &query).await?;

        let rows = body
            .get("result")
            .and_then(|r| r.get("list"))
            .and_then(|l| l.as_array())
            .context("kline response missing result.list")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = row.as_array().context("kline row is not an array")?;
            if arr.len() < 7 {
                debug!(len = arr.len(), "skipping malformed kline row");
                continue;
            }

            let field = |i: usize| -> f64 {
                arr[i]
                    .as_str()
                    .map(parse_wire_f64)
                    .or_else(|| arr[i].as_f64())
                    .unwrap_or(0.0)
            };

            candles.push(Candle {
                timestamp: arr[0]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| arr[0].as_i64())
                    .unwrap_or(0),
                open: field(1),
                high: field(2),
                low: field(3),
                close: field(4),
                volume: field(5),
                turnover: field(6),
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let client = BybitClient::new("key", "secret", true);
        let a = client.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        let b = client.sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64, "HMAC-SHA256 hex digest length");
    }

    #[test]
    fn signature_changes_with_payload() {
        let client = BybitClient::new("key", "secret", true);
        let a = client.sign(1_700_000_000_000, "symbol=BTCUSDT");
        let b = client.sign(1_700_000_000_000, "symbol=ETHUSDT");
        assert_ne!(a, b);
    }

    #[test]
    fn debug_never_exposes_secrets() {
        let client = BybitClient::new("very-secret-key-material", "even-more-secret", false);
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("very-secret-key-material"));
        assert!(!rendered.contains("even-more-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn testnet_switch_selects_host() {
        let live = BybitClient::new("k", "s", false);
        let test = BybitClient::new("k", "s", true);
        assert_eq!(live.base_url, MAINNET_URL);
        assert_eq!(test.base_url, TESTNET_URL);
    }
}
