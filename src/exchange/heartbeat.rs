// =============================================================================
// Heartbeat Monitor — exchange connection health from periodic probes
// =============================================================================
//
// Probes `get_server_time` on a fixed interval and classifies the connection
// from the failure streak. Every probe outcome is fed into the rate limiter's
// adaptive-delay hooks, so preflight hints tighten while the API is shaky and
// relax again once it recovers.
//
//   0 failures      -> Healthy
//   1–2 failures    -> Degraded
//   3+  failures    -> Unstable
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::exchange::ExchangeClient;
use crate::rate_limiter::RateLimiter;

/// Probe endpoint label used for adaptive-delay bookkeeping.
const PROBE_ENDPOINT: &str = "server_time";

/// Failure streak at which the connection is considered unstable.
const UNSTABLE_THRESHOLD: u32 = 3;

/// Classified health of the exchange connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionHealth {
    Healthy,
    Degraded,
    Unstable,
}

impl std::fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Unstable => write!(f, "Unstable"),
        }
    }
}

/// Serialisable snapshot of the monitor state.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatSnapshot {
    pub health: ConnectionHealth,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_probe_at: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_probe_at: Option<String>,
    last_error: Option<String>,
}

/// Periodic exchange-health prober.
pub struct HeartbeatMonitor {
    client: Arc<dyn ExchangeClient>,
    rate_limiter: Arc<RateLimiter>,
    interval: Duration,
    inner: RwLock<Inner>,
}

impl HeartbeatMonitor {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        rate_limiter: Arc<RateLimiter>,
        interval_secs: u64,
    ) -> Self {
        Self {
            client,
            rate_limiter,
            interval: Duration::from_secs(interval_secs.max(1)),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Current health classification.
    pub fn health(&self) -> ConnectionHealth {
        Self::classify(self.inner.read().consecutive_failures)
    }

    fn classify(failures: u32) -> ConnectionHealth {
        match failures {
            0 => ConnectionHealth::Healthy,
            f if f < UNSTABLE_THRESHOLD => ConnectionHealth::Degraded,
            _ => ConnectionHealth::Unstable,
        }
    }

    pub fn snapshot(&self) -> HeartbeatSnapshot {
        let inner = self.inner.read();
        HeartbeatSnapshot {
            health: Self::classify(inner.consecutive_failures),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_probe_at: inner.last_probe_at.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    /// Run a single probe and update health state.
    pub async fn probe_once(&self) -> ConnectionHealth {
        let result = self.client.get_server_time().await;
        let now = Utc::now().to_rfc3339();

        let (before, after) = {
            let mut inner = self.inner.write();
            let before = Self::classify(inner.consecutive_failures);
            inner.last_probe_at = Some(now);

            match &result {
                Ok(time) => {
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes += 1;
                    inner.last_error = None;
                    debug!(time_second = %time.time_second, "heartbeat probe ok");
                }
                Err(e) => {
                    inner.consecutive_successes = 0;
                    inner.consecutive_failures += 1;
                    inner.last_error = Some(e.to_string());
                }
            }

            (before, Self::classify(inner.consecutive_failures))
        };

        match result {
            Ok(_) => self.rate_limiter.record_api_success(PROBE_ENDPOINT),
            Err(ref e) => {
                warn!(error = %e, "heartbeat probe failed");
                self.rate_limiter.record_api_failure(PROBE_ENDPOINT);
            }
        }

        if before != after {
            info!(from = %before, to = %after, "exchange connection health changed");
        }

        after
    }

    /// Spawn the probe loop as a background task.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.probe_once().await;
            }
        })
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("HeartbeatMonitor")
            .field("health", &Self::classify(inner.consecutive_failures))
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account_state::AccountState;
    use crate::config::{AccountStateConfig, RateLimiterConfig};
    use crate::exchange::MockExchange;
    use crate::types::ServerTime;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Mock whose server-time probe can be switched to failing.
    struct FlakyClock {
        failing: AtomicBool,
        inner: MockExchange,
    }

    #[async_trait]
    impl ExchangeClient for FlakyClock {
        async fn get_server_time(&self) -> Result<ServerTime> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("probe refused");
            }
            self.inner.get_server_time().await
        }

        async fn get_wallet_balance(&self) -> Result<crate::types::WalletBalance> {
            self.inner.get_wallet_balance().await
        }

        async fn get_positions(
            &self,
            symbol: Option<&str>,
        ) -> Result<crate::types::PositionsResponse> {
            self.inner.get_positions(symbol).await
        }

        async fn create_order(
            &self,
            symbol: &str,
            side: crate::types::Side,
            order_type: crate::types::OrderType,
            qty: f64,
            price: Option<f64>,
            stop_loss: Option<f64>,
            take_profit: Option<f64>,
            reduce_only: bool,
            position_idx: Option<u8>,
        ) -> Result<crate::types::OrderResponse> {
            self.inner
                .create_order(
                    symbol,
                    side,
                    order_type,
                    qty,
                    price,
                    stop_loss,
                    take_profit,
                    reduce_only,
                    position_idx,
                )
                .await
        }

        async fn set_trading_stop(
            &self,
            symbol: &str,
            stop_loss: Option<f64>,
            take_profit: Option<f64>,
            sl_trigger_by: &str,
            tp_trigger_by: &str,
        ) -> Result<crate::types::OrderResponse> {
            self.inner
                .set_trading_stop(symbol, stop_loss, take_profit, sl_trigger_by, tp_trigger_by)
                .await
        }

        async fn cancel_all_orders(&self, symbol: &str) -> Result<crate::types::OrderResponse> {
            self.inner.cancel_all_orders(symbol).await
        }

        async fn get_open_orders(
            &self,
            symbol: Option<&str>,
        ) -> Result<crate::types::OpenOrdersResponse> {
            self.inner.get_open_orders(symbol).await
        }

        async fn get_ohlcv(
            &self,
            symbol: &str,
            interval: &str,
            limit: u32,
        ) -> Result<Vec<crate::types::Candle>> {
            self.inner.get_ohlcv(symbol, interval, limit).await
        }
    }

    fn limiter() -> Arc<RateLimiter> {
        let account = Arc::new(AccountState::new(AccountStateConfig::default()));
        Arc::new(RateLimiter::new(RateLimiterConfig::default(), account))
    }

    #[tokio::test]
    async fn health_transitions_on_failure_streaks() {
        let client = Arc::new(FlakyClock {
            failing: AtomicBool::new(false),
            inner: MockExchange::new(),
        });
        let monitor = HeartbeatMonitor::new(client.clone(), limiter(), 30);

        assert_eq!(monitor.probe_once().await, ConnectionHealth::Healthy);

        client.failing.store(true, Ordering::SeqCst);
        assert_eq!(monitor.probe_once().await, ConnectionHealth::Degraded);
        assert_eq!(monitor.probe_once().await, ConnectionHealth::Degraded);
        assert_eq!(monitor.probe_once().await, ConnectionHealth::Unstable);

        client.failing.store(false, Ordering::SeqCst);
        assert_eq!(monitor.probe_once().await, ConnectionHealth::Healthy);

        let snap = monitor.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.last_probe_at.is_some());
        assert!(snap.last_error.is_none());
    }
}
