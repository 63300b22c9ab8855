// =============================================================================
// BotRuntime — explicit service wiring for the process entry point
// =============================================================================
//
// No hidden globals: every service is constructed once, threaded through the
// orchestrator, and shared via `Arc`. `AccountState` is built first because
// both the rate limiter and the error handler mirror their emergency latches
// into it.
// =============================================================================

use std::sync::Arc;

use tracing::info;

use crate::account_state::AccountState;
use crate::config::BotConfig;
use crate::error_handler::ErrorHandler;
use crate::exchange::{BybitClient, ExchangeClient, HeartbeatMonitor};
use crate::notifier::Notifier;
use crate::order_manager::OrderManager;
use crate::rate_limiter::RateLimiter;

/// All long-lived services of the safety core.
pub struct BotRuntime {
    pub config: BotConfig,
    pub account: Arc<AccountState>,
    pub rate_limiter: Arc<RateLimiter>,
    pub error_handler: Arc<ErrorHandler>,
    pub order_manager: Arc<OrderManager>,
    pub client: Arc<dyn ExchangeClient>,
    pub notifier: Arc<Notifier>,
    pub heartbeat: Arc<HeartbeatMonitor>,
}

impl BotRuntime {
    /// Wire every service against the given exchange client. Must run inside
    /// a tokio runtime (the order manager spawns its workers).
    pub fn build(config: BotConfig, client: Arc<dyn ExchangeClient>) -> Self {
        let account = Arc::new(AccountState::new(config.account.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limiter.clone(),
            account.clone(),
        ));
        let error_handler = Arc::new(ErrorHandler::new(
            config.error_handler.clone(),
            account.clone(),
        ));
        let order_manager = OrderManager::new(config.order_manager.clone(), account.clone());
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            client.clone(),
            rate_limiter.clone(),
            config.heartbeat_interval_secs,
        ));

        info!(symbols = ?config.symbols, "runtime wired");

        Self {
            config,
            account,
            rate_limiter,
            error_handler,
            order_manager,
            client,
            notifier: Arc::new(Notifier::new()),
            heartbeat,
        }
    }

    /// Default runtime for the process entry point: a Bybit client built from
    /// environment credentials.
    pub fn default_runtime(config: BotConfig) -> Self {
        let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
        let client: Arc<dyn ExchangeClient> =
            Arc::new(BybitClient::new(api_key, api_secret, config.testnet));
        Self::build(config, client)
    }

    /// Start the background maintenance tasks (rate-limiter cleanup, pending
    /// cleanup, heartbeat probes).
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(self.rate_limiter.spawn_cleanup());
        handles.push(self.heartbeat.clone().spawn());

        let order_manager = self.order_manager.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let removed = order_manager.cleanup_expired_pending(60);
                if removed > 0 {
                    tracing::warn!(removed, "recovered orphaned pending orders");
                }
            }
        }));

        handles
    }
}

impl std::fmt::Debug for BotRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotRuntime")
            .field("symbols", &self.config.symbols)
            .field("account", &self.account)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;

    #[tokio::test]
    async fn build_wires_shared_account_state() {
        let client: Arc<dyn ExchangeClient> = Arc::new(MockExchange::new());
        let runtime = BotRuntime::build(BotConfig::default(), client);

        // The limiter's latch must be visible through the runtime's account.
        runtime.account.latch_emergency_stop("wiring test");
        assert!(runtime.account.emergency_stop());
        assert!(!runtime.account.trading_enabled());

        assert!(runtime.rate_limiter.deactivate_emergency_stop(true));
        assert!(runtime.account.trading_enabled());

        runtime
            .order_manager
            .shutdown(std::time::Duration::from_secs(1))
            .await;
    }

    #[tokio::test]
    async fn emergency_cascade_halts_then_readmits() {
        use crate::error_handler::ErrorContext;
        use crate::errors::{FailureKind, OrderError};
        use crate::order_manager::OrderRequest;
        use crate::types::Side;

        let mock = Arc::new(MockExchange::new());
        let client: Arc<dyn ExchangeClient> = mock.clone();
        let mut config = BotConfig::default();
        config.order_manager.min_symbol_interval_secs = 0.0;
        let runtime = BotRuntime::build(config, client.clone());

        // Five consecutive critical failures for one (strategy, operation)
        // open the circuit and latch the account-wide emergency stop.
        let ctx = ErrorContext::new("S1", "BTCUSDT", "create_order");
        for _ in 0..5 {
            let _ = runtime
                .error_handler
                .handle(FailureKind::EmergencyStop, "exchange misbehaving", &ctx)
                .await;
        }
        assert!(runtime.account.emergency_stop());
        assert!(!runtime.error_handler.circuit_allows("S1", "create_order"));

        // Submissions now short-circuit before any admission work.
        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let err = runtime
            .order_manager
            .submit(client.clone(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::EmergencyStop { .. }));
        assert_eq!(mock.create_order_calls(), 0);

        // Administrative deactivation re-admits order flow.
        assert!(runtime.rate_limiter.deactivate_emergency_stop(true));
        let request = OrderRequest::market("BTCUSDT", Side::Buy, 0.01, "S1");
        let response = runtime
            .order_manager
            .submit(client, request)
            .await
            .unwrap();
        assert!(response.is_success());

        runtime
            .order_manager
            .shutdown(std::time::Duration::from_secs(1))
            .await;
    }

    #[tokio::test]
    async fn background_tasks_start_and_stop() {
        let client: Arc<dyn ExchangeClient> = Arc::new(MockExchange::new());
        let runtime = BotRuntime::build(BotConfig::default(), client);

        let handles = runtime.spawn_background_tasks();
        assert_eq!(handles.len(), 3);
        for handle in handles {
            handle.abort();
        }
    }
}
