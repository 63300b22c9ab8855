// =============================================================================
// Notifier — outbound event fan-out, failures never block trading
// =============================================================================
//
// Transports (Telegram, webhooks, ...) live outside the core; they plug in as
// `NotificationSink` implementations. A sink error is logged and swallowed.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::types::Side;

/// Events the core emits to the outside world.
#[derive(Debug, Clone, Serialize)]
pub enum NotificationEvent {
    PositionOpened {
        symbol: String,
        side: Side,
        strategy: String,
        entry_price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        size: f64,
        signal_strength: Option<f64>,
        comment: String,
    },
    PositionClosed {
        symbol: String,
        side: Side,
        strategy: String,
        exit_price: f64,
        pnl: f64,
        duration_secs: Option<i64>,
    },
    EmergencyStop {
        reason: String,
    },
}

/// One outbound transport.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Default sink: structured log lines only.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        match event {
            NotificationEvent::PositionOpened {
                symbol,
                side,
                strategy,
                entry_price,
                size,
                ..
            } => info!(
                symbol = %symbol,
                side = %side,
                strategy = %strategy,
                entry_price,
                size,
                "notification: position opened"
            ),
            NotificationEvent::PositionClosed {
                symbol,
                side,
                strategy,
                exit_price,
                pnl,
                duration_secs,
            } => info!(
                symbol = %symbol,
                side = %side,
                strategy = %strategy,
                exit_price,
                pnl,
                duration_secs = ?duration_secs,
                "notification: position closed"
            ),
            NotificationEvent::EmergencyStop { reason } => warn!(
                reason = %reason,
                "notification: EMERGENCY STOP"
            ),
        }
        Ok(())
    }
}

/// Fan-out dispatcher over the registered sinks.
pub struct Notifier {
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(vec![Arc::new(LogSink)]),
        }
    }

    pub fn without_sinks() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.write().push(sink);
    }

    /// Deliver `event` to every sink. Failures are logged and ignored.
    pub async fn dispatch(&self, event: &NotificationEvent) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            if let Err(e) = sink.notify(event).await {
                warn!(sink = sink.name(), error = %e, "notification sink failed");
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("sinks", &self.sinks.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSink {
        delivered: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn notify(&self, _event: &NotificationEvent) -> Result<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("transport down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_other_sinks() {
        let notifier = Notifier::without_sinks();
        let failing = Arc::new(CountingSink {
            delivered: AtomicU32::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingSink {
            delivered: AtomicU32::new(0),
            fail: false,
        });
        notifier.add_sink(failing.clone());
        notifier.add_sink(healthy.clone());

        notifier
            .dispatch(&NotificationEvent::EmergencyStop {
                reason: "test".into(),
            })
            .await;

        assert_eq!(failing.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_delivers_every_event_kind() {
        let notifier = Notifier::without_sinks();
        let sink = Arc::new(CountingSink {
            delivered: AtomicU32::new(0),
            fail: false,
        });
        notifier.add_sink(sink.clone());

        notifier
            .dispatch(&NotificationEvent::PositionOpened {
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                strategy: "S1".into(),
                entry_price: 30000.0,
                stop_loss: Some(29500.0),
                take_profit: Some(31000.0),
                size: 0.01,
                signal_strength: Some(0.8),
                comment: "entry".into(),
            })
            .await;
        notifier
            .dispatch(&NotificationEvent::PositionClosed {
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                strategy: "S1".into(),
                exit_price: 31000.0,
                pnl: 10.0,
                duration_secs: Some(3600),
            })
            .await;

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);
    }
}
