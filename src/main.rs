// =============================================================================
// Bastion — Perpetual-Futures Trading Bot Safety Core
// =============================================================================
//
// The process starts with trading gated off until the config says otherwise,
// wires every service explicitly through `BotRuntime`, and shuts down
// gracefully on Ctrl+C (drain workers, persist config).
//
// `bastion-bot --security-scan` runs the source-tree leak scanner instead of
// the trading loop and exits non-zero on critical findings.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account_state;
mod config;
mod error_handler;
mod errors;
mod exchange;
mod journal;
mod notifier;
mod order_manager;
mod orchestrator;
mod rate_limiter;
mod runtime;
mod security;
mod types;

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;
use crate::journal::load_active_strategies;
use crate::orchestrator::Orchestrator;
use crate::runtime::BotRuntime;
use crate::security::SecurityScanner;

const CONFIG_PATH: &str = "bastion_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── 2. Security-scan mode ────────────────────────────────────────────
    if std::env::args().any(|arg| arg == "--security-scan") {
        let scanner = SecurityScanner::new(".");
        let report = scanner.scan();
        scanner.save_report(&report, "data/security_reports")?;
        if !report.is_clean() {
            error!(
                critical = report.critical_leaks,
                "critical leaks found — fix before deploying"
            );
            std::process::exit(1);
        }
        info!("no critical leaks found");
        return Ok(());
    }

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Bastion Safety Core — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 3. Configuration ─────────────────────────────────────────────────
    let mut config = BotConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        BotConfig::default()
    });

    if let Ok(syms) = std::env::var("BASTION_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSDT".to_string()];
    }

    info!(symbols = ?config.symbols, testnet = config.testnet, "configured");

    // ── 4. Runtime wiring ────────────────────────────────────────────────
    let runtime = BotRuntime::default_runtime(config);
    let background = runtime.spawn_background_tasks();

    // ── 5. Orchestrator ──────────────────────────────────────────────────
    let orchestrator = Orchestrator::new(
        &runtime.config,
        runtime.account.clone(),
        runtime.rate_limiter.clone(),
        runtime.error_handler.clone(),
        runtime.order_manager.clone(),
        runtime.client.clone(),
        runtime.notifier.clone(),
    );

    match load_active_strategies(&runtime.config.active_strategies_path) {
        Ok(names) if !names.is_empty() => {
            // Strategy implementations plug in from outside the core; the
            // file only declares which identifiers are expected to run.
            info!(strategies = ?names, "active strategy identifiers loaded");
        }
        Ok(_) => info!("no active strategies declared"),
        Err(e) => warn!(error = %e, "could not read active strategies file"),
    }

    let orchestrator_handle = tokio::spawn(async move {
        orchestrator.run().await;
    });

    info!("all subsystems running — Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    orchestrator_handle.abort();
    for handle in background {
        handle.abort();
    }
    runtime.order_manager.shutdown(Duration::from_secs(5)).await;

    if let Err(e) = runtime.config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Bastion safety core shut down complete");
    Ok(())
}
