// =============================================================================
// Journal — append-only trade CSV, strategy signal logs, active strategies
// =============================================================================
//
// The trade journal is the only persisted trading record the core owns:
// one CSV row per closed trade, header written once on first use, timestamps
// in ISO-8601 UTC. Strategy signal logs are plain per-strategy text files
// under `logs/strategies/`.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::Side;

// ---------------------------------------------------------------------------
// Trade journal
// ---------------------------------------------------------------------------

/// One closed trade, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub strategy: String,
    pub comment: String,
}

impl TradeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        side: Side,
        qty: f64,
        entry_price: f64,
        exit_price: f64,
        pnl: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        strategy: &str,
        comment: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            qty,
            entry_price,
            exit_price,
            pnl,
            stop_loss,
            take_profit,
            strategy: strategy.to_string(),
            comment: comment.to_string(),
        }
    }
}

/// Append-only CSV journal. Serialized by a write lock; the header is written
/// exactly once, when the file does not yet exist.
pub struct TradeJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TradeJournal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let needs_header = !self.path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open journal {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);

        writer
            .serialize(record)
            .context("failed to serialise trade record")?;
        writer.flush().context("failed to flush trade journal")?;

        debug!(
            symbol = %record.symbol,
            pnl = record.pnl,
            strategy = %record.strategy,
            "trade journaled"
        );
        Ok(())
    }

    /// Read the journal back (reporting and tests).
    pub fn read_all(&self) -> Result<Vec<TradeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("failed to open journal {}", self.path.display()))?;

        let mut records = Vec::new();
        for row in reader.deserialize() {
            records.push(row.context("failed to parse trade record")?);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal").field("path", &self.path).finish()
    }
}

// ---------------------------------------------------------------------------
// Strategy signal log
// ---------------------------------------------------------------------------

/// Per-strategy signal log under `{dir}/{strategy}.log`, one formatted line
/// per signal.
pub struct StrategySignalLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StrategySignalLog {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// `YYYY-MM-DD HH:MM:SS - {strategy} - INFO - Signal: {BUY|SELL} at {price} - {comment}`
    pub fn log_signal(&self, strategy: &str, signal: &str, price: f64, comment: &str) -> Result<()> {
        use std::io::Write;

        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.dir.join(format!("{strategy}.log"));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open signal log {}", path.display()))?;

        writeln!(
            file,
            "{} - {} - INFO - Signal: {} at {} - {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            strategy,
            signal,
            price,
            comment
        )
        .context("failed to write signal log line")?;

        Ok(())
    }
}

impl std::fmt::Debug for StrategySignalLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategySignalLog").field("dir", &self.dir).finish()
    }
}

// ---------------------------------------------------------------------------
// Active strategies file
// ---------------------------------------------------------------------------

/// Newline-separated strategy identifiers.
pub fn load_active_strategies(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    Ok(content
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

pub fn save_active_strategies(path: impl AsRef<Path>, strategies: &[String]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut content = strategies.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;

    info!(count = strategies.len(), path = %path.display(), "active strategies saved");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
