// =============================================================================
// Secure Logger — no credential ever reaches a log sink
// =============================================================================
//
// Every message is rewritten before it is handed to `tracing`: values
// matching credential / signature / token / private-key patterns become
// `[MASKED:xx****yy]`, and map values under credential-named keys are masked
// structurally. Each blocked leak is counted and mirrored to a dedicated
// audit log that records WHERE the leak came from and a hash of the raw
// message — never the payload itself.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::order_manager::OrderRequest;
use crate::types::OrderResponse;

/// Map keys whose values are masked structurally.
const SENSITIVE_KEYWORDS: [&str; 11] = [
    "api_key",
    "api_secret",
    "secret",
    "password",
    "token",
    "key",
    "signature",
    "sign",
    "auth",
    "credential",
    "private",
];

// ---------------------------------------------------------------------------
// SecurityFilter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FilterStats {
    blocked_leaks: u64,
    leak_types: HashMap<String, u64>,
}

/// Serialisable redaction statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    pub blocked_leaks_total: u64,
    pub leak_types: HashMap<String, u64>,
    pub filter_active: bool,
}

/// The pattern engine shared by every `SecureLogger`.
pub struct SecurityFilter {
    patterns: Vec<Regex>,
    stats: Mutex<FilterStats>,
}

impl SecurityFilter {
    pub fn new() -> Self {
        let sources = [
            // Credential assignments (20+ alphanumeric value).
            r#"(?i)["']?api[_-]?key["']?\s*[:=]\s*["']?([a-zA-Z0-9]{20,})["']?"#,
            r#"(?i)["']?api[_-]?secret["']?\s*[:=]\s*["']?([a-zA-Z0-9]{20,})["']?"#,
            r#"(?i)["']?secret["']?\s*[:=]\s*["']?([a-zA-Z0-9]{20,})["']?"#,
            // Exchange-specific environment names.
            r#"(?i)BYBIT_API_KEY\s*[:=]\s*["']?([a-zA-Z0-9]{20,})["']?"#,
            r#"(?i)BYBIT_API_SECRET\s*[:=]\s*["']?([a-zA-Z0-9]{20,})["']?"#,
            // Telegram bot tokens, bare and assigned.
            r"[0-9]{8,10}:[a-zA-Z0-9_-]{35}",
            r#"(?i)TELEGRAM_TOKEN\s*[:=]\s*["']?([0-9]{8,10}:[a-zA-Z0-9_-]{35})["']?"#,
            // Request signatures (64 hex chars).
            r#"(?i)["']?sign["']?\s*[:=]\s*["']?([a-fA-F0-9]{64})["']?"#,
            r#"(?i)signature\s*[:=]\s*["']?([a-fA-F0-9]{64})["']?"#,
            // Passwords.
            r#"(?i)["']?password["']?\s*[:=]\s*["']?([^\s"']{8,})["']?"#,
            // JWTs.
            r"eyJ[a-zA-Z0-9_-]*\.eyJ[a-zA-Z0-9_-]*\.[a-zA-Z0-9_-]*",
            // Private key blocks.
            r"(?s)-----BEGIN (?:RSA )?PRIVATE KEY-----.*?-----END (?:RSA )?PRIVATE KEY-----",
        ];

        let patterns = sources
            .iter()
            .map(|src| Regex::new(src).expect("security filter pattern is valid"))
            .collect();

        Self {
            patterns,
            stats: Mutex::new(FilterStats::default()),
        }
    }

    /// Redact every sensitive value in `text`. Returns the filtered text and
    /// whether anything was blocked.
    pub fn redact(&self, text: &str) -> (String, bool) {
        let mut filtered = text.to_string();
        let mut leak_found = false;

        for pattern in &self.patterns {
            loop {
                let secret = {
                    match pattern.captures(&filtered) {
                        None => break,
                        Some(caps) => {
                            let m = caps.get(1).unwrap_or_else(|| {
                                caps.get(0).expect("match group 0 always exists")
                            });
                            m.as_str().to_string()
                        }
                    }
                };

                // A previously masked value can re-match (e.g. nested
                // patterns); never loop on our own replacement.
                if secret.contains("[MASKED:") {
                    break;
                }

                leak_found = true;
                let masked = format!("[MASKED:{}]", Self::mask_value(&secret));
                filtered = filtered.replace(&secret, &masked);

                let leak_type = Self::identify_leak_type(&secret);
                let mut stats = self.stats.lock();
                *stats.leak_types.entry(leak_type.to_string()).or_insert(0) += 1;
            }
        }

        if leak_found {
            self.stats.lock().blocked_leaks += 1;
        }

        (filtered, leak_found)
    }

    /// Structurally mask a JSON value: sensitive keys get masked scalars,
    /// containers recurse, strings run through the pattern engine.
    pub fn redact_value(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, val) in map {
                    let key_lower = key.to_lowercase();
                    let sensitive = SENSITIVE_KEYWORDS.iter().any(|kw| key_lower.contains(kw));

                    let replaced = if sensitive && (val.is_string() || val.is_number()) {
                        let raw = match val {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        serde_json::Value::String(Self::mask_value(&raw))
                    } else {
                        self.redact_value(val)
                    };
                    out.insert(key.clone(), replaced);
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            serde_json::Value::String(s) => {
                let (filtered, _) = self.redact(s);
                serde_json::Value::String(filtered)
            }
            other => other.clone(),
        }
    }

    /// `xx****yy` masking: keep two characters at each end of long values.
    fn mask_value(secret: &str) -> String {
        let chars: Vec<char> = secret.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..2].iter().collect();
            let tail: String = chars[chars.len() - 2..].iter().collect();
            format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
        } else {
            "*".repeat(chars.len())
        }
    }

    fn identify_leak_type(secret: &str) -> &'static str {
        if secret.len() == 64 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
            "signature"
        } else if secret.contains(':') && secret.len() > 40 {
            "telegram_token"
        } else if secret.starts_with("eyJ") {
            "jwt"
        } else if secret.contains("PRIVATE KEY") {
            "private_key"
        } else if secret.len() > 30 {
            "api_key_or_secret"
        } else {
            "generic"
        }
    }

    pub fn stats(&self) -> SecurityStats {
        let stats = self.stats.lock();
        SecurityStats {
            blocked_leaks_total: stats.blocked_leaks,
            leak_types: stats.leak_types.clone(),
            filter_active: true,
        }
    }
}

impl Default for SecurityFilter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Append-only record of blocked leaks. The sensitive payload itself is
/// never written — only origin metadata and a hash of the raw message.
struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    fn record(&self, logger: &str, origin: &str, leak_hash: &str) {
        let _guard = self.write_lock.lock();
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(
                file,
                "{} - SECURITY LEAK BLOCKED - logger={}, origin={}, hash={}",
                Utc::now().to_rfc3339(),
                logger,
                origin,
                leak_hash
            )
        })();

        if let Err(e) = result {
            eprintln!("SECURITY: failed to write audit log: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// SecureLogger
// ---------------------------------------------------------------------------

/// A named logger that filters every message before it reaches `tracing`.
pub struct SecureLogger {
    name: String,
    filter: Arc<SecurityFilter>,
    audit: Arc<AuditLog>,
}

impl SecureLogger {
    /// Default audit log location.
    pub fn new(name: &str) -> Self {
        Self::with_audit_path(name, Path::new("data/logs/security_audit.log"))
    }

    pub fn with_audit_path(name: &str, audit_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            filter: Arc::new(SecurityFilter::new()),
            audit: Arc::new(AuditLog::new(audit_path.to_path_buf())),
        }
    }

    /// Share one filter (and its counters) across several named loggers.
    pub fn with_shared_filter(name: &str, other: &SecureLogger) -> Self {
        Self {
            name: name.to_string(),
            filter: other.filter.clone(),
            audit: other.audit.clone(),
        }
    }

    fn sanitize(&self, msg: &str, origin: &std::panic::Location<'_>) -> String {
        let (filtered, leaked) = self.filter.redact(msg);
        if leaked {
            let hash = Self::short_hash(msg);
            self.audit.record(
                &self.name,
                &format!("{}:{}", origin.file(), origin.line()),
                &hash,
            );
        }
        filtered
    }

    fn short_hash(raw: &str) -> String {
        let digest = Sha256::digest(raw.as_bytes());
        hex::encode(&digest[..4])
    }

    #[track_caller]
    pub fn debug(&self, msg: &str) {
        let clean = self.sanitize(msg, std::panic::Location::caller());
        debug!(logger = %self.name, "{clean}");
    }

    #[track_caller]
    pub fn info(&self, msg: &str) {
        let clean = self.sanitize(msg, std::panic::Location::caller());
        info!(logger = %self.name, "{clean}");
    }

    #[track_caller]
    pub fn warn(&self, msg: &str) {
        let clean = self.sanitize(msg, std::panic::Location::caller());
        warn!(logger = %self.name, "{clean}");
    }

    #[track_caller]
    pub fn error(&self, msg: &str) {
        let clean = self.sanitize(msg, std::panic::Location::caller());
        error!(logger = %self.name, "{clean}");
    }

    #[track_caller]
    pub fn critical(&self, msg: &str) {
        let clean = self.sanitize(msg, std::panic::Location::caller());
        error!(logger = %self.name, critical = true, "{clean}");
    }

    // -------------------------------------------------------------------------
    // Whitelisted render helpers
    // -------------------------------------------------------------------------

    /// Log an exchange response using only the fixed safe field set.
    pub fn log_api_response(&self, response: &OrderResponse, success_msg: &str, error_msg: &str) {
        if response.is_success() {
            info!(
                logger = %self.name,
                ret_code = response.ret_code,
                order_id = %response.result.order_id,
                symbol = %response.result.symbol,
                side = %response.result.side,
                qty = %response.result.qty,
                status = %response.result.status,
                "{success_msg}"
            );
        } else {
            error!(
                logger = %self.name,
                ret_code = response.ret_code,
                ret_msg = %response.ret_msg,
                "{error_msg}"
            );
        }
    }

    /// Log an order request using only its safe fields.
    pub fn log_order_request(&self, request: &OrderRequest) {
        info!(
            logger = %self.name,
            symbol = %request.symbol,
            side = %request.side,
            order_type = %request.order_type,
            qty = request.qty,
            price = ?request.price,
            reduce_only = request.reduce_only,
            "order request"
        );
    }

    pub fn log_position_update(
        &self,
        symbol: &str,
        side: &str,
        size: f64,
        avg_price: f64,
        unrealized_pnl: f64,
    ) {
        info!(
            logger = %self.name,
            symbol,
            side,
            size,
            avg_price,
            unrealized_pnl = format!("{unrealized_pnl:.2}"),
            "position update"
        );
    }

    pub fn security_stats(&self) -> SecurityStats {
        self.filter.stats()
    }

    /// Access the underlying filter (for structural redaction of values).
    pub fn filter(&self) -> &SecurityFilter {
        &self.filter
    }
}

impl std::fmt::Debug for SecureLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureLogger")
            .field("name", &self.name)
            .field("blocked_leaks", &self.filter.stats().blocked_leaks_total)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
