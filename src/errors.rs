// =============================================================================
// Error types — the submit-boundary sum type and the failure taxonomy
// =============================================================================
//
// Two layers, deliberately separate:
//
//   * `OrderError` is what callers of `OrderManager::submit` (and the
//     rate limiter) match on. Admission failures and exchange failures are
//     distinct variants; they are never conflated.
//   * `FailureKind` is the internal taxonomy the error handler's rule table
//     is keyed by. Every `OrderError` classifies into exactly one kind.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Public error surface
// ---------------------------------------------------------------------------

/// Every failure that can surface from an order submission or a rate-limiter
/// acquisition. Carries `symbol` / `strategy` where relevant.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrderError {
    #[error("emergency stop active: {reason}")]
    EmergencyStop { reason: String },

    #[error("rate limit exceeded ({scope}): {message}")]
    RateLimitExceeded { scope: String, message: String },

    #[error("duplicate order blocked for {symbol}: {message}")]
    DuplicateOrder { symbol: String, message: String },

    #[error("position conflict on {symbol}: {message}")]
    PositionConflict { symbol: String, message: String },

    #[error("submission queue full, order for {symbol} rejected")]
    QueueFull { symbol: String },

    #[error("order for {symbol} timed out after {timeout_secs:.1}s")]
    Timeout { symbol: String, timeout_secs: f64 },

    #[error("exchange rejected order for {symbol}: {ret_msg}")]
    OrderRejection {
        symbol: String,
        strategy: String,
        ret_msg: String,
    },

    #[error("exchange unavailable: {message}")]
    ExchangeUnavailable { message: String },

    #[error("invalid order parameters: {message}")]
    InvalidArgument { message: String },

    #[error("order manager is shutting down")]
    ShuttingDown,
}

impl OrderError {
    /// The symbol this error refers to, when one is attached.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::DuplicateOrder { symbol, .. }
            | Self::PositionConflict { symbol, .. }
            | Self::QueueFull { symbol }
            | Self::Timeout { symbol, .. }
            | Self::OrderRejection { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    /// True for failures that happened before anything was enqueued.
    /// Admission failures never mutate position state.
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::EmergencyStop { .. }
                | Self::RateLimitExceeded { .. }
                | Self::DuplicateOrder { .. }
                | Self::PositionConflict { .. }
                | Self::QueueFull { .. }
                | Self::InvalidArgument { .. }
                | Self::ShuttingDown
        )
    }
}

// ---------------------------------------------------------------------------
// Failure taxonomy (error-handler rule table key)
// ---------------------------------------------------------------------------

/// Classification of a failure for the recovery rule table.
///
/// `Other` is the root of the hierarchy: rule lookup tries the exact kind
/// first, then walks `parent()` links, and always terminates at the fallback
/// rule registered for `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    OrderRejection,
    RateLimit,
    PositionConflict,
    EmergencyStop,
    ApiKeyLeak,
    RiskLimitExceeded,
    ThreadSafetyViolation,
    InvalidArgument,
    ConnectionError,
    Other,
}

impl FailureKind {
    /// One step up the declared kind hierarchy.
    pub fn parent(&self) -> Option<FailureKind> {
        match self {
            Self::Other => None,
            _ => Some(Self::Other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderRejection => "OrderRejection",
            Self::RateLimit => "RateLimit",
            Self::PositionConflict => "PositionConflict",
            Self::EmergencyStop => "EmergencyStop",
            Self::ApiKeyLeak => "ApiKeyLeak",
            Self::RiskLimitExceeded => "RiskLimitExceeded",
            Self::ThreadSafetyViolation => "ThreadSafetyViolation",
            Self::InvalidArgument => "InvalidArgument",
            Self::ConnectionError => "ConnectionError",
            Self::Other => "Other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&OrderError> for FailureKind {
    fn from(err: &OrderError) -> Self {
        match err {
            OrderError::EmergencyStop { .. } => Self::EmergencyStop,
            OrderError::RateLimitExceeded { .. } => Self::RateLimit,
            OrderError::PositionConflict { .. } => Self::PositionConflict,
            OrderError::InvalidArgument { .. } => Self::InvalidArgument,
            OrderError::ExchangeUnavailable { .. } => Self::ConnectionError,
            OrderError::Timeout { .. } => Self::ConnectionError,
            OrderError::DuplicateOrder { .. }
            | OrderError::QueueFull { .. }
            | OrderError::OrderRejection { .. } => Self::OrderRejection,
            OrderError::ShuttingDown => Self::Other,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
