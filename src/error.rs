//! Error types for the trading engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Unknown chain id: {0}")]
    UnknownChain(u64),

    #[error("Invalid signer key: {0}")]
    InvalidSignerKey(String),

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("RPC rate limited by provider {0}")]
    RpcRateLimited(String),

    #[error("No healthy provider available for chain {0}")]
    NoHealthyProvider(u64),

    // WebSocket errors
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket disconnected")]
    WebSocketDisconnected,

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    // Discovery errors
    #[error("Log decode error: {0}")]
    LogDecode(String),

    #[error("Token metadata fetch failed for {0}")]
    TokenMetadata(String),

    // Risk errors
    #[error("Risk assessment timed out for {0}")]
    RiskTimeout(String),

    #[error("Trade blocked by risk assessment: {0}")]
    RiskBlocked(String),

    // Execution errors
    #[error("Transaction build failed: {0}")]
    TransactionBuild(String),

    #[error("Transaction simulation failed: {0}")]
    TransactionSimulation(String),

    #[error("Transaction send failed: {0}")]
    TransactionSend(String),

    #[error("Transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("Slippage exceeded: expected {expected}, got {actual}")]
    SlippageExceeded { expected: String, actual: String },

    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: String, required: String },

    #[error("Execution queue full")]
    QueueFull,

    #[error("Trade execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Nonce {nonce} stuck for wallet {wallet} after {attempts} replacement attempts")]
    StuckNonce {
        wallet: String,
        nonce: u64,
        attempts: u32,
    },

    // Relay errors
    #[error("Bundle submission failed: {0}")]
    BundleSubmission(String),

    #[error("Bundle rejected by relay: {0}")]
    BundleRejected(String),

    #[error("Bundle expired without inclusion (target block {0})")]
    BundleExpired(u64),

    // Portfolio and safety errors
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Daily loss limit reached: lost ${lost}, limit is ${limit}")]
    DailyLossLimitReached { lost: String, limit: String },

    #[error("Max position size exceeded: requested ${requested}, max ${max}")]
    MaxPositionExceeded { requested: String, max: String },

    #[error("Concentration limit exceeded: position would be {pct:.1}% of portfolio")]
    ConcentrationExceeded { pct: f64 },

    #[error("Trading halted by circuit breaker: {0}")]
    TradingHalted(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient).
    ///
    /// Semantic RPC errors (reverts, invalid filters) are deliberately
    /// absent: retrying them cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RpcTimeout(_)
                | Error::RpcConnection(_)
                | Error::RpcRateLimited(_)
                | Error::WebSocketDisconnected
                | Error::TransactionSend(_)
                | Error::BundleSubmission(_)
        )
    }

    /// Check if this error is a safety violation
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            Error::DailyLossLimitReached { .. }
                | Error::MaxPositionExceeded { .. }
                | Error::ConcentrationExceeded { .. }
                | Error::TradingHalted(_)
                | Error::InsufficientFunds { .. }
        )
    }

    /// Check if this error marks the current provider as unhealthy.
    ///
    /// Connection-shaped errors count against the provider; semantic
    /// errors (bad filter, revert) do not.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::RpcConnection(_)
                | Error::RpcTimeout(_)
                | Error::WebSocketConnection(_)
                | Error::WebSocketDisconnected
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::RpcTimeout(0)
        } else if e.is_connect() {
            Error::RpcConnection(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::RpcTimeout(5000).is_retryable());
        assert!(Error::RpcConnection("reset".into()).is_retryable());
        assert!(!Error::Config("bad".into()).is_retryable());
        assert!(!Error::TransactionReverted("TRANSFER_FAILED".into()).is_retryable());
        // Semantic RPC errors (revert reasons, bad filters) never retry.
        assert!(!Error::Rpc("execution reverted: TRANSFER_FAILED".into()).is_retryable());
    }

    #[test]
    fn test_safety_violation_classification() {
        let err = Error::DailyLossLimitReached {
            lost: "500".into(),
            limit: "500".into(),
        };
        assert!(err.is_safety_violation());
        assert!(!Error::Rpc("oops".into()).is_safety_violation());
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(Error::RpcConnection("refused".into()).is_connection_error());
        assert!(!Error::TransactionReverted("revert".into()).is_connection_error());
        assert!(!Error::Rpc("invalid filter".into()).is_connection_error());
    }
}
