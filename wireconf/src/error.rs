// Core error types

//! Error kinds surfaced by the deployment engine
//!
//! Rendering and validation errors are raised before any host mutation.
//! Deployment-step errors raised after artifacts are written are folded into a
//! degraded [`CommitReport`](crate::orchestrator::CommitReport) by the
//! orchestrator instead of being returned as `Err`.

use thiserror::Error;

/// Unified error type for the core library.
#[derive(Debug, Error)]
pub enum Error {
    // ── Pre-deployment errors ────────────────────────────────────────
    #[error("Server configuration incomplete: {missing}")]
    ConfigurationIncomplete { missing: String },

    #[error("Octet {octet} is not a valid host address in network {cidr}")]
    InvalidOctetForNetwork { cidr: String, octet: u8 },

    #[error("No available octets in the 2-254 range")]
    OctetPoolExhausted,

    #[error("Client not found: {name}")]
    ClientNotFound { name: String },

    // ── Host tooling ─────────────────────────────────────────────────
    #[error("Command '{tool}' not found in PATH or common installation locations")]
    ToolNotFound { tool: String },

    #[error("{tool} failed: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    #[error("Key service failure: {0}")]
    KeyService(String),

    // ── Transaction guard ────────────────────────────────────────────
    #[error("A configuration change is already being verified (transaction {id})")]
    TransactionConflict { id: String },

    #[error("Transaction {id} is no longer pending")]
    TransactionStale { id: String },

    #[error("Revert failed: {reason}")]
    RevertFailed { reason: String },

    // ── Persistence ──────────────────────────────────────────────────
    #[error("Domain store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience constructor for tool failures.
    pub fn tool_failed(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolExecutionFailed {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}
