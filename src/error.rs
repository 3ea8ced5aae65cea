use thiserror::Error;

/// Failure taxonomy for one trade/transfer pipeline run.
///
/// Every variant is recoverable: the orchestrator converts it into a
/// user-facing `TradeResult` and the process keeps serving other users.
#[derive(Debug, Error)]
pub enum TradeError {
    /// Bad user input. Recovered locally with a re-prompt; no state change.
    #[error("{0}")]
    Validation(String),

    /// The wallet cannot cover the requested amount. Detected before any
    /// external call is made.
    #[error("🙅 Insufficient balance: need {needed} base units, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    /// The aggregator reported no route or rejected the slippage bounds.
    #[error("No swap route available: {0}")]
    QuoteUnavailable(String),

    /// Transaction assembly failed (malformed address, zero amount,
    /// undecodable aggregator payload).
    #[error("Failed to build transaction: {0}")]
    BuildError(String),

    /// The relay declined the bundle or the broadcast was not accepted.
    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    /// No terminal status arrived inside the configured confirmation window.
    /// The caller must re-run the whole pipeline to retry; the blockhash and
    /// route have expired.
    #[error("🚨 Transaction not confirmed in time")]
    ConfirmationTimeout,

    /// The transaction landed on chain but reverted.
    #[error("🚨 Transaction failed on chain: {0}")]
    OnChainError(String),

    /// Fewer than two transfers could be attributed to the route, so the
    /// executed amounts cannot be determined. Reported, never defaulted to
    /// zero.
    #[error("Could not attribute swap transfers for this transaction")]
    AmbiguousTransfer,

    /// RPC/network transport fault outside the categories above.
    #[error("RPC error: {0}")]
    Rpc(String),
}

impl TradeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TradeError::Validation(msg.into())
    }

    pub fn rpc(err: impl std::fmt::Display) -> Self {
        TradeError::Rpc(err.to_string())
    }
}
