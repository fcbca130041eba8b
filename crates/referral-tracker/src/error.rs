use thiserror::Error;

/// Errors surfaced to callers of the tracker. Only setup-time failures end up
/// here; backfill and cache problems are absorbed and logged.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The supplied account string is not a 20-byte hex address.
    #[error("invalid address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    /// The event source refused to bind the transfer listener.
    #[error("failed to set up referral subscription: {0}")]
    SubscriptionSetup(#[source] SourceError),
}

/// Failures reported by an [`EventSource`](crate::EventSource).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Generic provider/transport failure.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The provider rejected the block range (too wide, too many results).
    #[error("block range {from}..={to} rejected by provider")]
    RangeTooLarge { from: u64, to: u64 },

    /// The source cannot serve requests at all.
    #[error("event source unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with something we could not decode.
    #[error("failed to decode provider response: {0}")]
    Decode(String),
}
