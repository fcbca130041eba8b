//! Small helpers shared by the tracker and its front ends.

use alloy_primitives::Address;

use crate::error::TrackerError;

/// Parse a `0x`-prefixed 20-byte hex address. Case is ignored; no checksum
/// validation is performed, matching what wallets hand back in `eth_accounts`.
pub fn parse_address(input: &str) -> Result<Address, TrackerError> {
    let trimmed = input.trim();
    let invalid = |reason: &str| TrackerError::InvalidAddress {
        input: input.to_string(),
        reason: reason.to_string(),
    };
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| invalid("missing 0x prefix"))?;
    if digits.len() != 40 {
        return Err(invalid("expected 40 hex characters"));
    }
    let bytes = hex::decode(digits).map_err(|e| invalid(&e.to_string()))?;
    Ok(Address::from_slice(&bytes))
}

/// Shorten an address for display: `0x1234...abcd`.
pub fn format_address(address: &Address) -> String {
    let full = address.to_checksum(None);
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

/// Coarse classification of provider error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcErrorKind {
    InsufficientFunds,
    UserRejected,
    Timeout,
    RangeTooLarge,
    Other,
}

impl RpcErrorKind {
    pub fn describe(self) -> &'static str {
        match self {
            RpcErrorKind::InsufficientFunds => "Insufficient funds for gas fees",
            RpcErrorKind::UserRejected => "Transaction rejected by user",
            RpcErrorKind::Timeout => "Transaction timeout - please try again",
            RpcErrorKind::RangeTooLarge => "Block range too large for provider",
            RpcErrorKind::Other => "Unknown error occurred",
        }
    }

    /// Whether repeating the same request could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, RpcErrorKind::Timeout | RpcErrorKind::Other)
    }
}

const RANGE_MARKERS: &[&str] = &[
    "block range",
    "range too large",
    "query returned more than",
    "block range limit exceeded",
    "too many results",
    "exceed maximum block range",
];

pub fn classify_rpc_error(message: &str) -> RpcErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("insufficient funds") {
        RpcErrorKind::InsufficientFunds
    } else if lower.contains("user rejected") {
        RpcErrorKind::UserRejected
    } else if RANGE_MARKERS.iter().any(|m| lower.contains(m)) {
        RpcErrorKind::RangeTooLarge
    } else if lower.contains("timeout") || lower.contains("timed out") {
        RpcErrorKind::Timeout
    } else {
        RpcErrorKind::Other
    }
}
