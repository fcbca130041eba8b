use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

/// On-chain identity of a log: the transaction that emitted it and its index
/// within the block.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub tx_hash: B256,
    pub log_index: u64,
}

/// Decoded ERC-20 `Transfer(from, to, value)` log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
}

/// Filter describing referral payouts for one account: transfers of `token`
/// from the payout source to the account.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferFilter {
    pub token: Address,
    pub from: Address,
    pub to: Address,
}

impl TransferFilter {
    pub fn new(token: Address, from: Address, to: Address) -> Self {
        Self { token, from, to }
    }

    /// Referral matching rule. Addresses are compared as bytes, so the
    /// comparison does not depend on how either side was capitalised.
    pub fn matches(&self, event: &TransferEvent) -> bool {
        event.from == self.from && event.to == self.to
    }
}
