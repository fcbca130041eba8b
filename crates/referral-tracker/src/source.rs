//! Blockchain event source seam.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::error::SourceError;
use crate::event::{TransferEvent, TransferFilter};

pub type SubscriptionId = u64;

/// Live event callback. Sources may invoke it from their own threads.
pub type LiveCallback = Box<dyn Fn(TransferEvent) + Send + Sync>;

/// Where transfer events come from: a JSON-RPC node, a wallet provider or an
/// in-memory chain.
pub trait EventSource: Send + Sync {
    fn current_block(&self) -> Result<u64, SourceError>;

    /// Matching events with `from_block <= block_number <= to_block`.
    fn query_past_events(
        &self,
        filter: &TransferFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, SourceError>;

    fn subscribe(
        &self,
        filter: &TransferFilter,
        callback: LiveCallback,
    ) -> Result<SubscriptionId, SourceError>;

    /// Unknown or already removed ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

type SharedCallback = Arc<dyn Fn(TransferEvent) + Send + Sync>;

#[derive(Default)]
struct MemoryChain {
    head: u64,
    history: Vec<TransferEvent>,
    subscribers: BTreeMap<SubscriptionId, (TransferFilter, SharedCallback)>,
    next_id: SubscriptionId,
    max_range: Option<u64>,
    failing_queries: u32,
    poisoned_blocks: BTreeSet<u64>,
    subscribe_error: Option<String>,
    subscribe_calls: u64,
    unsubscribe_calls: u64,
    queries: Vec<(u64, u64)>,
}

/// In-memory chain with scriptable provider failures.
#[derive(Default)]
pub struct MemoryEventSource {
    chain: Mutex<MemoryChain>,
}

impl MemoryEventSource {
    pub fn new(head: u64) -> Self {
        let source = Self::default();
        source.chain().head = head;
        source
    }

    fn chain(&self) -> MutexGuard<'_, MemoryChain> {
        self.chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_head(&self, head: u64) {
        self.chain().head = head;
    }

    /// Record an event without notifying subscribers.
    pub fn push_history(&self, event: TransferEvent) {
        let mut chain = self.chain();
        chain.head = chain.head.max(event.block_number);
        chain.history.push(event);
    }

    /// Append an event to the chain and notify matching subscribers.
    pub fn emit(&self, event: TransferEvent) {
        let targets: Vec<SharedCallback> = {
            let mut chain = self.chain();
            chain.head = chain.head.max(event.block_number);
            chain.history.push(event.clone());
            chain
                .subscribers
                .values()
                .filter(|(filter, _)| filter.matches(&event))
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for cb in targets {
            cb(event.clone());
        }
    }

    /// Deliver an event to every subscriber, ignoring their filters. Models a
    /// provider that over-delivers.
    pub fn broadcast(&self, event: TransferEvent) {
        let targets: Vec<SharedCallback> = self
            .chain()
            .subscribers
            .values()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in targets {
            cb(event.clone());
        }
    }

    /// Reject any query spanning more than `blocks` blocks.
    pub fn reject_ranges_wider_than(&self, blocks: Option<u64>) {
        self.chain().max_range = blocks;
    }

    pub fn fail_next_queries(&self, count: u32) {
        self.chain().failing_queries = count;
    }

    /// Fail every query whose range includes `block`.
    pub fn poison_block(&self, block: u64) {
        self.chain().poisoned_blocks.insert(block);
    }

    pub fn fail_subscriptions(&self, reason: Option<&str>) {
        self.chain().subscribe_error = reason.map(str::to_string);
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.chain().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> u64 {
        self.chain().unsubscribe_calls
    }

    pub fn active_subscriptions(&self) -> usize {
        self.chain().subscribers.len()
    }

    pub fn queries(&self) -> Vec<(u64, u64)> {
        self.chain().queries.clone()
    }
}

impl EventSource for MemoryEventSource {
    fn current_block(&self) -> Result<u64, SourceError> {
        Ok(self.chain().head)
    }

    fn query_past_events(
        &self,
        filter: &TransferFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, SourceError> {
        let mut chain = self.chain();
        chain.queries.push((from_block, to_block));
        trace!(from_block, to_block, "memory query");
        if chain.failing_queries > 0 {
            chain.failing_queries -= 1;
            return Err(SourceError::Rpc("injected query failure".into()));
        }
        if let Some(max) = chain.max_range {
            if to_block.saturating_sub(from_block) + 1 > max {
                return Err(SourceError::RangeTooLarge {
                    from: from_block,
                    to: to_block,
                });
            }
        }
        if chain.poisoned_blocks.range(from_block..=to_block).next().is_some() {
            return Err(SourceError::Rpc(format!(
                "injected failure in {from_block}..={to_block}"
            )));
        }
        Ok(chain
            .history
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    fn subscribe(
        &self,
        filter: &TransferFilter,
        callback: LiveCallback,
    ) -> Result<SubscriptionId, SourceError> {
        let mut chain = self.chain();
        chain.subscribe_calls += 1;
        if let Some(reason) = &chain.subscribe_error {
            return Err(SourceError::Unavailable(reason.clone()));
        }
        chain.next_id += 1;
        let id = chain.next_id;
        chain.subscribers.insert(id, (*filter, Arc::from(callback)));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut chain = self.chain();
        chain.unsubscribe_calls += 1;
        chain.subscribers.remove(&id);
    }
}
