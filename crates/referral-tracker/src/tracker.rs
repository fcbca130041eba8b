//! The referral tracker state machine.
//!
//! A tracker is bound to at most one account at a time. Binding subscribes to
//! live payouts, paints a provisional count from the cache and hands back a
//! [`BackfillJob`] for the historical scan. Everything that happens later
//! (live events, backfill reports) arrives through the tracker inbox and is
//! applied on the owner's thread, so state never changes behind its back.
//!
//! Live events and backfill reports carry the generation of the subscription
//! they belong to. Anything from an older generation is dropped on arrival.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::backfill::{BackfillJob, BackfillOutcome, BackfillPlan, BackfillReport};
use crate::cache::{CacheEntry, CountCache, DEFAULT_CACHE_TTL_MS};
use crate::clock::Clock;
use crate::debounce::{DebounceState, Debouncer, DEFAULT_DEBOUNCE_MS};
use crate::error::TrackerError;
use crate::event::{EventId, TransferEvent, TransferFilter};
use crate::source::{EventSource, LiveCallback, SubscriptionId};

/// What to show when every backfill attempt failed.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Keep the provisional value (cache plus live increments).
    #[default]
    KeepLastKnown,
    /// Treat history as empty; only live increments count.
    Zero,
}

#[derive(Clone, Debug)]
pub struct TrackerSettings {
    /// Token contract emitting the `Transfer` events (USDC).
    pub token: Address,
    /// Contract paying referral rewards.
    pub payout_source: Address,
    pub cache_ttl_ms: u64,
    pub debounce_ms: u64,
    pub plan: BackfillPlan,
    pub exhaustion: ExhaustionPolicy,
}

impl TrackerSettings {
    pub fn new(token: Address, payout_source: Address) -> Self {
        Self {
            token,
            payout_source,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            plan: BackfillPlan::default(),
            exhaustion: ExhaustionPolicy::default(),
        }
    }
}

/// Where the visible count came from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    Empty,
    /// History not confirmed yet: a fresh cache entry and/or live increments.
    Provisional,
    /// Historical scan finished.
    Confirmed,
    /// Historical scan gave up; see [`ExhaustionPolicy`].
    Degraded,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralCount {
    pub value: u64,
    /// Milliseconds since the Unix epoch of the last refresh.
    pub updated_at: Option<u64>,
    pub source: CountSource,
}

impl ReferralCount {
    pub fn empty() -> Self {
        Self {
            value: 0,
            updated_at: None,
            source: CountSource::Empty,
        }
    }
}

/// Identifies one subscription. Tearing down with a handle from an older
/// subscription does nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TeardownHandle {
    generation: u64,
    subscription: SubscriptionId,
}

impl TeardownHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }
}

#[derive(Debug)]
pub enum TrackOutcome {
    /// No event source configured; nothing happened.
    NoProvider,
    /// The account was already bound; the existing handle is returned.
    AlreadyTracking(TeardownHandle),
    /// A new subscription. The backfill has not run yet.
    Started {
        handle: TeardownHandle,
        backfill: BackfillJob,
    },
}

impl TrackOutcome {
    pub fn handle(&self) -> Option<TeardownHandle> {
        match self {
            TrackOutcome::NoProvider => None,
            TrackOutcome::AlreadyTracking(handle) => Some(*handle),
            TrackOutcome::Started { handle, .. } => Some(*handle),
        }
    }

    pub fn into_backfill(self) -> Option<BackfillJob> {
        match self {
            TrackOutcome::Started { backfill, .. } => Some(backfill),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum TrackerMessage {
    Live { generation: u64, event: TransferEvent },
    Backfill(BackfillReport),
}

struct ActiveSubscription {
    account: Address,
    filter: TransferFilter,
    handle: TeardownHandle,
    backfilled: bool,
    /// Ids already reflected in the committed count.
    counted: HashSet<EventId>,
    /// Committed live events, kept until the backfill lands so they can be
    /// merged into the historical result.
    live_ids: HashSet<EventId>,
    live_anonymous: u64,
    pending_ids: HashSet<EventId>,
    pending_anonymous: u64,
}

impl ActiveSubscription {
    fn new(account: Address, filter: TransferFilter, handle: TeardownHandle) -> Self {
        Self {
            account,
            filter,
            handle,
            backfilled: false,
            counted: HashSet::new(),
            live_ids: HashSet::new(),
            live_anonymous: 0,
            pending_ids: HashSet::new(),
            pending_anonymous: 0,
        }
    }

    fn live_committed(&self) -> u64 {
        self.live_ids.len() as u64 + self.live_anonymous
    }
}

pub struct ReferralTracker {
    settings: TrackerSettings,
    source: Option<Arc<dyn EventSource>>,
    cache: Box<dyn CountCache>,
    clock: Arc<dyn Clock>,
    inbox_tx: Sender<TrackerMessage>,
    inbox_rx: Receiver<TrackerMessage>,
    active: Option<ActiveSubscription>,
    debouncer: Debouncer,
    count: ReferralCount,
    generation: u64,
}

impl ReferralTracker {
    pub fn new(
        settings: TrackerSettings,
        source: Option<Arc<dyn EventSource>>,
        cache: Box<dyn CountCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let debouncer = Debouncer::new(settings.debounce_ms);
        Self {
            settings,
            source,
            cache,
            clock,
            inbox_tx,
            inbox_rx,
            active: None,
            debouncer,
            count: ReferralCount::empty(),
            generation: 0,
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn count(&self) -> ReferralCount {
        self.count
    }

    pub fn is_tracking(&self) -> bool {
        self.active.is_some()
    }

    pub fn bound_account(&self) -> Option<Address> {
        self.active.as_ref().map(|a| a.account)
    }

    pub fn current_handle(&self) -> Option<TeardownHandle> {
        self.active.as_ref().map(|a| a.handle)
    }

    pub fn is_backfilled(&self) -> bool {
        self.active.as_ref().map_or(false, |a| a.backfilled)
    }

    pub fn pending_increment(&self) -> u64 {
        self.debouncer.pending()
    }

    pub fn debounce_state(&self) -> DebounceState {
        self.debouncer.state()
    }

    /// Bind the tracker to `account`.
    pub fn track(&mut self, account: Address) -> Result<TrackOutcome, TrackerError> {
        let Some(source) = self.source.clone() else {
            debug!(account = %account, "no event source; referral tracking disabled");
            return Ok(TrackOutcome::NoProvider);
        };

        if let Some(active) = &self.active {
            if active.account == account {
                trace!(account = %account, "already tracking");
                return Ok(TrackOutcome::AlreadyTracking(active.handle));
            }
            info!(from = %active.account, to = %account, "switching tracked account");
        }
        self.teardown_active();
        self.count = ReferralCount::empty();

        let filter =
            TransferFilter::new(self.settings.token, self.settings.payout_source, account);
        self.generation += 1;
        let generation = self.generation;

        let tx = self.inbox_tx.clone();
        let callback: LiveCallback = Box::new(move |event| {
            // tracker dropped: nobody left to notify
            let _ = tx.send(TrackerMessage::Live { generation, event });
        });
        let subscription = source.subscribe(&filter, callback).map_err(|e| {
            warn!(account = %account, error = %e, "referral subscription failed");
            TrackerError::SubscriptionSetup(e)
        })?;
        let handle = TeardownHandle {
            generation,
            subscription,
        };

        let now = self.clock.now_ms();
        match self.cache.get(&account) {
            Some(entry) if entry.is_fresh(now, self.settings.cache_ttl_ms) => {
                debug!(account = %account, count = entry.count, "provisional count from cache");
                self.count = ReferralCount {
                    value: entry.count,
                    updated_at: Some(entry.timestamp),
                    source: CountSource::Provisional,
                };
            }
            Some(entry) => {
                debug!(
                    account = %account,
                    age_ms = now.saturating_sub(entry.timestamp),
                    "cache entry expired"
                );
            }
            None => {}
        }

        self.active = Some(ActiveSubscription::new(account, filter, handle));
        info!(account = %account, generation, subscription, "tracking referrals");

        let backfill = BackfillJob::new(
            account,
            generation,
            filter,
            self.settings.plan.clone(),
            self.inbox_tx.clone(),
        );
        Ok(TrackOutcome::Started { handle, backfill })
    }

    /// Tear down the subscription `handle` refers to. Returns `false` when the
    /// handle is stale or nothing is tracked.
    pub fn teardown(&mut self, handle: TeardownHandle) -> bool {
        let current = self.active.as_ref().map_or(false, |a| a.handle == handle);
        if current {
            self.teardown_active();
        }
        current
    }

    /// Tear down and zero the visible count. Cache entries are left alone.
    pub fn reset(&mut self) {
        self.teardown_active();
        self.count = ReferralCount::empty();
    }

    fn teardown_active(&mut self) {
        self.debouncer.clear();
        if let Some(active) = self.active.take() {
            if let Some(source) = &self.source {
                source.unsubscribe(active.handle.subscription);
            }
            info!(
                account = %active.account,
                generation = active.handle.generation,
                "stopped tracking referrals"
            );
        }
    }

    /// Run the backfill on a worker thread; the report arrives via the inbox.
    pub fn spawn_backfill(&self, job: BackfillJob) -> Option<thread::JoinHandle<()>> {
        let source = self.source.clone()?;
        let clock = self.clock.clone();
        Some(thread::spawn(move || job.run(source.as_ref(), clock.as_ref())))
    }

    /// Run the backfill on the current thread and apply it.
    pub fn backfill_now(&mut self, job: BackfillJob) -> bool {
        let Some(source) = self.source.clone() else {
            return false;
        };
        let report = job.execute(source.as_ref(), self.clock.as_ref());
        self.complete_backfill(report)
    }

    /// Apply a backfill report. Returns `false` if it was stale.
    pub fn complete_backfill(&mut self, report: BackfillReport) -> bool {
        let now = self.clock.now_ms();
        let exhaustion = self.settings.exhaustion;
        let Some(active) = self.active.as_mut() else {
            debug!(account = %report.account, "backfill finished after teardown; ignored");
            return false;
        };
        if active.handle.generation != report.generation || active.account != report.account {
            debug!(
                account = %report.account,
                generation = report.generation,
                current = active.handle.generation,
                "discarding stale backfill"
            );
            return false;
        }

        match report.outcome {
            BackfillOutcome::Completed {
                events,
                skipped_chunks,
                ..
            } => {
                let mut historical_ids = HashSet::new();
                let mut anonymous = 0u64;
                for event in events.iter().filter(|e| active.filter.matches(e)) {
                    match event.id {
                        Some(id) => {
                            historical_ids.insert(id);
                        }
                        None => anonymous += 1,
                    }
                }

                let live_only = active.live_ids.difference(&historical_ids).count() as u64;
                let value =
                    historical_ids.len() as u64 + anonymous + live_only + active.live_anonymous;

                let already_pending =
                    active.pending_ids.intersection(&historical_ids).count() as u64;
                active.pending_ids.retain(|id| !historical_ids.contains(id));
                self.debouncer.retract(already_pending);

                active.counted = historical_ids;
                active.counted.extend(active.live_ids.drain());
                active.backfilled = true;

                if skipped_chunks > 0 {
                    // ranges are missing: never lower the count or persist it
                    let value = value.max(self.count.value);
                    self.count = ReferralCount {
                        value,
                        updated_at: Some(now),
                        source: CountSource::Degraded,
                    };
                    warn!(
                        account = %active.account,
                        count = value,
                        skipped_chunks,
                        "referral history incomplete"
                    );
                } else {
                    self.count = ReferralCount {
                        value,
                        updated_at: Some(now),
                        source: CountSource::Confirmed,
                    };
                    self.cache.set(&active.account, CacheEntry::new(value, now));
                    info!(account = %active.account, count = value, "referral count confirmed");
                }
            }
            BackfillOutcome::Exhausted { last_error } => {
                active.backfilled = true;
                let value = match exhaustion {
                    ExhaustionPolicy::KeepLastKnown => self.count.value,
                    ExhaustionPolicy::Zero => active.live_committed(),
                };
                self.count = ReferralCount {
                    value,
                    updated_at: self.count.updated_at,
                    source: CountSource::Degraded,
                };
                warn!(
                    account = %active.account,
                    count = value,
                    error = ?last_error,
                    "referral history unavailable"
                );
            }
        }
        true
    }

    fn on_live_event(&mut self, generation: u64, event: TransferEvent) {
        let now = self.clock.now_ms();
        let Some(active) = self.active.as_mut() else {
            trace!("live event with no subscription");
            return;
        };
        if active.handle.generation != generation {
            trace!(generation, "live event for an old subscription");
            return;
        }
        if !active.filter.matches(&event) {
            trace!(from = %event.from, to = %event.to, "ignoring non-referral transfer");
            return;
        }
        match event.id {
            Some(id) => {
                if active.counted.contains(&id)
                    || active.live_ids.contains(&id)
                    || !active.pending_ids.insert(id)
                {
                    debug!(?id, "duplicate referral event");
                    return;
                }
            }
            None => active.pending_anonymous += 1,
        }
        self.debouncer.push(now);
        debug!(
            block = event.block_number,
            pending = self.debouncer.pending(),
            "referral payout received"
        );
    }

    pub fn handle_message(&mut self, message: TrackerMessage) {
        match message {
            TrackerMessage::Live { generation, event } => self.on_live_event(generation, event),
            TrackerMessage::Backfill(report) => {
                self.complete_backfill(report);
            }
        }
    }

    /// Apply every queued message without blocking.
    pub fn drain_inbox(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.inbox_rx.try_recv() {
                Ok(message) => {
                    self.handle_message(message);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    /// Block up to `timeout` for the next message, then drain the rest.
    pub fn wait_inbox(&mut self, timeout: Duration) -> usize {
        match self.inbox_rx.recv_timeout(timeout) {
            Ok(message) => {
                self.handle_message(message);
                1 + self.drain_inbox()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// When `poll_timers` next has something to do.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.debouncer.deadline()
    }

    /// Commit debounced increments whose quiet period has passed.
    pub fn poll_timers(&mut self) -> bool {
        let now = self.clock.now_ms();
        let Some(amount) = self.debouncer.poll(now) else {
            return false;
        };
        let Some(active) = self.active.as_mut() else {
            return false;
        };

        let ids: Vec<EventId> = active.pending_ids.drain().collect();
        if active.backfilled {
            active.counted.extend(ids);
        } else {
            active.live_ids.extend(ids);
        }
        active.live_anonymous += active.pending_anonymous;
        active.pending_anonymous = 0;

        let value = self.count.value + amount;
        let source = match self.count.source {
            CountSource::Empty => CountSource::Provisional,
            other => other,
        };
        self.count = ReferralCount {
            value,
            updated_at: Some(now),
            source,
        };
        self.cache.set(&active.account, CacheEntry::new(value, now));
        info!(account = %active.account, added = amount, count = value, "referral count updated");
        true
    }
}

impl Drop for ReferralTracker {
    fn drop(&mut self) {
        self.teardown_active();
    }
}
