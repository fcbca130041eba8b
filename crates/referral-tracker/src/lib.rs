//! Referral payout tracking for ReferPay.
//!
//! ReferPay pays referral rewards as plain token transfers from the minting
//! contract to the referrer. This crate counts those transfers for one account
//! at a time:
//!
//! * [`tracker`]: the [`ReferralTracker`] state machine, which owns the
//!   subscription and reconciles backfilled history with live updates.
//! * [`backfill`]: the ordered block-range fallback plan used for the
//!   historical scan.
//! * [`debounce`]: the increment accumulator committed after a quiet period.
//! * [`cache`]: per-account TTL cache used for instant provisional counts.
//! * [`source`]: the [`EventSource`] seam plus an in-memory implementation.
//! * [`clock`]: wall and manual clocks, so timing is testable.
//! * [`web3`]: address parsing/formatting and provider error classification.
//!
//! Nothing here is a process-wide singleton: sources, caches and clocks are
//! passed in by whoever builds the tracker.

pub mod backfill;
pub mod cache;
pub mod clock;
pub mod debounce;
pub mod event;
pub mod source;
pub mod tracker;
pub mod web3;

mod error;

pub use backfill::{
    BackfillJob, BackfillOutcome, BackfillPlan, BackfillReport, ChunkFailure, RangeStrategy,
};
pub use cache::{CacheEntry, CountCache, JsonFileCache, MemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use debounce::{DebounceState, Debouncer};
pub use error::{SourceError, TrackerError};
pub use event::{EventId, TransferEvent, TransferFilter};
pub use source::{EventSource, LiveCallback, MemoryEventSource, SubscriptionId};
pub use tracker::{
    CountSource, ExhaustionPolicy, ReferralCount, ReferralTracker, TeardownHandle, TrackOutcome,
    TrackerMessage, TrackerSettings,
};
