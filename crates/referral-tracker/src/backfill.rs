//! Historical scan for referral payouts.
//!
//! Providers limit how many blocks a single `eth_getLogs` may cover, and the
//! limit differs per provider. The plan is an ordered list of range
//! strategies; the first one that succeeds wins.

use std::fmt;
use std::sync::mpsc::Sender;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::SourceError;
use crate::event::{TransferEvent, TransferFilter};
use crate::source::EventSource;
use crate::tracker::TrackerMessage;

pub const PRIMARY_WINDOW_BLOCKS: u64 = 100_000;
pub const FALLBACK_WINDOW_BLOCKS: u64 = 10_000;
pub const STEPPED_SPAN_BLOCKS: u64 = 20_000;
pub const STEPPED_CHUNK_BLOCKS: u64 = 2_000;
pub const DEFAULT_TIME_BUDGET_MS: u64 = 300_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeStrategy {
    /// One query over the most recent `blocks` blocks.
    Window { blocks: u64 },
    /// The most recent `span` blocks, queried sequentially in `chunk`-sized
    /// pieces.
    Stepped { span: u64, chunk: u64 },
}

impl fmt::Display for RangeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeStrategy::Window { blocks } => write!(f, "window({blocks})"),
            RangeStrategy::Stepped { span, chunk } => write!(f, "stepped({span}/{chunk})"),
        }
    }
}

/// What a stepped scan does when one chunk fails.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFailure {
    /// The whole attempt fails.
    Abort,
    /// Log, skip the chunk and keep scanning. The attempt fails only when
    /// every chunk failed.
    #[default]
    Skip,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillPlan {
    pub attempts: Vec<RangeStrategy>,
    pub chunk_failure: ChunkFailure,
    /// Upper bound on the whole scan; attempts are not started past it.
    pub time_budget_ms: u64,
}

impl Default for BackfillPlan {
    fn default() -> Self {
        Self {
            attempts: vec![
                RangeStrategy::Window {
                    blocks: PRIMARY_WINDOW_BLOCKS,
                },
                RangeStrategy::Window {
                    blocks: FALLBACK_WINDOW_BLOCKS,
                },
                RangeStrategy::Stepped {
                    span: STEPPED_SPAN_BLOCKS,
                    chunk: STEPPED_CHUNK_BLOCKS,
                },
            ],
            chunk_failure: ChunkFailure::default(),
            time_budget_ms: DEFAULT_TIME_BUDGET_MS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackfillOutcome {
    Completed {
        events: Vec<TransferEvent>,
        strategy: RangeStrategy,
        skipped_chunks: usize,
    },
    Exhausted {
        last_error: Option<SourceError>,
    },
}

impl BackfillPlan {
    pub fn with_chunk_failure(mut self, chunk_failure: ChunkFailure) -> Self {
        self.chunk_failure = chunk_failure;
        self
    }

    pub fn with_time_budget_ms(mut self, time_budget_ms: u64) -> Self {
        self.time_budget_ms = time_budget_ms;
        self
    }

    pub fn execute(
        &self,
        source: &dyn EventSource,
        filter: &TransferFilter,
        clock: &dyn Clock,
    ) -> BackfillOutcome {
        let started = clock.now_ms();
        let over_budget = || clock.now_ms().saturating_sub(started) >= self.time_budget_ms;
        let mut last_error = None;

        for (tier, strategy) in self.attempts.iter().enumerate() {
            if over_budget() {
                warn!(tier, budget_ms = self.time_budget_ms, "backfill time budget exhausted");
                last_error = Some(budget_error());
                break;
            }
            let attempt = source
                .current_block()
                .and_then(|head| self.run_strategy(*strategy, head, source, filter, &over_budget));
            match attempt {
                Ok((events, skipped_chunks)) => {
                    let events: Vec<TransferEvent> =
                        events.into_iter().filter(|e| filter.matches(e)).collect();
                    info!(
                        tier,
                        %strategy,
                        events = events.len(),
                        skipped_chunks,
                        "backfill completed"
                    );
                    return BackfillOutcome::Completed {
                        events,
                        strategy: *strategy,
                        skipped_chunks,
                    };
                }
                Err(e) => {
                    warn!(tier, %strategy, error = %e, "backfill attempt failed");
                    last_error = Some(e);
                }
            }
        }

        error!(account = %filter.to, "all backfill attempts failed");
        BackfillOutcome::Exhausted { last_error }
    }

    fn run_strategy(
        &self,
        strategy: RangeStrategy,
        head: u64,
        source: &dyn EventSource,
        filter: &TransferFilter,
        over_budget: &dyn Fn() -> bool,
    ) -> Result<(Vec<TransferEvent>, usize), SourceError> {
        match strategy {
            RangeStrategy::Window { blocks } => {
                let from = head.saturating_sub(blocks);
                Ok((source.query_past_events(filter, from, head)?, 0))
            }
            RangeStrategy::Stepped { span, chunk } => {
                let chunk = chunk.max(1);
                let mut from = head.saturating_sub(span);
                let mut events = Vec::new();
                let mut chunks = 0usize;
                let mut skipped = 0usize;
                let mut last_error = None;
                loop {
                    if over_budget() {
                        return Err(budget_error());
                    }
                    let to = from.saturating_add(chunk - 1).min(head);
                    chunks += 1;
                    match source.query_past_events(filter, from, to) {
                        Ok(found) => {
                            debug!(from, to, found = found.len(), "backfill chunk");
                            events.extend(found);
                        }
                        Err(e) => match self.chunk_failure {
                            ChunkFailure::Abort => return Err(e),
                            ChunkFailure::Skip => {
                                warn!(from, to, error = %e, "skipping failed backfill chunk");
                                skipped += 1;
                                last_error = Some(e);
                            }
                        },
                    }
                    if to >= head {
                        break;
                    }
                    from = to + 1;
                }
                if skipped == chunks {
                    return Err(last_error.unwrap_or_else(budget_error));
                }
                Ok((events, skipped))
            }
        }
    }
}

fn budget_error() -> SourceError {
    SourceError::Unavailable("backfill time budget exhausted".into())
}

/// Result of one backfill, tagged with the subscription it was issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillReport {
    pub account: Address,
    pub generation: u64,
    pub outcome: BackfillOutcome,
}

/// A backfill detached from the tracker so it can run on any thread. The
/// report finds its way back through the tracker inbox.
#[derive(Debug)]
pub struct BackfillJob {
    account: Address,
    generation: u64,
    filter: TransferFilter,
    plan: BackfillPlan,
    inbox: Sender<TrackerMessage>,
}

impl BackfillJob {
    pub(crate) fn new(
        account: Address,
        generation: u64,
        filter: TransferFilter,
        plan: BackfillPlan,
        inbox: Sender<TrackerMessage>,
    ) -> Self {
        Self {
            account,
            generation,
            filter,
            plan,
            inbox,
        }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn filter(&self) -> &TransferFilter {
        &self.filter
    }

    pub fn execute(&self, source: &dyn EventSource, clock: &dyn Clock) -> BackfillReport {
        BackfillReport {
            account: self.account,
            generation: self.generation,
            outcome: self.plan.execute(source, &self.filter, clock),
        }
    }

    /// Execute and post the report to the tracker inbox.
    pub fn run(self, source: &dyn EventSource, clock: &dyn Clock) {
        let report = self.execute(source, clock);
        if self.inbox.send(TrackerMessage::Backfill(report)).is_err() {
            debug!(account = %self.account, "tracker dropped before backfill finished");
        }
    }
}
