use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use referral_tracker::{
    Clock, EventId, EventSource, ManualClock, MemoryCache, MemoryEventSource, ReferralCount,
    ReferralTracker, TrackOutcome, TrackerSettings, TransferEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CliError;

/// One line of a replay file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayRecord {
    pub from: Address,
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    pub block_number: u64,
    #[serde(default)]
    pub tx_hash: Option<B256>,
    #[serde(default)]
    pub log_index: Option<u64>,
    /// Quiet time before this record is delivered, for live records.
    #[serde(default)]
    pub delay_ms: u64,
}

impl ReplayRecord {
    pub fn event(&self) -> TransferEvent {
        let id = match (self.tx_hash, self.log_index) {
            (Some(tx_hash), Some(log_index)) => Some(EventId { tx_hash, log_index }),
            _ => None,
        };
        TransferEvent {
            from: self.from,
            to: self.to,
            value: self.value,
            block_number: self.block_number,
            id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplaySummary {
    pub history: usize,
    pub live: usize,
    pub final_count: ReferralCount,
    /// `(virtual ms, count)` for every change of the visible count.
    pub updates: Vec<(u64, u64)>,
}

pub fn read_records(path: &Path) -> Result<Vec<ReplayRecord>, CliError> {
    let io_err = |source| CliError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| CliError::Replay {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Drive a tracker for `account` over recorded transfers on a virtual clock.
/// Records at or below `head` form the history the backfill sees; the rest
/// are delivered live, in file order, after their `delay_ms`.
pub fn replay(
    records: &[ReplayRecord],
    account: Address,
    head: u64,
    settings: TrackerSettings,
) -> Result<ReplaySummary, CliError> {
    let source = Arc::new(MemoryEventSource::new(head));
    let (history, live): (Vec<&ReplayRecord>, Vec<&ReplayRecord>) =
        records.iter().partition(|r| r.block_number <= head);
    for record in &history {
        source.push_history(record.event());
    }

    let clock = Arc::new(ManualClock::new(0));
    let debounce_ms = settings.debounce_ms;
    let mut driver = ReplayDriver {
        tracker: ReferralTracker::new(
            settings,
            Some(source.clone() as Arc<dyn EventSource>),
            Box::new(MemoryCache::new()),
            clock.clone(),
        ),
        clock,
        updates: Vec::new(),
    };

    match driver.tracker.track(account)? {
        TrackOutcome::Started { backfill, .. } => {
            driver.tracker.backfill_now(backfill);
        }
        other => debug!(?other, "replay tracker did not start a backfill"),
    }
    driver.record();
    info!(history = history.len(), count = driver.tracker.count().value, "history replayed");

    for record in &live {
        driver.advance(record.delay_ms);
        source.emit(record.event());
        driver.tracker.drain_inbox();
    }
    driver.advance(debounce_ms);

    Ok(ReplaySummary {
        history: history.len(),
        live: live.len(),
        final_count: driver.tracker.count(),
        updates: driver.updates,
    })
}

struct ReplayDriver {
    tracker: ReferralTracker,
    clock: Arc<ManualClock>,
    updates: Vec<(u64, u64)>,
}

impl ReplayDriver {
    /// Move the virtual clock forward, firing timers at their own deadlines.
    fn advance(&mut self, ms: u64) {
        let target = self.clock.now_ms() + ms;
        while let Some(deadline) = self.tracker.next_wakeup() {
            if deadline > target {
                break;
            }
            self.clock.set(deadline.max(self.clock.now_ms()));
            if self.tracker.poll_timers() {
                self.record();
            }
        }
        self.clock.set(target);
    }

    fn record(&mut self) {
        let value = self.tracker.count().value;
        if self.updates.last().map(|(_, v)| *v) != Some(value) {
            self.updates.push((self.clock.now_ms(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use alloy_primitives::address;
    use referral_tracker::CountSource;

    const TOKEN: Address = address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359");
    const PAYOUT: Address = address!("19C1d81A794411a85666754839B865cBFb61f724");
    const ACCOUNT: Address = address!("00000000000000000000000000000000000000aa");
    const OTHER: Address = address!("00000000000000000000000000000000000000bb");

    fn record(to: Address, block_number: u64, log_index: u64, delay_ms: u64) -> ReplayRecord {
        ReplayRecord {
            from: PAYOUT,
            to,
            value: U256::from(1_000_000u64),
            block_number,
            tx_hash: Some(B256::with_last_byte(block_number as u8)),
            log_index: Some(log_index),
            delay_ms,
        }
    }

    #[test]
    fn history_then_live_events_are_counted() {
        let records = vec![
            record(ACCOUNT, 10, 0, 0),
            record(ACCOUNT, 20, 0, 0),
            record(OTHER, 30, 0, 0),
            record(ACCOUNT, 120, 0, 1_000),
            record(ACCOUNT, 121, 0, 100),
        ];
        let settings = TrackerSettings::new(TOKEN, PAYOUT);
        let summary = replay(&records, ACCOUNT, 100, settings).unwrap();

        assert_eq!(summary.history, 3);
        assert_eq!(summary.live, 2);
        assert_eq!(summary.final_count.value, 4);
        assert_eq!(summary.final_count.source, CountSource::Confirmed);
        // both live payouts land inside one debounce window
        assert_eq!(summary.updates, vec![(0, 2), (1_600, 4)]);
    }

    #[test]
    fn separated_payouts_commit_separately() {
        let records = vec![record(ACCOUNT, 101, 0, 0), record(ACCOUNT, 102, 0, 2_000)];
        let settings = TrackerSettings::new(TOKEN, PAYOUT);
        let summary = replay(&records, ACCOUNT, 100, settings).unwrap();

        assert_eq!(summary.final_count.value, 2);
        assert_eq!(summary.updates, vec![(0, 0), (500, 1), (2_500, 2)]);
    }

    #[test]
    fn reads_jsonl_and_reports_bad_lines() {
        let dir = std::env::temp_dir().join(format!("referpay-replay-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.jsonl");
        let line = serde_json::to_string(&record(ACCOUNT, 5, 1, 0)).unwrap();
        fs::write(&good, format!("{line}\n\n{line}\n")).unwrap();
        let records = read_records(&good).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event().id.unwrap().log_index, 1);

        let bad = dir.join("bad.jsonl");
        fs::write(&bad, format!("{line}\nnot json\n")).unwrap();
        match read_records(&bad) {
            Err(CliError::Replay { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }

        let _ = fs::remove_dir_all(&dir);
    }
}
