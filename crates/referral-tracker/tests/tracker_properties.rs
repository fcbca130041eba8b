use std::sync::{Arc, Mutex};

use alloy_primitives::{address, Address, B256, U256};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use referral_tracker::{
    BackfillPlan, CacheEntry, CountCache, CountSource, EventId, EventSource, ExhaustionPolicy,
    ManualClock, MemoryCache, MemoryEventSource, ReferralTracker, TrackOutcome, TrackerError,
    TrackerSettings, TransferEvent,
};

const TOKEN: Address = address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359");
const PAYOUT: Address = address!("19C1d81A794411a85666754839B865cBFb61f724");
const ALICE: Address = address!("000000000000000000000000000000000000aaaa");
const BOB: Address = address!("000000000000000000000000000000000000bbbb");

const START_MS: u64 = 1_700_000_000_000;

/// Cache the test can inspect after handing it to the tracker.
#[derive(Clone, Default)]
struct SharedCache(Arc<Mutex<MemoryCache>>);

impl SharedCache {
    fn entry(&self, account: &Address) -> Option<CacheEntry> {
        self.0.lock().unwrap().get(account)
    }
}

impl CountCache for SharedCache {
    fn get(&self, account: &Address) -> Option<CacheEntry> {
        self.0.lock().unwrap().get(account)
    }

    fn set(&mut self, account: &Address, entry: CacheEntry) {
        self.0.lock().unwrap().set(account, entry);
    }

    fn remove(&mut self, account: &Address) {
        self.0.lock().unwrap().remove(account);
    }
}

struct Harness {
    source: Arc<MemoryEventSource>,
    clock: ManualClock,
    cache: SharedCache,
    tracker: ReferralTracker,
}

fn harness_with(head: u64, settings: TrackerSettings, cache: SharedCache) -> Harness {
    let source = Arc::new(MemoryEventSource::new(head));
    let clock = ManualClock::new(START_MS);
    let tracker = ReferralTracker::new(
        settings,
        Some(source.clone() as Arc<dyn EventSource>),
        Box::new(cache.clone()),
        Arc::new(clock.clone()),
    );
    Harness {
        source,
        clock,
        cache,
        tracker,
    }
}

fn harness(head: u64) -> Harness {
    harness_with(head, TrackerSettings::new(TOKEN, PAYOUT), SharedCache::default())
}

fn transfer(from: Address, to: Address, block: u64, tag: u64) -> TransferEvent {
    let mut hash = [0u8; 32];
    hash[24..].copy_from_slice(&tag.to_be_bytes());
    TransferEvent {
        from,
        to,
        value: U256::from(1_000_000u64),
        block_number: block,
        id: Some(EventId {
            tx_hash: B256::from(hash),
            log_index: 0,
        }),
    }
}

fn payout(to: Address, block: u64, tag: u64) -> TransferEvent {
    transfer(PAYOUT, to, block, tag)
}

impl Harness {
    fn track_and_backfill(&mut self, account: Address) {
        let job = self
            .tracker
            .track(account)
            .unwrap()
            .into_backfill()
            .expect("new subscription");
        assert!(self.tracker.backfill_now(job));
    }

    fn settle(&mut self) {
        self.tracker.drain_inbox();
        self.clock.advance(self.tracker.settings().debounce_ms);
        self.tracker.poll_timers();
    }
}

#[test]
fn backfill_then_live_payout() {
    let mut h = harness(200_000);
    h.source.push_history(payout(ALICE, 50_000, 1));
    h.source.push_history(payout(ALICE, 120_000, 2));
    h.source.push_history(payout(ALICE, 150_000, 3));
    h.source.push_history(payout(ALICE, 199_999, 4));
    h.source.push_history(payout(BOB, 180_000, 5));

    h.track_and_backfill(ALICE);
    assert_eq!(h.tracker.count().value, 3);
    assert_eq!(h.tracker.count().source, CountSource::Confirmed);
    assert_eq!(h.cache.entry(&ALICE), Some(CacheEntry::new(3, START_MS)));

    h.source.emit(payout(ALICE, 200_001, 6));
    h.tracker.drain_inbox();
    assert_eq!(h.tracker.count().value, 3);
    assert_eq!(h.tracker.pending_increment(), 1);

    h.clock.advance(499);
    assert!(!h.tracker.poll_timers());
    h.clock.advance(1);
    assert!(h.tracker.poll_timers());
    assert_eq!(h.tracker.count().value, 4);
    assert_eq!(h.cache.entry(&ALICE), Some(CacheEntry::new(4, START_MS + 500)));
}

#[test]
fn primary_range_failure_falls_back_silently() {
    let mut h = harness(1_000_000);
    h.source.push_history(payout(ALICE, 950_000, 1));
    h.source.push_history(payout(ALICE, 995_000, 2));
    h.source.push_history(payout(ALICE, 999_999, 3));
    h.source.reject_ranges_wider_than(Some(50_000));

    let outcome = h.tracker.track(ALICE).expect("no error surfaced");
    let job = outcome.into_backfill().unwrap();
    assert!(h.tracker.backfill_now(job));
    assert_eq!(h.tracker.count().value, 2);
    assert_eq!(h.tracker.count().source, CountSource::Confirmed);
}

#[test]
fn final_count_is_history_plus_distinct_live_events() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..20u64 {
        let mut h = harness(100_000);
        let history = rng.gen_range(0..15u64);
        for i in 0..history {
            h.source
                .push_history(payout(ALICE, 1 + rng.gen_range(0..99_000), round * 1_000 + i));
        }
        h.track_and_backfill(ALICE);
        assert_eq!(h.tracker.count().value, history);

        let live = rng.gen_range(0..25u64);
        for i in 0..live {
            let event = payout(ALICE, 100_001 + i, round * 1_000 + 500 + i);
            h.source.emit(event.clone());
            if rng.gen_bool(0.3) {
                // provider redelivers the same log
                h.source.broadcast(event);
            }
            h.tracker.drain_inbox();
            h.clock.advance(rng.gen_range(0..1_200));
            h.tracker.poll_timers();
        }
        h.settle();
        assert_eq!(h.tracker.count().value, history + live, "round {round}");
        assert_eq!(h.tracker.pending_increment(), 0);
    }
}

#[test]
fn switching_accounts_replaces_the_subscription() {
    let mut h = harness(10_000);
    h.source.push_history(payout(ALICE, 100, 1));
    h.source.push_history(payout(BOB, 200, 2));
    h.source.push_history(payout(BOB, 300, 3));

    let alice = h.tracker.track(ALICE).unwrap();
    let alice_handle = alice.handle().unwrap();
    assert!(h.tracker.backfill_now(alice.into_backfill().unwrap()));
    assert_eq!(h.tracker.count().value, 1);

    let bob = h.tracker.track(BOB).unwrap();
    let bob_handle = bob.handle().unwrap();
    assert_ne!(alice_handle, bob_handle);
    assert_eq!(h.source.unsubscribe_calls(), 1);
    assert_eq!(h.source.subscribe_calls(), 2);
    assert_eq!(h.source.active_subscriptions(), 1);
    assert_eq!(h.tracker.bound_account(), Some(BOB));
    assert_eq!(h.tracker.count().value, 0);

    assert!(h.tracker.backfill_now(bob.into_backfill().unwrap()));
    assert_eq!(h.tracker.count().value, 2);

    h.source.emit(payout(ALICE, 10_001, 4));
    h.settle();
    assert_eq!(h.tracker.count().value, 2);

    assert!(!h.tracker.teardown(alice_handle));
    assert!(h.tracker.is_tracking());
    assert_eq!(h.source.unsubscribe_calls(), 1);
}

#[test]
fn tracking_the_same_account_twice_is_idempotent() {
    let mut h = harness(1_000);
    let first = h.tracker.track(ALICE).unwrap();
    let second = h.tracker.track(ALICE).unwrap();
    assert!(matches!(second, TrackOutcome::AlreadyTracking(_)));
    assert_eq!(first.handle(), second.handle());
    assert_eq!(h.source.subscribe_calls(), 1);
    assert!(second.into_backfill().is_none());
}

#[test]
fn non_matching_events_never_count() {
    let mut h = harness(1_000);
    h.track_and_backfill(ALICE);

    h.source.broadcast(transfer(ALICE, ALICE, 1_001, 1));
    h.source.broadcast(transfer(BOB, ALICE, 1_002, 2));
    h.source.broadcast(payout(BOB, 1_003, 3));
    h.settle();
    assert_eq!(h.tracker.count().value, 0);
    assert_eq!(h.tracker.pending_increment(), 0);
}

#[test]
fn fresh_cache_paints_provisional_count() {
    let cache = SharedCache::default();
    cache
        .clone()
        .set(&ALICE, CacheEntry::new(9, START_MS - 299_999));
    let mut h = harness_with(1_000, TrackerSettings::new(TOKEN, PAYOUT), cache);
    h.source.push_history(payout(ALICE, 10, 1));

    let job = h.tracker.track(ALICE).unwrap().into_backfill().unwrap();
    assert_eq!(h.tracker.count().value, 9);
    assert_eq!(h.tracker.count().source, CountSource::Provisional);

    assert!(h.tracker.backfill_now(job));
    assert_eq!(h.tracker.count().value, 1);
    assert_eq!(h.tracker.count().source, CountSource::Confirmed);
}

#[test]
fn expired_cache_is_ignored() {
    let cache = SharedCache::default();
    cache
        .clone()
        .set(&ALICE, CacheEntry::new(9, START_MS - 300_000));
    let mut h = harness_with(1_000, TrackerSettings::new(TOKEN, PAYOUT), cache);

    h.tracker.track(ALICE).unwrap();
    assert_eq!(h.tracker.count().value, 0);
    assert_eq!(h.tracker.count().source, CountSource::Empty);
}

#[test]
fn reset_then_retrack_repaints_from_cache() {
    let mut h = harness(1_000);
    for tag in 0..3 {
        h.source.push_history(payout(ALICE, 10 + tag, tag));
    }
    h.track_and_backfill(ALICE);
    assert_eq!(h.tracker.count().value, 3);

    h.tracker.reset();
    assert_eq!(h.tracker.count().value, 0);
    assert!(!h.tracker.is_tracking());
    assert_eq!(h.source.active_subscriptions(), 0);

    h.clock.advance(60_000);
    h.tracker.track(ALICE).unwrap();
    assert_eq!(h.tracker.count().value, 3);
    assert_eq!(h.tracker.count().source, CountSource::Provisional);
}

#[test]
fn stale_backfill_results_are_discarded() {
    let mut h = harness(1_000);
    h.source.push_history(payout(ALICE, 10, 1));
    h.source.push_history(payout(ALICE, 11, 2));
    h.source.push_history(payout(BOB, 12, 3));

    let alice_job = h.tracker.track(ALICE).unwrap().into_backfill().unwrap();
    let bob_job = h.tracker.track(BOB).unwrap().into_backfill().unwrap();

    let late = alice_job.execute(h.source.as_ref(), &h.clock);
    assert!(!h.tracker.complete_backfill(late));
    assert_eq!(h.tracker.count().value, 0);

    h.tracker
        .spawn_backfill(bob_job)
        .expect("source configured")
        .join()
        .unwrap();
    assert_eq!(h.tracker.drain_inbox(), 1);
    assert_eq!(h.tracker.count().value, 1);
    assert_eq!(h.tracker.bound_account(), Some(BOB));
}

#[test]
fn live_events_during_backfill_are_merged_without_double_counting() {
    let mut h = harness(1_000);
    let x = payout(ALICE, 900, 1);
    let y = payout(ALICE, 950, 2);
    h.source.push_history(x.clone());
    h.source.push_history(y);

    let job = h.tracker.track(ALICE).unwrap().into_backfill().unwrap();

    // x shows up live while the scan is still running, plus a genuinely new z
    h.source.broadcast(x);
    h.source.emit(payout(ALICE, 1_001, 3));
    h.settle();
    assert_eq!(h.tracker.count().value, 2);

    // w is still pending when the scan, which already saw it, lands
    let w = payout(ALICE, 1_002, 4);
    h.source.emit(w);
    h.tracker.drain_inbox();
    assert_eq!(h.tracker.pending_increment(), 1);

    assert!(h.tracker.backfill_now(job));
    assert_eq!(h.tracker.count().value, 4);
    assert_eq!(h.tracker.pending_increment(), 0);

    h.settle();
    assert_eq!(h.tracker.count().value, 4);
}

#[test]
fn subscription_failure_leaves_tracker_idle() {
    let mut h = harness(1_000);
    h.tracker.track(ALICE).unwrap();

    h.source.fail_subscriptions(Some("provider threw"));
    match h.tracker.track(BOB) {
        Err(TrackerError::SubscriptionSetup(_)) => {}
        other => panic!("expected setup failure, got {other:?}"),
    }
    assert!(!h.tracker.is_tracking());
    assert_eq!(h.tracker.bound_account(), None);
    assert_eq!(h.source.unsubscribe_calls(), 1);
    assert_eq!(h.source.active_subscriptions(), 0);

    h.source.fail_subscriptions(None);
    assert!(matches!(
        h.tracker.track(BOB).unwrap(),
        TrackOutcome::Started { .. }
    ));
}

#[test]
fn missing_provider_is_a_no_op() {
    let mut tracker = ReferralTracker::new(
        TrackerSettings::new(TOKEN, PAYOUT),
        None,
        Box::new(MemoryCache::new()),
        Arc::new(ManualClock::new(START_MS)),
    );
    let outcome = tracker.track(ALICE).unwrap();
    assert!(matches!(outcome, TrackOutcome::NoProvider));
    assert_eq!(outcome.handle(), None);
    assert!(!tracker.is_tracking());
}

#[test]
fn exhausted_backfill_follows_policy() {
    for (policy, expected) in [(ExhaustionPolicy::KeepLastKnown, 5), (ExhaustionPolicy::Zero, 0)] {
        let cache = SharedCache::default();
        cache.clone().set(&ALICE, CacheEntry::new(5, START_MS));
        let mut settings = TrackerSettings::new(TOKEN, PAYOUT);
        settings.exhaustion = policy;
        let mut h = harness_with(50_000, settings, cache);
        h.source.fail_next_queries(100);

        h.track_and_backfill(ALICE);
        assert_eq!(h.tracker.count().value, expected, "{policy:?}");
        assert_eq!(h.tracker.count().source, CountSource::Degraded);
        assert_eq!(h.cache.entry(&ALICE), Some(CacheEntry::new(5, START_MS)));

        h.source.emit(payout(ALICE, 50_001, 1));
        h.settle();
        assert_eq!(h.tracker.count().value, expected + 1);
    }
}

#[test]
fn teardown_is_idempotent_and_drops_pending_increments() {
    let mut h = harness(1_000);
    let outcome = h.tracker.track(ALICE).unwrap();
    let handle = outcome.handle().unwrap();
    h.tracker.backfill_now(outcome.into_backfill().unwrap());

    h.source.emit(payout(ALICE, 1_001, 1));
    h.tracker.drain_inbox();
    assert_eq!(h.tracker.pending_increment(), 1);

    assert!(h.tracker.teardown(handle));
    assert!(!h.tracker.teardown(handle));
    h.tracker.reset();
    assert_eq!(h.source.unsubscribe_calls(), 1);

    h.clock.advance(1_000);
    assert!(!h.tracker.poll_timers());
    assert_eq!(h.tracker.count().value, 0);
}

#[test]
fn custom_plan_is_used_for_backfill() {
    let mut settings = TrackerSettings::new(TOKEN, PAYOUT);
    settings.plan = BackfillPlan {
        attempts: vec![referral_tracker::RangeStrategy::Window { blocks: 100 }],
        ..BackfillPlan::default()
    };
    let mut h = harness_with(1_000, settings, SharedCache::default());
    h.source.push_history(payout(ALICE, 850, 1));
    h.source.push_history(payout(ALICE, 950, 2));

    h.track_and_backfill(ALICE);
    assert_eq!(h.tracker.count().value, 1);
    assert_eq!(h.source.queries(), vec![(900, 1_000)]);
}

#[test]
fn queued_events_for_the_previous_account_are_dropped_after_a_switch() {
    let mut h = harness(10_000);
    h.source.push_history(payout(BOB, 200, 1));
    h.track_and_backfill(ALICE);

    // delivered to alice's subscription but still sitting in the inbox
    h.source.emit(payout(ALICE, 10_001, 2));
    h.source.emit(payout(ALICE, 10_002, 3));

    h.track_and_backfill(BOB);
    h.settle();
    assert_eq!(h.tracker.bound_account(), Some(BOB));
    assert_eq!(h.tracker.count().value, 1);
    assert_eq!(h.tracker.pending_increment(), 0);
    assert_eq!(h.cache.entry(&BOB), Some(CacheEntry::new(1, START_MS)));
}

#[test]
fn partial_stepped_scan_never_lowers_the_count() {
    let cache = SharedCache::default();
    cache.clone().set(&ALICE, CacheEntry::new(4, START_MS));
    let mut h = harness_with(30_000, TrackerSettings::new(TOKEN, PAYOUT), cache);
    // only the 2k-block chunks get through, and three of them fail
    h.source.reject_ranges_wider_than(Some(2_000));
    for block in [12_500, 20_500, 26_000] {
        h.source.poison_block(block);
    }
    h.source.push_history(payout(ALICE, 11_000, 1));
    h.source.push_history(payout(ALICE, 12_400, 2));
    h.source.push_history(payout(ALICE, 25_000, 3));

    let job = h.tracker.track(ALICE).unwrap().into_backfill().unwrap();
    assert_eq!(h.tracker.count().value, 4);
    assert_eq!(h.tracker.count().source, CountSource::Provisional);

    h.clock.advance(1_000);
    assert!(h.tracker.backfill_now(job));
    assert_eq!(h.tracker.count().value, 4);
    assert_eq!(h.tracker.count().source, CountSource::Degraded);
    assert_eq!(h.cache.entry(&ALICE), Some(CacheEntry::new(4, START_MS)));

    // live payouts still count on top of the kept value
    h.source.emit(payout(ALICE, 30_001, 4));
    h.settle();
    assert_eq!(h.tracker.count().value, 5);
}
