//! Property-based tests for consumer offset bookkeeping
//!
//! Verifies:
//! 1. `committed <= processed <= delivered` after any sequence of updates
//! 2. Confirming a commit snapshot leaves nothing to commit
//! 3. Delivered offsets never move backwards

use proptest::prelude::*;

use samsa_delivery::prelude::{Error, OffsetTracker, TopicPartition, NO_OFFSET};

#[derive(Clone, Debug)]
enum Op {
    Advance(i32, i64),
    Mark(i32, i64),
    Confirm(i32, i64),
}

// ── Strategies ──────────────────────────────────────────────────────────

fn op_strategy() -> impl Strategy<Value = Op> {
    let partition = 0i32..3;
    let offset = 0i64..50;
    prop_oneof![
        (partition.clone(), offset.clone()).prop_map(|(p, o)| Op::Advance(p, o)),
        (partition.clone(), offset.clone()).prop_map(|(p, o)| Op::Mark(p, o)),
        (partition, offset).prop_map(|(p, o)| Op::Confirm(p, o)),
    ]
}

fn tp(partition: i32) -> TopicPartition {
    ("topic".to_owned(), partition)
}

fn apply(tracker: &mut OffsetTracker, op: &Op) -> Result<(), Error> {
    match op {
        Op::Advance(p, o) => tracker.advance(&tp(*p), *o),
        Op::Mark(p, o) => tracker.mark_processed(&tp(*p), *o),
        Op::Confirm(p, o) => tracker.confirm_commit(&tp(*p), *o),
    }
}

// ── Properties ──────────────────────────────────────────────────────────

proptest! {
    /// Offsets stay ordered no matter how updates interleave
    #[test]
    fn prop_offsets_stay_ordered(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut tracker = OffsetTracker::new();
        for op in &ops {
            let _ = apply(&mut tracker, op);

            for (topic_partition, offsets) in tracker.snapshot() {
                prop_assert!(offsets.committed >= NO_OFFSET);
                prop_assert!(offsets.committed <= offsets.processed,
                    "{:?} committed ahead of processed: {:?}", topic_partition, offsets);
                prop_assert!(offsets.processed <= offsets.delivered,
                    "{:?} processed ahead of delivered: {:?}", topic_partition, offsets);
            }
        }
    }

    /// A confirmed snapshot leaves an empty snapshot behind
    #[test]
    fn prop_second_commit_is_empty(ops in prop::collection::vec(op_strategy(), 1..100)) {
        let mut tracker = OffsetTracker::new();
        for op in &ops {
            let _ = apply(&mut tracker, op);
        }

        for (topic_partition, offset) in tracker.commit_snapshot() {
            prop_assert!(tracker.confirm_commit(&topic_partition, offset).is_ok());
        }
        prop_assert!(tracker.commit_snapshot().is_empty());
    }

    /// Delivered offsets only grow, stale ones are refused
    #[test]
    fn prop_delivered_is_monotonic(offsets in prop::collection::vec(0i64..100, 1..100)) {
        let mut tracker = OffsetTracker::new();
        let mut highest = NO_OFFSET;
        for offset in offsets {
            let result = tracker.advance(&tp(0), offset);
            if offset < highest {
                let is_stale = matches!(result, Err(Error::StaleOffset { .. }));
                prop_assert!(is_stale);
            } else {
                prop_assert!(result.is_ok());
                highest = offset;
            }
            prop_assert_eq!(tracker.get(&tp(0)).unwrap().delivered, highest);
        }
    }
}
