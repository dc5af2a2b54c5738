//! Property tests for timestamp ordering and last-writer-wins merge

use lectern_core::hlc::{self, HybridClock, ManualTimeSource, TimeSource};
use lectern_core::{EntityKind, EntityRow, HlcTimestamp};
use lectern_store::merge::{merge_row, MergeDecision};
use proptest::prelude::*;
use serde_json::json;
use std::cmp::Ordering;
use std::sync::Arc;

fn timestamp() -> impl Strategy<Value = (u64, u32, String)> {
    (0u64..50, 0u32..4, prop::sample::select(vec!["A", "B", "node:with:colons"]))
        .prop_map(|(p, c, n)| (p, c, n.to_string()))
}

/// Valid wire timestamps, the empty sentinel and some garbage.
fn hlc_string() -> impl Strategy<Value = String> {
    prop_oneof![
        6 => timestamp().prop_map(|(p, c, n)| HlcTimestamp::new(p, c, n).to_string()),
        1 => Just(String::new()),
        1 => "[a-z]{1,6}",
    ]
}

fn row(id: &str, hlc: &str, content: &str) -> EntityRow {
    EntityRow {
        kind: EntityKind::Note,
        id: id.into(),
        body: json!({ "content": content }),
        local: json!({}),
        hlc: hlc.into(),
        is_deleted: false,
        updated_at: 0,
    }
}

/// Apply remote versions one after another, as successive pulls would.
fn apply_all(mut local: Option<EntityRow>, remotes: &[EntityRow]) -> Option<EntityRow> {
    for remote in remotes {
        if let (_, Some(written)) = merge_row(local.as_ref(), remote.clone()) {
            local = Some(written);
        }
    }
    local
}

proptest! {
    #[test]
    fn compare_is_a_total_order(a in hlc_string(), b in hlc_string(), c in hlc_string()) {
        prop_assert_eq!(hlc::compare(&a, &b), hlc::compare(&b, &a).reverse());
        prop_assert_eq!(hlc::compare(&a, &a), Ordering::Equal);
        if hlc::compare(&a, &b) != Ordering::Greater && hlc::compare(&b, &c) != Ordering::Greater {
            prop_assert_ne!(hlc::compare(&a, &c), Ordering::Greater);
        }
    }

    #[test]
    fn compare_matches_parsed_ordering(a in timestamp(), b in timestamp()) {
        let ta = HlcTimestamp::new(a.0, a.1, a.2);
        let tb = HlcTimestamp::new(b.0, b.1, b.2);
        prop_assert_eq!(hlc::compare(&ta.to_string(), &tb.to_string()), ta.cmp(&tb));
        prop_assert_eq!(ta.cmp(&tb), (ta.physical_ms, ta.counter, &ta.node_id).cmp(&(tb.physical_ms, tb.counter, &tb.node_id)));
    }

    #[test]
    fn merge_is_idempotent(local in hlc_string(), remote in hlc_string()) {
        let local_row = row("n", &local, "local");
        let remote_row = row("n", &remote, "remote");

        let once = apply_all(Some(local_row.clone()), std::slice::from_ref(&remote_row));
        let twice = apply_all(once.clone(), std::slice::from_ref(&remote_row));
        prop_assert_eq!(&once, &twice);

        let (decision, _) = merge_row(once.as_ref(), remote_row);
        prop_assert_eq!(decision, MergeDecision::KeepLocal);
    }

    #[test]
    fn remote_wins_only_when_strictly_newer(local in hlc_string(), remote in hlc_string()) {
        let local_row = row("n", &local, "local");
        let (decision, written) = merge_row(Some(&local_row), row("n", &remote, "remote"));
        if hlc::compare(&remote, &local) == Ordering::Greater {
            prop_assert_eq!(decision, MergeDecision::Overwrite);
            let written = written.unwrap();
            prop_assert_eq!(written.hlc, remote);
            prop_assert_eq!(written.local, local_row.local);
        } else {
            prop_assert_eq!(decision, MergeDecision::KeepLocal);
            prop_assert!(written.is_none());
        }
    }

    #[test]
    fn arrival_order_does_not_change_the_winner(
        versions in prop::collection::hash_set(timestamp(), 1..8)
            .prop_map(|set| set.into_iter().collect::<Vec<_>>())
            .prop_flat_map(|v| Just(v).prop_shuffle())
    ) {
        let remotes: Vec<EntityRow> = versions
            .iter()
            .map(|(p, c, n)| {
                let ts = HlcTimestamp::new(*p, *c, n.clone()).to_string();
                row("n", &ts, &ts)
            })
            .collect();
        let newest = versions
            .iter()
            .map(|(p, c, n)| HlcTimestamp::new(*p, *c, n.clone()))
            .max()
            .unwrap()
            .to_string();

        let forward = apply_all(None, &remotes).unwrap();
        let mut reversed_input = remotes.clone();
        reversed_input.reverse();
        let backward = apply_all(None, &reversed_input).unwrap();

        prop_assert_eq!(&forward.hlc, &newest);
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn clock_never_goes_backwards(steps in prop::collection::vec(-500i64..500, 1..80)) {
        let time = Arc::new(ManualTimeSource::new(10_000));
        let clock = HybridClock::with_time_source("dev", time.clone()).unwrap();
        let mut last = clock.generate();
        for step in steps {
            let now = (time.now_ms() as i64 + step).max(0) as u64;
            time.set(now);
            let next = clock.generate();
            prop_assert!(next > last, "{} then {}", last, next);
            prop_assert_eq!(hlc::compare(&next.to_string(), &last.to_string()), Ordering::Greater);
            last = next;
        }
    }
}
