//! Property tests for subscription registry invariants.

use std::sync::Arc;

use megatorrent_core::feed::{ContentLocator, FeedKey};
use megatorrent_core::registry::{ApplyResult, SubscriptionRegistry, SubscriptionState};
use megatorrent_core::resolver::{FailureKind, ResolutionOutcome};
use megatorrent_core::scheduler::{DueQueue, QueuePoll};
use proptest::prelude::*;

fn locator_for(sequence: u64) -> ContentLocator {
    ContentLocator::parse(format!("{sequence:040x}").as_bytes()).unwrap()
}

fn failure_kind() -> impl Strategy<Value = FailureKind> {
    prop_oneof![
        Just(FailureKind::NotFound),
        Just(FailureKind::Timeout),
        Just(FailureKind::Malformed),
        Just(FailureKind::Rejected),
        Just(FailureKind::Network),
    ]
}

fn outcome() -> impl Strategy<Value = ResolutionOutcome> {
    prop_oneof![
        (0u64..50).prop_map(|sequence| ResolutionOutcome::Accepted {
            sequence,
            locator: locator_for(sequence),
        }),
        (0u64..50).prop_map(|sequence| ResolutionOutcome::Stale { sequence }),
        failure_kind().prop_map(ResolutionOutcome::Failed),
    ]
}

proptest! {
    #[test]
    fn sequence_never_regresses(outcomes in prop::collection::vec(outcome(), 1..60)) {
        let queue = Arc::new(DueQueue::new());
        let registry = SubscriptionRegistry::new(queue.clone(), 3);
        let key = FeedKey::new([7u8; 32]);
        registry.add(key, "feed").unwrap();

        let QueuePoll::Due(ticket) = queue.poll(tokio::time::Instant::now()) else {
            panic!("new subscription must be due immediately");
        };

        let mut previous = None;
        for outcome in &outcomes {
            let before = registry.snapshot(&key).unwrap();
            let applied = registry.apply_resolution(&ticket, outcome);
            let after = registry.snapshot(&key).unwrap();

            prop_assert!(after.last_sequence >= previous);
            previous = after.last_sequence;

            // Payload only moves together with a strictly higher sequence.
            if after.last_payload != before.last_payload {
                prop_assert!(
                    matches!(applied, ApplyResult::Advanced { .. }),
                    "payload moved without an advance: {:?}",
                    applied
                );
                prop_assert!(after.last_sequence > before.last_sequence);
            }

            if let ResolutionOutcome::Failed(_) = outcome {
                prop_assert_eq!(after.last_sequence, before.last_sequence);
                prop_assert_eq!(&after.last_payload, &before.last_payload);
                prop_assert_eq!(after.consecutive_failures, before.consecutive_failures + 1);
            } else {
                prop_assert_eq!(after.consecutive_failures, 0);
            }

            prop_assert_eq!(
                after.state == SubscriptionState::Pending,
                after.last_payload.is_none()
            );
        }
    }

    #[test]
    fn duplicate_add_never_mutates(label in "[a-z]{1,12}", sequence in 1u64..1000) {
        let queue = Arc::new(DueQueue::new());
        let registry = SubscriptionRegistry::new(queue.clone(), 3);
        let key = FeedKey::new([3u8; 32]);
        registry.add(key, "original").unwrap();

        let QueuePoll::Due(ticket) = queue.poll(tokio::time::Instant::now()) else {
            panic!("new subscription must be due immediately");
        };
        registry.apply_resolution(&ticket, &ResolutionOutcome::Accepted {
            sequence,
            locator: locator_for(sequence),
        });
        let before = registry.snapshot(&key).unwrap();

        prop_assert!(registry.add(key, label).is_err());

        let after = registry.snapshot(&key).unwrap();
        prop_assert_eq!(after.label, before.label);
        prop_assert_eq!(after.last_sequence, before.last_sequence);
        prop_assert_eq!(after.last_payload, before.last_payload);
        prop_assert_eq!(after.state, before.state);
        prop_assert_eq!(registry.len(), 1);
    }
}
