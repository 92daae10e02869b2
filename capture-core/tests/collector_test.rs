use capture_core::{
    capture_channel, CaptureEvent, NetworkCollector, NetworkRequest, NetworkResponse,
    NetworkTransaction, TransactionStatus,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_stream::StreamExt;

fn pending(id: &str, start: i64) -> NetworkTransaction {
    NetworkTransaction::pending(
        id,
        NetworkRequest::new("GET", format!("https://example.com/{}", id), start),
        start,
    )
}

proptest! {
    /// The window never exceeds its capacity and keeps the newest transactions
    #[test]
    fn prop_window_keeps_newest(
        capacity in 1usize..16,
        starts in prop::collection::vec(0i64..1_000, 0..64),
    ) {
        let collector = NetworkCollector::new(capacity);
        for (i, start) in starts.iter().enumerate() {
            collector.on_transaction_started(pending(&format!("t{:03}", i), *start));
            prop_assert!(collector.len() <= capacity);
        }

        let snapshot = collector.snapshot();
        prop_assert_eq!(snapshot.len(), starts.len().min(capacity));

        // Nothing evicted is newer than anything kept
        let kept: HashSet<&str> = snapshot.iter().map(|t| t.id()).collect();
        let oldest_kept = snapshot.iter().map(|t| t.start_time()).min();
        for (i, start) in starts.iter().enumerate() {
            let id = format!("t{:03}", i);
            if !kept.contains(id.as_str()) {
                prop_assert!(Some(*start) <= oldest_kept);
            }
        }

        // Newest first
        for pair in snapshot.windows(2) {
            prop_assert!(pair[0].start_time() >= pair[1].start_time());
        }
    }
}

#[test]
fn test_every_callback_forwarded_despite_eviction() {
    let (tx, mut rx) = capture_channel();
    let collector = NetworkCollector::new(1).with_event_sender(tx);

    collector.on_transaction_started(pending("a", 1));
    collector.on_transaction_started(pending("b", 2));
    assert!(collector.get("a").is_none());

    collector.on_transaction_completed("a", NetworkResponse::new(204, 3), 3);

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(match event {
            CaptureEvent::Started(tx) => format!("started:{}", tx.id()),
            CaptureEvent::Completed { id, .. } => format!("completed:{}", id),
            other => format!("{:?}", other),
        });
    }
    assert_eq!(seen, vec!["started:a", "started:b", "completed:a"]);
}

#[tokio::test]
async fn test_snapshot_stream_emits_updates() {
    let collector = NetworkCollector::new(10);
    let mut stream = collector.transactions();

    let initial = stream.next().await.unwrap();
    assert!(initial.is_empty());

    collector.on_transaction_started(pending("a", 1));
    let update = stream.next().await.unwrap();
    assert_eq!(update.len(), 1);

    collector.on_transaction_failed("a", "reset", 2);
    let update = stream.next().await.unwrap();
    assert_eq!(update[0].status(), TransactionStatus::Failed);
}

#[tokio::test]
async fn test_concurrent_updates_are_not_lost() {
    let collector = NetworkCollector::new(1_000);
    let mut handles = Vec::new();

    for worker in 0..8 {
        let collector = collector.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                let id = format!("w{}-{}", worker, i);
                collector.on_transaction_started(pending(&id, i));
                collector.on_transaction_completed(&id, NetworkResponse::new(200, i + 1), i + 1);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot: Arc<Vec<Arc<NetworkTransaction>>> = collector.snapshot();
    assert_eq!(snapshot.len(), 400);
    assert!(snapshot
        .iter()
        .all(|t| t.status() == TransactionStatus::Complete));
}
