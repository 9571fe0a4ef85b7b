use std::sync::Mutex as StdMutex;

use shared::domain::User;

use super::*;
use crate::test_support::{at, connected, message, message_new, typing};

const WINDOW: Duration = Duration::from_millis(100);

fn recording_sink() -> (BatchSink, Arc<StdMutex<Vec<BatchEvent>>>) {
    let emitted = Arc::new(StdMutex::new(Vec::new()));
    let target = Arc::clone(&emitted);
    let sink: BatchSink = Arc::new(move |batch| {
        target.lock().expect("emitted").push(batch);
    });
    (sink, emitted)
}

fn created_at_seconds(batch: &BatchEvent) -> Vec<i64> {
    batch
        .sorted_events
        .iter()
        .map(|event| (event.created_at() - at(0)).num_seconds())
        .collect()
}

#[test]
fn new_batch_sorts_stably_and_resorting_changes_nothing() {
    let events = vec![
        typing("messaging:1", "a", 5),
        typing("messaging:1", "b", 1),
        typing("messaging:1", "c", 5),
        typing("messaging:1", "d", 3),
    ];
    let batch = BatchEvent::new(events, true);
    assert_eq!(created_at_seconds(&batch), vec![1, 3, 5, 5]);
    let users: Vec<_> = batch
        .sorted_events
        .iter()
        .filter_map(|event| event.user().map(|user| user.id.to_string()))
        .collect();
    assert_eq!(users, vec!["b", "d", "a", "c"]);

    let resorted = BatchEvent::new(batch.sorted_events.clone(), true);
    assert_eq!(resorted.sorted_events, batch.sorted_events);
    assert!(!batch.is_from_socket_connection());
    assert_eq!(batch.len(), 4);
}

#[test]
fn event_types_lists_every_event_in_order() {
    let batch = BatchEvent::new(
        vec![
            message_new("messaging:1", message("m1", "bob", 2), 2),
            typing("messaging:1", "bob", 1),
        ],
        false,
    );
    assert_eq!(batch.event_types(), "typing.start, message.new");
}

#[tokio::test(start_paused = true)]
async fn quiet_window_emits_one_sorted_socket_batch() {
    let (sink, emitted) = recording_sink();
    let collector = SocketEventCollector::new(WINDOW, 10, sink);

    assert!(collector.add(typing("messaging:1", "a", 5)).await);
    assert!(collector.add(typing("messaging:1", "b", 1)).await);
    assert_eq!(collector.pending_len().await, 2);

    tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;

    let emitted = emitted.lock().expect("emitted");
    assert_eq!(emitted.len(), 1);
    assert!(emitted[0].is_from_socket_connection());
    assert_eq!(created_at_seconds(&emitted[0]), vec![1, 5]);
    drop(emitted);
    assert_eq!(collector.pending_len().await, 0);
}

#[tokio::test(start_paused = true)]
async fn each_event_restarts_the_window() {
    let (sink, emitted) = recording_sink();
    let collector = SocketEventCollector::new(WINDOW, 10, sink);

    collector.add(typing("messaging:1", "a", 1)).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    collector.add(typing("messaging:1", "b", 2)).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(emitted.lock().expect("emitted").is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let emitted = emitted.lock().expect("emitted");
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].len(), 2);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_events_are_never_collected() {
    let (sink, emitted) = recording_sink();
    let collector = SocketEventCollector::new(WINDOW, 10, sink);

    assert!(!collector.add(connected(User::new("jc"), 1)).await);
    assert!(
        !collector
            .add(ChatEvent::Disconnected { created_at: at(2) })
            .await
    );
    assert_eq!(collector.pending_len().await, 0);

    tokio::time::sleep(WINDOW * 2).await;
    assert!(emitted.lock().expect("emitted").is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_batch_rejects_until_fired() {
    let (sink, emitted) = recording_sink();
    let collector = SocketEventCollector::new(WINDOW, 2, sink);

    assert!(collector.add(typing("messaging:1", "a", 1)).await);
    assert!(collector.add(typing("messaging:1", "b", 2)).await);
    assert!(!collector.add(typing("messaging:1", "c", 3)).await);

    collector.fire_batch_event().await;
    assert_eq!(emitted.lock().expect("emitted").len(), 1);
    assert!(collector.add(typing("messaging:1", "c", 3)).await);

    collector.fire_batch_event().await;
    tokio::time::sleep(WINDOW * 2).await;
    let emitted = emitted.lock().expect("emitted");
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[1].len(), 1);
}

#[tokio::test(start_paused = true)]
async fn firing_an_empty_collector_emits_nothing() {
    let (sink, emitted) = recording_sink();
    let collector = SocketEventCollector::new(WINDOW, 0, sink);
    collector.fire_batch_event().await;
    assert!(emitted.lock().expect("emitted").is_empty());

    // a zero limit still admits one event per batch
    assert!(collector.add(typing("messaging:1", "a", 1)).await);
    assert!(!collector.add(typing("messaging:1", "b", 2)).await);
}

#[tokio::test(start_paused = true)]
async fn cancel_drops_pending_events() {
    let (sink, emitted) = recording_sink();
    let collector = SocketEventCollector::new(WINDOW, 10, sink);

    collector.add(typing("messaging:1", "a", 1)).await;
    collector.cancel().await;
    tokio::time::sleep(WINDOW * 2).await;

    assert!(emitted.lock().expect("emitted").is_empty());
    assert_eq!(collector.pending_len().await, 0);
}
