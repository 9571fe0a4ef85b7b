use std::{sync::Arc, time::Duration};

use shared::event::{sort_by_created_at, ChatEvent};
use tokio::{sync::Mutex, task::JoinHandle};
use uuid::Uuid;

/// A causally sorted group of events reconciled as one unit.
#[derive(Debug, Clone)]
pub struct BatchEvent {
    pub id: Uuid,
    pub sorted_events: Vec<ChatEvent>,
    pub is_from_history_sync: bool,
}

impl BatchEvent {
    /// Sorts `events` by `created_at`, keeping arrival order on ties.
    pub fn new(mut events: Vec<ChatEvent>, is_from_history_sync: bool) -> Self {
        sort_by_created_at(&mut events);
        Self {
            id: Uuid::new_v4(),
            sorted_events: events,
            is_from_history_sync,
        }
    }

    pub fn is_from_socket_connection(&self) -> bool {
        !self.is_from_history_sync
    }

    pub fn len(&self) -> usize {
        self.sorted_events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_events.is_empty()
    }

    pub fn event_types(&self) -> String {
        self.sorted_events
            .iter()
            .map(ChatEvent::event_type)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub type BatchSink = Arc<dyn Fn(BatchEvent) + Send + Sync>;

#[derive(Default)]
struct PendingBatch {
    events: Vec<ChatEvent>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl PendingBatch {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }

    fn emit(&mut self, sink: &BatchSink) {
        if self.events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.events);
        sink(BatchEvent::new(events, false));
    }
}

/// Folds bursts of socket events into one batch. The batch closes when no
/// event arrives for `window`, when it reaches `size_limit` events, or when
/// the owner fires it explicitly.
pub struct SocketEventCollector {
    window: Duration,
    size_limit: usize,
    sink: BatchSink,
    pending: Arc<Mutex<PendingBatch>>,
}

impl SocketEventCollector {
    pub fn new(window: Duration, size_limit: usize, sink: BatchSink) -> Self {
        Self {
            window,
            size_limit: size_limit.max(1),
            sink,
            pending: Arc::new(Mutex::new(PendingBatch::default())),
        }
    }

    /// Returns false when `event` cannot join the open batch; the caller must
    /// then fire the pending batch before handling `event` on its own.
    pub async fn add(&self, event: ChatEvent) -> bool {
        if event.is_connection_lifecycle() {
            return false;
        }
        let mut pending = self.pending.lock().await;
        if pending.events.len() >= self.size_limit {
            return false;
        }
        pending.events.push(event);
        pending.stop_timer();

        let generation = pending.generation;
        let state = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);
        let window = self.window;
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut pending = state.lock().await;
            if pending.generation != generation {
                return;
            }
            pending.timer = None;
            pending.emit(&sink);
        }));
        true
    }

    pub async fn fire_batch_event(&self) {
        let mut pending = self.pending.lock().await;
        pending.stop_timer();
        pending.emit(&self.sink);
    }

    /// Drops whatever is pending without emitting it.
    pub async fn cancel(&self) {
        let mut pending = self.pending.lock().await;
        pending.stop_timer();
        pending.events.clear();
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.events.len()
    }
}

#[cfg(test)]
#[path = "tests/batch_tests.rs"]
mod tests;
