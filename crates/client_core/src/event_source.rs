use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use shared::event::ChatEvent;

pub type EventListener = Arc<dyn Fn(ChatEvent) + Send + Sync>;

/// Handle to a live subscription; disposing stops delivery.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

/// Pushes realtime events to subscribed listeners.
pub trait EventSource: Send + Sync {
    fn subscribe(&self, listener: EventListener) -> Box<dyn Disposable>;
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    listeners: BTreeMap<u64, EventListener>,
}

/// In-process source delivering every emitted event synchronously to each
/// subscriber, in subscription order.
#[derive(Clone, Default)]
pub struct LocalEventSource {
    table: Arc<Mutex<ListenerTable>>,
}

impl LocalEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ChatEvent) {
        let listeners: Vec<EventListener> = match self.table.lock() {
            Ok(table) => table.listeners.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().listeners.values().cloned().collect(),
        };
        for listener in listeners {
            listener(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.table
            .lock()
            .map(|table| table.listeners.len())
            .unwrap_or_default()
    }
}

impl EventSource for LocalEventSource {
    fn subscribe(&self, listener: EventListener) -> Box<dyn Disposable> {
        let mut table = match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = table.next_id;
        table.next_id += 1;
        table.listeners.insert(id, listener);
        Box::new(LocalSubscription {
            id,
            table: Arc::downgrade(&self.table),
            disposed: AtomicBool::new(false),
        })
    }
}

struct LocalSubscription {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
    disposed: AtomicBool,
}

impl Disposable for LocalSubscription {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            let mut table = match table.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            table.listeners.remove(&self.id);
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
