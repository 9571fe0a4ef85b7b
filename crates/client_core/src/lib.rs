//! Client-side chat state synchronization: batches realtime events,
//! reconciles them with offline storage and fans them out to channel and
//! query views, one batch at a time.

pub mod batch;
pub mod channel;
pub mod config;
pub mod error;
pub mod event_source;
pub mod global_state;
pub mod handler;
pub mod offline;
pub mod query;
pub mod registry;
pub mod sync_manager;

pub use batch::{BatchEvent, SocketEventCollector};
pub use channel::{ChannelLogic, ChannelSnapshot, ChannelState};
pub use config::{load_settings, HandlerConfig, SyncSettings};
pub use error::HandlerError;
pub use event_source::{Disposable, EventSource, LocalEventSource};
pub use global_state::{GlobalState, SelfUser, SessionState};
pub use handler::{EventHandler, Phase, PhaseMark, SequentialEventHandler};
pub use query::{QueryChannelsLogic, QueryChannelsState, QueryFilter};
pub use registry::{LogicRegistry, StateRegistry};
pub use sync_manager::{
    ChatApi, Checkpoints, MissingChatApi, RetryReport, SyncHistory, SyncManager,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
