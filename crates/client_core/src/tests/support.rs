use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use shared::{
    domain::{
        Channel, ChannelConfig, Cid, ConnectionId, Message, MessageId, Reaction, SyncState,
        SyncStatus, User, UserId, CAPABILITY_READ_EVENTS,
    },
    error::ChatError,
    event::ChatEvent,
};
use storage::{BatchWrite, Deletion, Repository, Storage};

use crate::{
    config::HandlerConfig,
    event_source::LocalEventSource,
    global_state::GlobalState,
    handler::SequentialEventHandler,
    registry::LogicRegistry,
    sync_manager::{ChatApi, SyncManager},
};

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).single().expect("time") + ChronoDuration::seconds(seconds)
}

pub(crate) fn cid(raw: &str) -> Cid {
    raw.parse().expect("cid")
}

/// Polls `check` until it holds, failing the test after two seconds.
pub(crate) async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub(crate) async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

pub(crate) fn readable_channel(raw: &str) -> Channel {
    let mut channel = Channel::new(cid(raw));
    channel
        .own_capabilities
        .insert(CAPABILITY_READ_EVENTS.to_string());
    channel
}

pub(crate) fn message(id: &str, author: &str, seconds: i64) -> Message {
    Message::new(id, User::new(author), format!("text {id}"), at(seconds))
}

pub(crate) fn message_new(raw_cid: &str, message: Message, seconds: i64) -> ChatEvent {
    ChatEvent::MessageNew {
        created_at: at(seconds),
        cid: cid(raw_cid),
        user: message.user.clone(),
        message,
        total_unread_count: 0,
        unread_channels: 0,
        watcher_count: 0,
    }
}

pub(crate) fn reaction_new(
    raw_cid: &str,
    message: Message,
    reaction: Reaction,
    seconds: i64,
) -> ChatEvent {
    ChatEvent::ReactionNew {
        created_at: at(seconds),
        cid: cid(raw_cid),
        user: User::new(reaction.user_id.as_str()),
        message,
        reaction,
    }
}

pub(crate) fn connected(me: User, seconds: i64) -> ChatEvent {
    ChatEvent::Connected {
        created_at: at(seconds),
        me,
        connection_id: ConnectionId::from("connection"),
    }
}

pub(crate) fn typing(raw_cid: &str, user: &str, seconds: i64) -> ChatEvent {
    ChatEvent::TypingStart {
        created_at: at(seconds),
        cid: cid(raw_cid),
        user: User::new(user),
    }
}

/// Scripted backend: queued history responses, a fixed mutation outcome and
/// optional latency.
#[derive(Default)]
pub(crate) struct FakeChatApi {
    pub history: Mutex<VecDeque<Result<Vec<ChatEvent>, ChatError>>>,
    pub history_requests: Mutex<Vec<(Vec<Cid>, DateTime<Utc>)>>,
    pub mutation_error: Mutex<Option<ChatError>>,
    pub sent_messages: Mutex<Vec<MessageId>>,
    pub sent_reactions: Mutex<Vec<(MessageId, String)>>,
    pub mutation_delay: Mutex<Option<Duration>>,
    pub history_delay: Mutex<Option<Duration>>,
}

impl FakeChatApi {
    pub fn push_history(&self, response: Result<Vec<ChatEvent>, ChatError>) {
        self.history.lock().expect("history").push_back(response);
    }

    async fn mutation<T>(&self, value: T) -> Result<T, ChatError> {
        let delay = *self.mutation_delay.lock().expect("delay");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.mutation_error.lock().expect("error").clone() {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn get_sync_history(
        &self,
        cids: &[Cid],
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        self.history_requests
            .lock()
            .expect("requests")
            .push((cids.to_vec(), since));
        let delay = *self.history_delay.lock().expect("delay");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.history
            .lock()
            .expect("history")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_message(&self, message: &Message) -> Result<Message, ChatError> {
        let result = self.mutation(message.clone()).await;
        if result.is_ok() {
            self.sent_messages
                .lock()
                .expect("sent")
                .push(message.id.clone());
        }
        result
    }

    async fn delete_message(&self, message: &Message) -> Result<Message, ChatError> {
        self.mutation(message.clone()).await
    }

    async fn send_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError> {
        let result = self.mutation(reaction.clone()).await;
        if result.is_ok() {
            self.sent_reactions
                .lock()
                .expect("sent")
                .push((reaction.message_id.clone(), reaction.reaction_type.clone()));
        }
        result
    }

    async fn delete_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError> {
        self.mutation(reaction.clone()).await
    }
}

/// Delegates to [`Storage`], recording write calls and optionally failing
/// batch writes.
pub(crate) struct RecordingRepository {
    pub inner: Storage,
    pub calls: Mutex<Vec<String>>,
    pub fail_batch_writes: AtomicBool,
}

impl RecordingRepository {
    pub fn new(inner: Storage) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_batch_writes: AtomicBool::new(false),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls").push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl Repository for RecordingRepository {
    async fn select_all_cids(&self) -> Result<Vec<Cid>> {
        self.inner.select_all_cids().await
    }

    async fn select_channels(&self, cids: &[Cid]) -> Result<Vec<Channel>> {
        self.inner.select_channels(cids).await
    }

    async fn select_channel_messages(&self, cid: &Cid) -> Result<Vec<Message>> {
        self.inner.select_channel_messages(cid).await
    }

    async fn select_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>> {
        self.inner.select_messages(ids).await
    }

    async fn select_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        self.inner.select_users(ids).await
    }

    async fn select_current_user(&self) -> Result<Option<User>> {
        self.inner.select_current_user().await
    }

    async fn insert_current_user(&self, user: &User) -> Result<()> {
        self.record(format!("insert_current_user:{}", user.id));
        self.inner.insert_current_user(user).await
    }

    async fn write_batch(&self, batch: &BatchWrite) -> Result<()> {
        self.record(format!(
            "write_batch:{}u/{}c/{}m",
            batch.users.len(),
            batch.channels.len(),
            batch.messages.len()
        ));
        if self.fail_batch_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.write_batch(batch).await
    }

    async fn apply_deletions(&self, deletions: &[Deletion]) -> Result<()> {
        if !deletions.is_empty() {
            self.record(format!("apply_deletions:{}", deletions.len()));
        }
        self.inner.apply_deletions(deletions).await
    }

    async fn cache_channel_configs(&self) -> Result<()> {
        self.record("cache_channel_configs");
        self.inner.cache_channel_configs().await
    }

    async fn select_channel_config(&self, channel_type: &str) -> Result<Option<ChannelConfig>> {
        self.inner.select_channel_config(channel_type).await
    }

    async fn insert_channel_configs(&self, configs: &[ChannelConfig]) -> Result<()> {
        self.inner.insert_channel_configs(configs).await
    }

    async fn select_sync_state(&self, user_id: &UserId) -> Result<Option<SyncState>> {
        self.inner.select_sync_state(user_id).await
    }

    async fn insert_sync_state(&self, state: &SyncState) -> Result<()> {
        self.record("insert_sync_state");
        self.inner.insert_sync_state(state).await
    }

    async fn select_messages_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Message>> {
        self.inner.select_messages_by_sync_status(status).await
    }

    async fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
        self.inner.select_reactions_by_sync_status(status).await
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.inner.insert_reaction(reaction).await
    }
}

pub(crate) struct Harness {
    pub handler: SequentialEventHandler,
    pub source: LocalEventSource,
    pub repository: Arc<RecordingRepository>,
    pub api: Arc<FakeChatApi>,
    pub global_state: Arc<GlobalState>,
    pub registry: Arc<LogicRegistry>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(HandlerConfig {
            batch_window: Duration::from_millis(10),
            ..HandlerConfig::default()
        })
        .await
    }

    pub async fn with_config(config: HandlerConfig) -> Self {
        let source = LocalEventSource::new();
        let repository = Arc::new(RecordingRepository::new(memory_storage().await));
        let api = Arc::new(FakeChatApi::default());
        let global_state = Arc::new(GlobalState::new());
        let registry = Arc::new(LogicRegistry::new(Arc::clone(&global_state)));
        let sync_manager = Arc::new(SyncManager::new(
            Arc::clone(&repository) as Arc<dyn Repository>,
            Arc::clone(&api) as Arc<dyn ChatApi>,
        ));
        let handler = SequentialEventHandler::new(
            config,
            Arc::new(source.clone()),
            Arc::clone(&registry),
            Arc::clone(&global_state),
            Arc::clone(&repository) as Arc<dyn Repository>,
            sync_manager,
        );
        Self {
            handler,
            source,
            repository,
            api,
            global_state,
            registry,
        }
    }

    /// Handler configured for `user_id` without a listening session.
    pub async fn for_user(user_id: &str) -> Self {
        let mut harness = Self::new().await;
        harness.handler = harness.handler.with_current_user(UserId::from(user_id));
        harness.global_state.set_user(User::new(user_id));
        harness
    }

    pub async fn store_channel(&self, channel: Channel) {
        self.repository
            .inner
            .write_batch(&BatchWrite {
                channels: vec![channel],
                ..BatchWrite::default()
            })
            .await
            .expect("store channel");
    }
}
