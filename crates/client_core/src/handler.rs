use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock, Weak,
    },
};

use async_trait::async_trait;
use shared::{
    domain::{Cid, User, UserId, CAPABILITY_READ_EVENTS},
    event::ChatEvent,
};
use storage::Repository;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    batch::{BatchEvent, BatchSink, SocketEventCollector},
    config::HandlerConfig,
    error::{ensure_same_user, HandlerError},
    event_source::{Disposable, EventListener, EventSource},
    global_state::{GlobalState, SelfUser, SessionState},
    offline::update_offline_storage,
    registry::{LogicRegistry, StateRegistry},
    sync_manager::{Checkpoints, SyncManager},
};

type BatchResult = Result<(), HandlerError>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn start_listening(&self, current_user: User);
    async fn stop_listening(&self);
    async fn sync_history_for_active_channels(&self) -> BatchResult;
    async fn handle_events(&self, events: Vec<ChatEvent>) -> BatchResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    GlobalState,
    SyncManager,
    OfflineStorage,
    ChannelsState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseMark {
    Enter,
    Exit,
}

/// Called on entry to and exit from every phase of every batch.
pub type PhaseHook = Arc<dyn Fn(Uuid, Phase, PhaseMark) + Send + Sync>;

struct Work {
    batch: BatchEvent,
    /// Committed once the batch has been reconciled.
    checkpoints: Option<Checkpoints>,
    done: oneshot::Sender<BatchResult>,
}

/// The single consumer of batches. Replaced after `stop_listening`.
struct Pipeline {
    sender: mpsc::UnboundedSender<Work>,
    worker: JoinHandle<()>,
}

impl Pipeline {
    fn spawn(inner: Weak<Inner>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Work>();
        let worker = tokio::spawn(async move {
            while let Some(Work {
                batch,
                checkpoints,
                done,
            }) = receiver.recv().await
            {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let result = inner.handle_batch_event(batch, checkpoints).await;
                let _ = done.send(result);
            }
        });
        Self { sender, worker }
    }
}

struct ListeningSession {
    subscription: Box<dyn Disposable>,
    collector: Arc<SocketEventCollector>,
    task: JoinHandle<()>,
}

struct Inner {
    config: HandlerConfig,
    event_source: Arc<dyn EventSource>,
    logic_registry: Arc<LogicRegistry>,
    state_registry: StateRegistry,
    global_state: Arc<GlobalState>,
    repository: Arc<dyn Repository>,
    sync_manager: Arc<SyncManager>,
    current_user_id: RwLock<Option<UserId>>,
    session: Mutex<Option<ListeningSession>>,
    pipeline: Mutex<Option<Pipeline>>,
    dropped_events: Arc<AtomicU64>,
    phase_hook: RwLock<Option<PhaseHook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Processes batches one at a time: batch N+1 does not start before every
/// phase of batch N has finished.
pub struct SequentialEventHandler {
    inner: Arc<Inner>,
}

impl SequentialEventHandler {
    pub fn new(
        config: HandlerConfig,
        event_source: Arc<dyn EventSource>,
        logic_registry: Arc<LogicRegistry>,
        global_state: Arc<GlobalState>,
        repository: Arc<dyn Repository>,
        sync_manager: Arc<SyncManager>,
    ) -> Self {
        let state_registry = StateRegistry::new(Arc::clone(&logic_registry));
        Self {
            inner: Arc::new(Inner {
                config,
                event_source,
                logic_registry,
                state_registry,
                global_state,
                repository,
                sync_manager,
                current_user_id: RwLock::new(None),
                session: Mutex::new(None),
                pipeline: Mutex::new(None),
                dropped_events: Arc::new(AtomicU64::new(0)),
                phase_hook: RwLock::new(None),
            }),
        }
    }

    /// Configures the current user without starting to listen.
    pub fn with_current_user(self, user_id: UserId) -> Self {
        self.inner.set_current_user_id(Some(user_id));
        self
    }

    pub fn set_phase_hook(&self, hook: PhaseHook) {
        if let Ok(mut slot) = self.inner.phase_hook.write() {
            *slot = Some(hook);
        }
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        self.inner.current_user_id().ok()
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// Socket events dropped because the buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped_events.load(Ordering::Relaxed)
    }

    pub fn global_state(&self) -> &Arc<GlobalState> {
        &self.inner.global_state
    }

    pub fn logic_registry(&self) -> &Arc<LogicRegistry> {
        &self.inner.logic_registry
    }

    pub fn state_registry(&self) -> &StateRegistry {
        &self.inner.state_registry
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.inner.sync_manager
    }
}

#[async_trait]
impl EventHandler for SequentialEventHandler {
    async fn start_listening(&self, current_user: User) {
        let inner = &self.inner;
        info!(user_id = %current_user.id, "handler: start listening");
        inner.set_current_user_id(Some(current_user.id.clone()));
        if inner
            .global_state
            .user()
            .map_or(true, |user| user.id != current_user.id)
        {
            inner.global_state.set_user(current_user);
        }

        let mut session = lock(&inner.session);
        if session.is_some() {
            debug!("handler: already listening");
            return;
        }

        let sink: BatchSink = {
            let weak = Arc::downgrade(inner);
            Arc::new(move |batch: BatchEvent| {
                if let Some(inner) = weak.upgrade() {
                    drop(inner.submit(batch));
                }
            })
        };
        let collector = Arc::new(SocketEventCollector::new(
            inner.config.batch_window,
            inner.config.batch_size_limit,
            sink,
        ));

        let (events_tx, events_rx) = mpsc::channel::<ChatEvent>(inner.config.events_buffer);
        let task = tokio::spawn(run_session(
            Arc::downgrade(inner),
            events_rx,
            Arc::clone(&collector),
        ));

        let dropped = Arc::clone(&inner.dropped_events);
        let listener: EventListener = Arc::new(move |event: ChatEvent| {
            let event_type = event.event_type();
            match events_tx.try_send(event) {
                Ok(()) => trace!(event_type, "handler: socket event received"),
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    error!(event_type, "handler: socket event dropped, buffer is full");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(event_type, "handler: socket event after session ended")
                }
            }
        });
        let subscription = inner.event_source.subscribe(listener);

        *session = Some(ListeningSession {
            subscription,
            collector,
            task,
        });
    }

    async fn stop_listening(&self) {
        let inner = &self.inner;
        info!("handler: stop listening");
        let session = lock(&inner.session).take();
        if let Some(session) = session {
            session.subscription.dispose();
            session.task.abort();
            // cancelled tasks report a JoinError
            let _ = session.task.await;
            session.collector.cancel().await;
        }
        if let Some(pipeline) = inner.take_pipeline() {
            pipeline.worker.abort();
            let _ = pipeline.worker.await;
        }
        inner.set_current_user_id(None);
        if let Err(err) = inner.sync_manager.clear_state().await {
            warn!("handler: failed to persist sync state: {err}");
        }
        inner.global_state.clear_state();
        inner.logic_registry.clear().await;
    }

    async fn sync_history_for_active_channels(&self) -> BatchResult {
        let cids = self.inner.logic_registry.active_cids().await;
        debug!(cids = cids.len(), "handler: sync history for active channels");
        match self.inner.sync_history(cids).await? {
            Some(done) => done.await.unwrap_or(Err(HandlerError::Cancelled)),
            None => Ok(()),
        }
    }

    /// Runs `events` through the pipeline as one live batch and waits for it.
    async fn handle_events(&self, events: Vec<ChatEvent>) -> BatchResult {
        if events.is_empty() {
            return Ok(());
        }
        let done = self.inner.submit(BatchEvent::new(events, false));
        done.await.unwrap_or(Err(HandlerError::Cancelled))
    }
}

impl Drop for SequentialEventHandler {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.inner.session).take() {
            session.subscription.dispose();
            session.task.abort();
        }
        if let Some(pipeline) = self.inner.take_pipeline() {
            pipeline.worker.abort();
        }
    }
}

async fn run_session(
    inner: Weak<Inner>,
    mut events: mpsc::Receiver<ChatEvent>,
    collector: Arc<SocketEventCollector>,
) {
    match inner.upgrade() {
        Some(inner) => inner.initialize().await,
        None => return,
    }
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_socket_event(&collector, event).await;
    }
}

impl Inner {
    fn set_current_user_id(&self, user_id: Option<UserId>) {
        match self.current_user_id.write() {
            Ok(mut slot) => *slot = user_id,
            Err(poisoned) => *poisoned.into_inner() = user_id,
        }
    }

    fn current_user_id(&self) -> Result<UserId, HandlerError> {
        let slot = match self.current_user_id.read() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone().ok_or(HandlerError::MissingCurrentUser)
    }

    fn mark(&self, batch_id: Uuid, phase: Phase, mark: PhaseMark) {
        if let Ok(hook) = self.phase_hook.read() {
            if let Some(hook) = hook.as_ref() {
                hook(batch_id, phase, mark);
            }
        }
    }

    /// Queues `batch` behind every batch submitted before it.
    fn submit(self: &Arc<Self>, batch: BatchEvent) -> oneshot::Receiver<BatchResult> {
        self.enqueue(batch, None)
    }

    fn enqueue(
        self: &Arc<Self>,
        batch: BatchEvent,
        checkpoints: Option<Checkpoints>,
    ) -> oneshot::Receiver<BatchResult> {
        let (done, receiver) = oneshot::channel();
        if batch.is_empty() {
            let _ = done.send(Ok(()));
            return receiver;
        }
        let mut pipeline = lock(&self.pipeline);
        if pipeline
            .as_ref()
            .map_or(true, |pipeline| pipeline.sender.is_closed())
        {
            *pipeline = Some(Pipeline::spawn(Arc::downgrade(self)));
        }
        if let Some(pipeline) = pipeline.as_ref() {
            let work = Work {
                batch,
                checkpoints,
                done,
            };
            if pipeline.sender.send(work).is_err() {
                warn!("handler: pipeline closed, batch discarded");
            }
        }
        receiver
    }

    fn take_pipeline(&self) -> Option<Pipeline> {
        lock(&self.pipeline).take()
    }

    async fn initialize(self: &Arc<Self>) {
        let user_id = match self.current_user_id() {
            Ok(user_id) => user_id,
            Err(err) => {
                error!("handler: initialization failed: {err}");
                return;
            }
        };
        debug!(user_id = %user_id, "handler: initializing");
        if let Err(err) = self.sync_manager.load_sync_state_for_user(&user_id).await {
            error!("handler: failed to load sync state: {err}");
            return;
        }
        if let Err(err) = self.repository.cache_channel_configs().await {
            warn!("handler: failed to cache channel configs: {err:#}");
        }

        let mut cids = match self.repository.select_all_cids().await {
            Ok(cids) => cids,
            Err(err) => {
                warn!("handler: failed to read cached channels: {err:#}");
                Vec::new()
            }
        };
        for cid in self.logic_registry.active_cids().await {
            if !cids.contains(&cid) {
                cids.push(cid);
            }
        }

        match self.sync_history(cids).await {
            Ok(Some(done)) => {
                if let Ok(Err(err)) = done.await {
                    warn!("handler: history batch failed: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => error!("handler: history sync failed: {err}"),
        }
        info!("handler: initialization completed");
    }

    /// Fetches missed events for `cids` and queues them as one history
    /// batch whose checkpoints are committed once it is reconciled. Returns
    /// `None` when there was nothing to replay.
    async fn sync_history(
        self: &Arc<Self>,
        cids: Vec<Cid>,
    ) -> Result<Option<oneshot::Receiver<BatchResult>>, HandlerError> {
        if cids.is_empty() {
            debug!("handler: sync history skipped, no cids");
            return Ok(None);
        }
        info!(cids = cids.len(), "handler: sync history");
        let history = self.sync_manager.get_sorted_sync_history(&cids).await?;
        if history.events.is_empty() {
            if !history.checkpoints.is_empty() {
                self.sync_manager
                    .commit_checkpoints(&history.checkpoints)
                    .await?;
            }
            return Ok(None);
        }
        Ok(Some(self.enqueue(
            BatchEvent::new(history.events, true),
            Some(history.checkpoints),
        )))
    }

    async fn handle_socket_event(
        self: &Arc<Self>,
        collector: &SocketEventCollector,
        event: ChatEvent,
    ) {
        trace!(event_type = event.event_type(), "handler: socket event");
        if collector.add(event.clone()).await {
            return;
        }
        collector.fire_batch_event().await;
        drop(self.submit(BatchEvent::new(vec![event], false)));
    }

    async fn handle_batch_event(
        self: &Arc<Self>,
        mut batch: BatchEvent,
        checkpoints: Option<Checkpoints>,
    ) -> BatchResult {
        debug!(
            batch_id = %batch.id,
            from_socket = batch.is_from_socket_connection(),
            size = batch.len(),
            types = %batch.event_types(),
            "handler: >>> batch"
        );
        let mut result = self.process_batch(&mut batch).await;
        if let Some(checkpoints) = checkpoints.filter(|_| result.is_ok()) {
            result = self.sync_manager.commit_checkpoints(&checkpoints).await;
        }
        match &result {
            Ok(()) => trace!(batch_id = %batch.id, "handler: <<< batch"),
            Err(err) => error!(batch_id = %batch.id, "handler: batch failed: {err}"),
        }
        result
    }

    async fn process_batch(self: &Arc<Self>, batch: &mut BatchEvent) -> BatchResult {
        let current_user_id = self.current_user_id()?;
        let from_socket = batch.is_from_socket_connection();

        self.mark(batch.id, Phase::GlobalState, PhaseMark::Enter);
        let global = self.update_global_state(batch, &current_user_id).await;
        self.mark(batch.id, Phase::GlobalState, PhaseMark::Exit);
        global?;

        self.mark(batch.id, Phase::SyncManager, PhaseMark::Enter);
        self.update_sync_manager(batch).await;
        self.mark(batch.id, Phase::SyncManager, PhaseMark::Exit);

        self.mark(batch.id, Phase::OfflineStorage, PhaseMark::Enter);
        let offline = update_offline_storage(
            batch.id,
            &mut batch.sorted_events,
            from_socket,
            self.repository.as_ref(),
            &current_user_id,
        )
        .await;
        self.mark(batch.id, Phase::OfflineStorage, PhaseMark::Exit);
        let deferred = match offline {
            Err(err) if err.is_fatal_to_batch() => return Err(err),
            Err(err) => {
                error!(batch_id = %batch.id, "handler: offline storage update failed: {err}");
                Some(err)
            }
            Ok(()) => None,
        };

        self.mark(batch.id, Phase::ChannelsState, PhaseMark::Enter);
        self.update_channels_state(batch).await;
        self.mark(batch.id, Phase::ChannelsState, PhaseMark::Exit);

        deferred.map_or(Ok(()), Err)
    }

    /// Unread counts are only trusted for channels whose stored copy grants
    /// the read-events capability.
    async fn has_read_events_capability(&self, cid: &Cid) -> bool {
        match self.repository.select_channels(std::slice::from_ref(cid)).await {
            Ok(channels) => {
                let allowed = channels
                    .first()
                    .is_some_and(|channel| channel.has_capability(CAPABILITY_READ_EVENTS));
                if !allowed {
                    debug!(cid = %cid, "handler: skipping unread counts, no read-events capability");
                }
                allowed
            }
            Err(err) => {
                warn!(cid = %cid, "handler: capability lookup failed: {err:#}");
                false
            }
        }
    }

    async fn update_global_state(
        &self,
        batch: &BatchEvent,
        current_user_id: &UserId,
    ) -> BatchResult {
        let from_socket = batch.is_from_socket_connection();
        let global = &self.global_state;
        for event in &batch.sorted_events {
            match event {
                ChatEvent::Connected { me, .. } => {
                    if from_socket {
                        ensure_same_user(&me.id, Some(current_user_id))?;
                        global.update_current_user(SelfUser::Full(me.clone()));
                        global.set_session_state(SessionState::Connected);
                    }
                }
                ChatEvent::Disconnected { .. } => {
                    if from_socket {
                        global.set_session_state(SessionState::Disconnected);
                    }
                }
                ChatEvent::NotificationMutesUpdated { me, .. }
                | ChatEvent::NotificationChannelMutesUpdated { me, .. } => {
                    ensure_same_user(&me.id, Some(current_user_id))?;
                    global.update_current_user(SelfUser::Full(me.clone()));
                }
                ChatEvent::UserUpdated { user, .. } => {
                    if &user.id == current_user_id {
                        global.update_current_user(SelfUser::Part(user.clone()));
                    }
                }
                ChatEvent::MarkAllRead {
                    total_unread_count,
                    unread_channels,
                    ..
                } => {
                    global.set_total_unread_count(*total_unread_count);
                    global.set_channel_unread_count(*unread_channels);
                }
                ChatEvent::MessageNew {
                    cid,
                    total_unread_count,
                    unread_channels,
                    ..
                }
                | ChatEvent::NotificationMessageNew {
                    cid,
                    total_unread_count,
                    unread_channels,
                    ..
                }
                | ChatEvent::NotificationMarkRead {
                    cid,
                    total_unread_count,
                    unread_channels,
                    ..
                } => {
                    if from_socket && self.has_read_events_capability(cid).await {
                        global.set_total_unread_count(*total_unread_count);
                        global.set_channel_unread_count(*unread_channels);
                    }
                }
                ChatEvent::HealthCheck { .. }
                | ChatEvent::MessageUpdated { .. }
                | ChatEvent::MessageDeleted { .. }
                | ChatEvent::MessageRead { .. }
                | ChatEvent::ReactionNew { .. }
                | ChatEvent::ReactionUpdated { .. }
                | ChatEvent::ReactionDeleted { .. }
                | ChatEvent::MemberAdded { .. }
                | ChatEvent::MemberUpdated { .. }
                | ChatEvent::MemberRemoved { .. }
                | ChatEvent::ChannelUpdated { .. }
                | ChatEvent::ChannelDeleted { .. }
                | ChatEvent::ChannelTruncated { .. }
                | ChatEvent::ChannelHidden { .. }
                | ChatEvent::ChannelVisible { .. }
                | ChatEvent::ChannelUserBanned { .. }
                | ChatEvent::ChannelUserUnbanned { .. }
                | ChatEvent::GlobalUserBanned { .. }
                | ChatEvent::GlobalUserUnbanned { .. }
                | ChatEvent::UserPresenceChanged { .. }
                | ChatEvent::TypingStart { .. }
                | ChatEvent::TypingStop { .. }
                | ChatEvent::NotificationAddedToChannel { .. }
                | ChatEvent::NotificationRemovedFromChannel { .. }
                | ChatEvent::NotificationInvited { .. }
                | ChatEvent::NotificationInviteAccepted { .. }
                | ChatEvent::NotificationInviteRejected { .. }
                | ChatEvent::NotificationChannelDeleted { .. }
                | ChatEvent::NotificationChannelTruncated { .. } => {}
            }
        }
        Ok(())
    }

    /// Failures here are logged; they never fail the batch.
    async fn update_sync_manager(self: &Arc<Self>, batch: &BatchEvent) {
        let from_socket = batch.is_from_socket_connection();
        for event in &batch.sorted_events {
            match event {
                ChatEvent::Connected { .. } => {
                    if !from_socket {
                        continue;
                    }
                    if self.config.recovery_enabled {
                        if let Err(err) = self.sync_manager.connection_recovered().await {
                            warn!("handler: connection recovery failed: {err}");
                        }
                    }
                    let cids = self.logic_registry.active_cids().await;
                    // queued behind the current batch, not awaited
                    if let Err(err) = self.sync_history(cids).await {
                        warn!("handler: history sync after reconnect failed: {err}");
                    }
                }
                ChatEvent::Disconnected { .. } => {
                    if from_socket {
                        if let Err(err) = self.sync_manager.persist().await {
                            warn!("handler: failed to persist sync state: {err}");
                        }
                    }
                }
                ChatEvent::HealthCheck { .. } => {
                    if from_socket {
                        if let Err(err) = self.sync_manager.retry_failed_entities().await {
                            warn!("handler: retrying failed entities failed: {err}");
                        }
                    }
                }
                ChatEvent::MarkAllRead {
                    created_at, user, ..
                } => {
                    if let Err(err) = self
                        .sync_manager
                        .update_all_read_state_for_date(&user.id, *created_at)
                        .await
                    {
                        warn!("handler: failed to store mark-all-read date: {err}");
                    }
                }
                ChatEvent::MessageNew { .. }
                | ChatEvent::MessageUpdated { .. }
                | ChatEvent::MessageDeleted { .. }
                | ChatEvent::MessageRead { .. }
                | ChatEvent::ReactionNew { .. }
                | ChatEvent::ReactionUpdated { .. }
                | ChatEvent::ReactionDeleted { .. }
                | ChatEvent::MemberAdded { .. }
                | ChatEvent::MemberUpdated { .. }
                | ChatEvent::MemberRemoved { .. }
                | ChatEvent::ChannelUpdated { .. }
                | ChatEvent::ChannelDeleted { .. }
                | ChatEvent::ChannelTruncated { .. }
                | ChatEvent::ChannelHidden { .. }
                | ChatEvent::ChannelVisible { .. }
                | ChatEvent::ChannelUserBanned { .. }
                | ChatEvent::ChannelUserUnbanned { .. }
                | ChatEvent::GlobalUserBanned { .. }
                | ChatEvent::GlobalUserUnbanned { .. }
                | ChatEvent::UserUpdated { .. }
                | ChatEvent::UserPresenceChanged { .. }
                | ChatEvent::TypingStart { .. }
                | ChatEvent::TypingStop { .. }
                | ChatEvent::NotificationMessageNew { .. }
                | ChatEvent::NotificationMarkRead { .. }
                | ChatEvent::NotificationAddedToChannel { .. }
                | ChatEvent::NotificationRemovedFromChannel { .. }
                | ChatEvent::NotificationInvited { .. }
                | ChatEvent::NotificationInviteAccepted { .. }
                | ChatEvent::NotificationInviteRejected { .. }
                | ChatEvent::NotificationChannelDeleted { .. }
                | ChatEvent::NotificationChannelTruncated { .. }
                | ChatEvent::NotificationMutesUpdated { .. }
                | ChatEvent::NotificationChannelMutesUpdated { .. } => {}
            }
        }
    }

    async fn update_channels_state(&self, batch: &BatchEvent) {
        let events = &batch.sorted_events;

        let mut by_channel: BTreeMap<&Cid, Vec<ChatEvent>> = BTreeMap::new();
        for event in events {
            if let Some(cid) = event.cid() {
                by_channel.entry(cid).or_default().push(event.clone());
            }
        }
        for (cid, channel_events) in by_channel {
            if self.logic_registry.is_active_channel(cid).await {
                self.logic_registry
                    .channel(cid)
                    .await
                    .handle_events(&channel_events);
            }
        }

        if let Some(mark_all_read) = events
            .iter()
            .find(|event| matches!(event, ChatEvent::MarkAllRead { .. }))
        {
            for logic in self.logic_registry.active_channels().await {
                logic.handle_event(mark_all_read);
            }
        }

        if let Some(mutes) = events
            .iter()
            .rev()
            .find(|event| matches!(event, ChatEvent::NotificationChannelMutesUpdated { .. }))
        {
            for logic in self.logic_registry.active_channels().await {
                logic.handle_event(mutes);
            }
        }

        for presence in events
            .iter()
            .filter(|event| matches!(event, ChatEvent::UserPresenceChanged { .. }))
        {
            let Some(user) = presence.user() else {
                continue;
            };
            for state in self.state_registry.active_channel_states().await {
                if state.has_member(&user.id) {
                    self.logic_registry
                        .channel(&state.cid())
                        .await
                        .handle_event(presence);
                }
            }
        }

        for query in self.logic_registry.active_queries().await {
            query.handle_events(events);
        }
    }
}

#[cfg(test)]
#[path = "tests/handler_tests.rs"]
mod tests;
