use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{Cid, Message, Reaction, SyncState, SyncStatus, UserId},
    error::ChatError,
    event::{sort_by_created_at, ChatEvent},
};
use storage::Repository;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::HandlerError;

/// Backend calls the sync manager needs. Every mutation is keyed by the
/// client generated id of its entity, so resending is idempotent.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn get_sync_history(
        &self,
        cids: &[Cid],
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatEvent>, ChatError>;
    async fn send_message(&self, message: &Message) -> Result<Message, ChatError>;
    async fn delete_message(&self, message: &Message) -> Result<Message, ChatError>;
    async fn send_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError>;
    async fn delete_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError>;
}

pub struct MissingChatApi;

#[async_trait]
impl ChatApi for MissingChatApi {
    async fn get_sync_history(
        &self,
        cids: &[Cid],
        _since: DateTime<Utc>,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        Err(ChatError::network(format!(
            "chat backend unavailable for {} channels",
            cids.len()
        )))
    }

    async fn send_message(&self, message: &Message) -> Result<Message, ChatError> {
        Err(ChatError::network(format!(
            "chat backend unavailable for message {}",
            message.id
        )))
    }

    async fn delete_message(&self, message: &Message) -> Result<Message, ChatError> {
        Err(ChatError::network(format!(
            "chat backend unavailable for message {}",
            message.id
        )))
    }

    async fn send_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError> {
        Err(ChatError::network(format!(
            "chat backend unavailable for reaction on {}",
            reaction.message_id
        )))
    }

    async fn delete_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError> {
        Err(ChatError::network(format!(
            "chat backend unavailable for reaction on {}",
            reaction.message_id
        )))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub completed: usize,
    pub failed_permanently: usize,
    pub still_pending: usize,
    /// Another run was already in progress; nothing was attempted.
    pub skipped: bool,
}

impl RetryReport {
    fn record<T>(&mut self, outcome: &Result<T, ChatError>) -> SyncStatus {
        match outcome {
            Ok(_) => {
                self.completed += 1;
                SyncStatus::Completed
            }
            Err(err) if err.is_permanent() => {
                self.failed_permanently += 1;
                SyncStatus::FailedPermanently
            }
            Err(_) => {
                self.still_pending += 1;
                SyncStatus::SyncNeeded
            }
        }
    }
}

/// Per-channel sync positions proposed by a history fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoints {
    pub user_id: UserId,
    pub last_synced_at: BTreeMap<Cid, DateTime<Utc>>,
}

impl Checkpoints {
    pub fn is_empty(&self) -> bool {
        self.last_synced_at.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SyncHistory {
    pub events: Vec<ChatEvent>,
    pub checkpoints: Checkpoints,
}

/// Keeps per-channel sync checkpoints and replays what was missed while
/// offline.
pub struct SyncManager {
    repository: Arc<dyn Repository>,
    api: Arc<dyn ChatApi>,
    state: Mutex<Option<SyncState>>,
    retry_gate: Mutex<()>,
}

impl SyncManager {
    pub fn new(repository: Arc<dyn Repository>, api: Arc<dyn ChatApi>) -> Self {
        Self {
            repository,
            api,
            state: Mutex::new(None),
            retry_gate: Mutex::new(()),
        }
    }

    pub async fn sync_state(&self) -> Option<SyncState> {
        self.state.lock().await.clone()
    }

    pub async fn load_sync_state_for_user(&self, user_id: &UserId) -> Result<(), HandlerError> {
        let stored = self
            .repository
            .select_sync_state(user_id)
            .await
            .map_err(HandlerError::Storage)?;
        let state = match stored {
            Some(state) => state,
            None => {
                let state = SyncState::new(user_id.clone());
                self.repository
                    .insert_sync_state(&state)
                    .await
                    .map_err(HandlerError::Storage)?;
                state
            }
        };
        debug!(
            user_id = %user_id,
            checkpoints = state.last_synced_at.len(),
            "sync: loaded sync state"
        );
        *self.state.lock().await = Some(state);
        Ok(())
    }

    /// Fetches events missed by `cids` since their checkpoints, ascending by
    /// `created_at`. The loaded state is left untouched; the returned
    /// checkpoints are applied with [`SyncManager::commit_checkpoints`] once
    /// the events have been reconciled.
    pub async fn get_sorted_sync_history(
        &self,
        cids: &[Cid],
    ) -> Result<SyncHistory, HandlerError> {
        let requested_at = Utc::now();
        let (user_id, known) = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(HandlerError::MissingCurrentUser)?;
            let known: BTreeMap<Cid, DateTime<Utc>> = cids
                .iter()
                .filter_map(|cid| state.last_synced_at.get(cid).map(|at| (cid.clone(), *at)))
                .collect();
            (state.user_id.clone(), known)
        };

        // channels seen for the first time start from now
        let mut proposed: BTreeMap<Cid, DateTime<Utc>> = cids
            .iter()
            .filter(|cid| !known.contains_key(*cid))
            .map(|cid| (cid.clone(), requested_at))
            .collect();

        let Some(since) = known.values().min().copied() else {
            debug!(cids = cids.len(), "sync: no checkpoints yet, nothing to replay");
            return Ok(SyncHistory {
                events: Vec::new(),
                checkpoints: Checkpoints {
                    user_id,
                    last_synced_at: proposed,
                },
            });
        };

        let requested: Vec<Cid> = known.keys().cloned().collect();
        let received = self.api.get_sync_history(&requested, since).await?;
        let received_len = received.len();

        let mut events: Vec<ChatEvent> = received
            .into_iter()
            .filter(|event| match event.cid().and_then(|cid| known.get(cid)) {
                Some(checkpoint) => event.created_at() > *checkpoint,
                None => true,
            })
            .collect();
        sort_by_created_at(&mut events);

        for cid in &requested {
            let newest = events
                .iter()
                .filter(|event| event.cid() == Some(cid))
                .map(ChatEvent::created_at)
                .max()
                .unwrap_or(requested_at);
            proposed.insert(cid.clone(), newest);
        }

        info!(
            channels = requested.len(),
            received = received_len,
            replayed = events.len(),
            "sync: history fetched"
        );
        Ok(SyncHistory {
            events,
            checkpoints: Checkpoints {
                user_id,
                last_synced_at: proposed,
            },
        })
    }

    /// Advances the loaded checkpoints to `checkpoints` and persists them.
    /// Checkpoints never move backwards, and checkpoints proposed for another
    /// user are ignored.
    pub async fn commit_checkpoints(&self, checkpoints: &Checkpoints) -> Result<(), HandlerError> {
        let mut guard = self.state.lock().await;
        let state = match guard.as_mut() {
            Some(state) if state.user_id == checkpoints.user_id => state,
            _ => {
                debug!(
                    user_id = %checkpoints.user_id,
                    "sync: checkpoints for an unloaded user dropped"
                );
                return Ok(());
            }
        };
        for (cid, at) in &checkpoints.last_synced_at {
            let entry = state.last_synced_at.entry(cid.clone()).or_insert(*at);
            if *entry < *at {
                *entry = *at;
            }
        }
        self.repository
            .insert_sync_state(state)
            .await
            .map_err(HandlerError::Storage)?;
        debug!(channels = checkpoints.last_synced_at.len(), "sync: checkpoints committed");
        Ok(())
    }

    pub async fn update_all_read_state_for_date(
        &self,
        user_id: &UserId,
        date: DateTime<Utc>,
    ) -> Result<(), HandlerError> {
        let mut guard = self.state.lock().await;
        match guard.as_mut() {
            Some(state) if &state.user_id == user_id => {
                state.marked_all_read_at = Some(date);
                self.repository
                    .insert_sync_state(state)
                    .await
                    .map_err(HandlerError::Storage)
            }
            _ => {
                debug!(user_id = %user_id, "sync: mark all read for an unloaded user ignored");
                Ok(())
            }
        }
    }

    pub async fn connection_recovered(&self) -> Result<RetryReport, HandlerError> {
        info!("sync: connection recovered");
        self.retry_failed_entities().await
    }

    /// Re-sends offline mutations still marked `SyncNeeded`. A call made
    /// while another run is in progress returns at once with `skipped` set.
    pub async fn retry_failed_entities(&self) -> Result<RetryReport, HandlerError> {
        let Ok(_running) = self.retry_gate.try_lock() else {
            debug!("sync: retry already in progress");
            return Ok(RetryReport {
                skipped: true,
                ..RetryReport::default()
            });
        };

        let mut report = RetryReport::default();

        let messages = self
            .repository
            .select_messages_by_sync_status(SyncStatus::SyncNeeded)
            .await
            .map_err(HandlerError::Storage)?;
        let mut settled = Vec::new();
        for message in messages {
            let outcome = if message.is_deleted() {
                self.api.delete_message(&message).await
            } else {
                self.api.send_message(&message).await
            };
            let status = report.record(&outcome);
            if let Err(err) = &outcome {
                warn!(message_id = %message.id, "sync: message retry failed: {err}");
            }
            if status != SyncStatus::SyncNeeded {
                let mut updated = match outcome {
                    Ok(remote) if remote.cid.is_some() => remote,
                    _ => message,
                };
                updated.sync_status = status;
                settled.push(updated);
            }
        }
        if !settled.is_empty() {
            self.repository
                .insert_messages(&settled)
                .await
                .map_err(HandlerError::Storage)?;
        }

        let reactions = self
            .repository
            .select_reactions_by_sync_status(SyncStatus::SyncNeeded)
            .await
            .map_err(HandlerError::Storage)?;
        for mut reaction in reactions {
            let outcome = if reaction.deleted_at.is_some() {
                self.api.delete_reaction(&reaction).await
            } else {
                self.api.send_reaction(&reaction).await
            };
            let status = report.record(&outcome);
            if let Err(err) = &outcome {
                warn!(message_id = %reaction.message_id, "sync: reaction retry failed: {err}");
            }
            if status != SyncStatus::SyncNeeded {
                reaction.sync_status = status;
                self.repository
                    .insert_reaction(&reaction)
                    .await
                    .map_err(HandlerError::Storage)?;
            }
        }

        info!(
            completed = report.completed,
            failed_permanently = report.failed_permanently,
            still_pending = report.still_pending,
            "sync: retried failed entities"
        );
        Ok(report)
    }

    pub async fn persist(&self) -> Result<(), HandlerError> {
        let guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            self.repository
                .insert_sync_state(state)
                .await
                .map_err(HandlerError::Storage)?;
        }
        Ok(())
    }

    /// Persists and forgets the loaded state.
    pub async fn clear_state(&self) -> Result<(), HandlerError> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.take() {
            self.repository
                .insert_sync_state(&state)
                .await
                .map_err(HandlerError::Storage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/sync_manager_tests.rs"]
mod tests;
