use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use shared::{
    domain::{
        merge_reactions, Channel, ChannelUserRead, Cid, Message, MessageId, User, UserId,
    },
    event::ChatEvent,
};
use storage::{BatchWrite, Deletion, Repository};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ensure_same_user, HandlerError};

/// Collects what a batch needs from offline storage before it is loaded.
#[derive(Debug, Clone)]
pub struct EventBatchUpdateBuilder {
    id: Uuid,
    channels_to_fetch: BTreeSet<Cid>,
    messages_to_fetch: BTreeSet<MessageId>,
    users: BTreeMap<UserId, User>,
}

impl EventBatchUpdateBuilder {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            channels_to_fetch: BTreeSet::new(),
            messages_to_fetch: BTreeSet::new(),
            users: BTreeMap::new(),
        }
    }

    pub fn add_to_fetch_channels(&mut self, cids: impl IntoIterator<Item = Cid>) -> &mut Self {
        self.channels_to_fetch.extend(cids);
        self
    }

    pub fn add_to_fetch_messages(
        &mut self,
        ids: impl IntoIterator<Item = MessageId>,
    ) -> &mut Self {
        self.messages_to_fetch.extend(ids);
        self
    }

    pub fn add_users(&mut self, users: impl IntoIterator<Item = User>) -> &mut Self {
        for user in users {
            if !user.id.as_str().is_empty() {
                self.users.insert(user.id.clone(), user);
            }
        }
        self
    }

    pub async fn build(
        self,
        repository: &dyn Repository,
        current_user_id: &UserId,
    ) -> Result<EventBatchUpdate> {
        let cids: Vec<Cid> = self.channels_to_fetch.into_iter().collect();
        let ids: Vec<MessageId> = self.messages_to_fetch.into_iter().collect();
        let channels = repository.select_channels(&cids).await?;
        let messages = repository.select_messages(&ids).await?;

        Ok(EventBatchUpdate {
            id: self.id,
            current_user_id: current_user_id.clone(),
            channels: channels
                .into_iter()
                .map(|channel| (channel.cid.clone(), channel))
                .collect(),
            messages: messages
                .into_iter()
                .map(|message| (message.id.clone(), message))
                .collect(),
            dirty_users: self.users.keys().cloned().collect(),
            users: self.users,
            dirty_channels: BTreeSet::new(),
            dirty_messages: BTreeSet::new(),
        })
    }
}

/// Scratch view of stored entities for one batch. Staged changes are written
/// by [`EventBatchUpdate::execute`] in a single transaction.
#[derive(Debug, Clone)]
pub struct EventBatchUpdate {
    id: Uuid,
    current_user_id: UserId,
    channels: BTreeMap<Cid, Channel>,
    messages: BTreeMap<MessageId, Message>,
    users: BTreeMap<UserId, User>,
    dirty_channels: BTreeSet<Cid>,
    dirty_messages: BTreeSet<MessageId>,
    dirty_users: BTreeSet<UserId>,
}

impl EventBatchUpdate {
    pub fn current_user_id(&self) -> &UserId {
        &self.current_user_id
    }

    pub fn get_current_channel(&self, cid: &Cid) -> Option<Channel> {
        self.channels.get(cid).cloned()
    }

    pub fn get_current_message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn add_user(&mut self, user: User) {
        if user.id.as_str().is_empty() {
            return;
        }
        self.dirty_users.insert(user.id.clone());
        self.users.insert(user.id.clone(), user);
    }

    pub fn add_channel(&mut self, channel: Channel) {
        for member in &channel.members {
            self.add_user(member.user.clone());
        }
        self.dirty_channels.insert(channel.cid.clone());
        self.channels.insert(channel.cid.clone(), channel);
    }

    /// Messages without a cid cannot be stored and are skipped.
    pub fn add_message(&mut self, message: Message) {
        if message.cid.is_none() {
            debug!(message_id = %message.id, "offline: skipping message without cid");
            return;
        }
        self.add_user(message.user.clone());
        self.dirty_messages.insert(message.id.clone());
        self.messages.insert(message.id.clone(), message);
    }

    /// Stages `message` and, for new messages, moves the stored channel's
    /// `last_message_at` forward.
    pub fn add_message_data(&mut self, cid: &Cid, message: Message, is_new_message: bool) {
        let created_at = message.created_at;
        self.add_message(message);
        if !is_new_message {
            return;
        }
        if let Some(channel) = self.channels.get_mut(cid) {
            if channel.last_message_at.map_or(true, |at| at < created_at) {
                channel.last_message_at = Some(created_at);
            }
            self.dirty_channels.insert(cid.clone());
        }
    }

    pub fn staged(&self) -> BatchWrite {
        BatchWrite {
            users: self
                .dirty_users
                .iter()
                .filter_map(|id| self.users.get(id).cloned())
                .collect(),
            channels: self
                .dirty_channels
                .iter()
                .filter_map(|cid| self.channels.get(cid).cloned())
                .collect(),
            messages: self
                .dirty_messages
                .iter()
                .filter_map(|id| self.messages.get(id).cloned())
                .collect(),
        }
    }

    pub async fn execute(self, repository: &dyn Repository) -> Result<()> {
        let staged = self.staged();
        debug!(
            batch_id = %self.id,
            users = staged.users.len(),
            channels = staged.channels.len(),
            messages = staged.messages.len(),
            "offline: executing batch update"
        );
        repository.write_batch(&staged).await
    }
}

pub fn enrich_with_cid(message: &mut Message, cid: &Cid) {
    message.cid = Some(cid.clone());
}

/// Recomputes `own_reactions` of `message` for the current user. When the
/// event was caused by another user the stored own reactions stay as they
/// are; otherwise the current user's entries of `latest_reactions` are
/// merged over them.
pub fn enrich_with_own_reactions(
    message: &mut Message,
    batch: &EventBatchUpdate,
    current_user_id: &UserId,
    event_user: Option<&User>,
) {
    let cached = batch
        .get_current_message(&message.id)
        .map(|stored| stored.own_reactions.clone());
    message.own_reactions = match (event_user, cached) {
        (Some(user), Some(cached)) if &user.id != current_user_id => cached,
        (_, cached) => merge_reactions(
            message
                .latest_reactions
                .iter()
                .filter(|reaction| &reaction.user_id == current_user_id)
                .cloned(),
            cached.unwrap_or_default(),
        ),
    };
}

fn channel_update(
    batch: &EventBatchUpdate,
    cid: &Cid,
    update: impl FnOnce(Channel) -> Channel,
) -> Option<Channel> {
    batch.get_current_channel(cid).map(update)
}

/// Reconciles one sorted batch with offline storage: load what the batch
/// touches, stage merged upserts, commit them, then apply deletions.
/// Messages in `events` are enriched in place.
pub async fn update_offline_storage(
    batch_id: Uuid,
    events: &mut [ChatEvent],
    is_from_socket_connection: bool,
    repository: &dyn Repository,
    current_user_id: &UserId,
) -> Result<(), HandlerError> {
    let mut builder = EventBatchUpdateBuilder::new(batch_id);
    builder
        .add_to_fetch_channels(events.iter().filter_map(ChatEvent::cid).cloned())
        .add_users(
            events
                .iter()
                .flat_map(|event| event.user().into_iter().chain(event.me()))
                .cloned(),
        )
        .add_to_fetch_messages(events.iter().filter_map(ChatEvent::message_id).cloned());

    let mut batch = builder
        .build(repository, current_user_id)
        .await
        .map_err(HandlerError::Storage)?;
    let mut deletions = Vec::new();

    for event in events.iter_mut() {
        match event {
            ChatEvent::Connected { me, .. } => {
                if is_from_socket_connection {
                    ensure_same_user(&me.id, Some(current_user_id))?;
                    repository
                        .insert_current_user(me)
                        .await
                        .map_err(HandlerError::Storage)?;
                }
            }
            ChatEvent::MessageNew {
                cid, user, message, ..
            } => {
                enrich_with_cid(message, cid);
                enrich_with_own_reactions(message, &batch, current_user_id, Some(&*user));
                batch.add_message_data(cid, message.clone(), true);
                if let Some(channel) = channel_update(&batch, cid, |mut channel| {
                    channel.hidden = false;
                    channel
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::MessageUpdated {
                cid, user, message, ..
            } => {
                enrich_with_cid(message, cid);
                enrich_with_own_reactions(message, &batch, current_user_id, Some(&*user));
                batch.add_message_data(cid, message.clone(), false);
            }
            ChatEvent::MessageDeleted {
                created_at,
                cid,
                user,
                message,
                hard_delete,
            } => {
                enrich_with_cid(message, cid);
                enrich_with_own_reactions(message, &batch, current_user_id, user.as_ref());
                if message.deleted_at.is_none() {
                    message.deleted_at = Some(*created_at);
                }
                batch.add_message_data(cid, message.clone(), false);
                if *hard_delete {
                    deletions.push(Deletion::Message {
                        message: message.clone(),
                    });
                    deletions.push(Deletion::EvictChannel { cid: cid.clone() });
                }
            }
            ChatEvent::NotificationMessageNew {
                cid,
                channel,
                message,
                ..
            } => {
                enrich_with_cid(message, cid);
                let mut channel = channel.clone();
                channel.hidden = false;
                batch.add_channel(channel);
                batch.add_message_data(cid, message.clone(), true);
            }
            ChatEvent::NotificationAddedToChannel {
                channel, member, ..
            } => {
                batch.add_channel(
                    channel
                        .clone()
                        .add_membership(current_user_id, member.clone()),
                );
            }
            ChatEvent::NotificationInvited { user, member, .. } => {
                batch.add_user(user.clone());
                batch.add_user(member.user.clone());
            }
            ChatEvent::NotificationInviteAccepted {
                user,
                member,
                channel,
                ..
            }
            | ChatEvent::NotificationInviteRejected {
                user,
                member,
                channel,
                ..
            } => {
                batch.add_user(user.clone());
                batch.add_user(member.user.clone());
                batch.add_channel(channel.clone());
            }
            ChatEvent::ChannelHidden {
                created_at,
                cid,
                clear_history,
                ..
            } => {
                let hidden_before = clear_history.then_some(*created_at);
                if let Some(channel) = channel_update(&batch, cid, |mut channel| {
                    channel.hidden = true;
                    channel.hidden_messages_before = hidden_before;
                    channel
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::ChannelVisible { cid, .. } => {
                if let Some(channel) = channel_update(&batch, cid, |mut channel| {
                    channel.hidden = false;
                    channel
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::NotificationMutesUpdated { me, .. }
            | ChatEvent::NotificationChannelMutesUpdated { me, .. } => {
                ensure_same_user(&me.id, Some(current_user_id))?;
                repository
                    .insert_current_user(me)
                    .await
                    .map_err(HandlerError::Storage)?;
            }
            ChatEvent::ReactionNew {
                cid, user, message, ..
            }
            | ChatEvent::ReactionUpdated {
                cid, user, message, ..
            }
            | ChatEvent::ReactionDeleted {
                cid, user, message, ..
            } => {
                enrich_with_cid(message, cid);
                enrich_with_own_reactions(message, &batch, current_user_id, Some(&*user));
                batch.add_message(message.clone());
            }
            ChatEvent::ChannelUserBanned { cid, user, .. } => {
                if let Some(channel) = channel_update(&batch, cid, |channel| {
                    channel
                        .update_member_banned(&user.id, true)
                        .update_membership_banned(&user.id, true)
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::ChannelUserUnbanned { cid, user, .. } => {
                if let Some(channel) = channel_update(&batch, cid, |channel| {
                    channel
                        .update_member_banned(&user.id, false)
                        .update_membership_banned(&user.id, false)
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::MemberAdded { cid, member, .. } => {
                if let Some(channel) = channel_update(&batch, cid, |channel| {
                    channel
                        .add_member(member.clone())
                        .add_membership(current_user_id, member.clone())
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::MemberUpdated { cid, member, .. } => {
                if let Some(channel) = channel_update(&batch, cid, |channel| {
                    channel
                        .update_member(member.clone())
                        .update_membership(member.clone())
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::MemberRemoved { cid, user, .. } => {
                if let Some(channel) = channel_update(&batch, cid, |channel| {
                    let channel = channel.remove_member(&user.id);
                    if &user.id == current_user_id {
                        channel.remove_membership(current_user_id)
                    } else {
                        channel
                    }
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::NotificationRemovedFromChannel { cid, channel, .. } => {
                let payload = &*channel;
                if let Some(updated) = channel_update(&batch, cid, |stored| {
                    let mut updated = stored.remove_membership(current_user_id);
                    updated.member_count = payload.member_count;
                    updated.members = payload.members.clone();
                    updated
                }) {
                    batch.add_channel(updated);
                }
            }
            ChatEvent::ChannelUpdated { channel, .. }
            | ChatEvent::NotificationChannelDeleted { channel, .. } => {
                batch.add_channel(channel.clone());
            }
            ChatEvent::ChannelDeleted {
                created_at,
                cid,
                channel,
                ..
            } => {
                batch.add_channel(channel.clone());
                deletions.push(Deletion::MessagesBefore {
                    cid: cid.clone(),
                    before: *created_at,
                });
                deletions.push(Deletion::ChannelDeletedAt {
                    cid: cid.clone(),
                    deleted_at: *created_at,
                });
            }
            ChatEvent::ChannelTruncated {
                created_at,
                cid,
                channel,
                ..
            }
            | ChatEvent::NotificationChannelTruncated {
                created_at,
                cid,
                channel,
            } => {
                batch.add_channel(channel.clone());
                deletions.push(Deletion::MessagesBefore {
                    cid: cid.clone(),
                    before: *created_at,
                });
            }
            ChatEvent::MessageRead {
                created_at,
                cid,
                user,
            }
            | ChatEvent::NotificationMarkRead {
                created_at,
                cid,
                user,
                ..
            } => {
                let read = ChannelUserRead {
                    user: user.clone(),
                    last_read: *created_at,
                    unread_messages: 0,
                };
                if let Some(channel) = channel_update(&batch, cid, |mut channel| {
                    channel.update_reads(read);
                    channel
                }) {
                    batch.add_channel(channel);
                }
            }
            ChatEvent::GlobalUserBanned { user, .. } => {
                let mut user = user.clone();
                user.banned = true;
                batch.add_user(user);
            }
            ChatEvent::GlobalUserUnbanned { user, .. } => {
                let mut user = user.clone();
                user.banned = false;
                batch.add_user(user);
            }
            ChatEvent::UserUpdated { user, .. } => {
                if &user.id == current_user_id {
                    repository
                        .insert_current_user(user)
                        .await
                        .map_err(HandlerError::Storage)?;
                }
            }
            ChatEvent::Disconnected { .. }
            | ChatEvent::HealthCheck { .. }
            | ChatEvent::MarkAllRead { .. }
            | ChatEvent::UserPresenceChanged { .. }
            | ChatEvent::TypingStart { .. }
            | ChatEvent::TypingStop { .. } => {}
        }
    }

    batch.execute(repository).await.map_err(HandlerError::Storage)?;
    repository
        .apply_deletions(&deletions)
        .await
        .map_err(HandlerError::Storage)?;
    Ok(())
}

#[cfg(test)]
#[path = "tests/offline_tests.rs"]
mod tests;
