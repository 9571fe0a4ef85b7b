use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Channel, ChannelUserRead, Cid, Member, Message, MessageId, User, UserId},
    event::ChatEvent,
};
use tokio::sync::watch;
use tracing::trace;

use crate::global_state::GlobalState;

/// Observable view of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub cid: Cid,
    pub name: String,
    /// Ascending by `created_at`; ids are unique.
    pub messages: Vec<Message>,
    pub members: Vec<Member>,
    pub member_count: i32,
    pub membership: Option<Member>,
    pub reads: BTreeMap<UserId, ChannelUserRead>,
    pub typing: BTreeSet<UserId>,
    pub watcher_count: i32,
    pub hidden: bool,
    pub frozen: bool,
    pub muted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub own_capabilities: BTreeSet<String>,
}

impl ChannelSnapshot {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            name: String::new(),
            messages: Vec::new(),
            members: Vec::new(),
            member_count: 0,
            membership: None,
            reads: BTreeMap::new(),
            typing: BTreeSet::new(),
            watcher_count: 0,
            hidden: false,
            frozen: false,
            muted: false,
            deleted_at: None,
            own_capabilities: BTreeSet::new(),
        }
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.members.iter().any(|member| member.user_id() == user_id)
    }

    fn upsert_message(&mut self, message: Message) {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
            return;
        }
        let index = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(index, message);
    }

    fn remove_message(&mut self, id: &MessageId) {
        self.messages.retain(|message| &message.id != id);
    }

    fn truncate_before(&mut self, cutoff: DateTime<Utc>) {
        self.messages.retain(|message| message.created_at >= cutoff);
    }

    fn upsert_member(&mut self, member: Member) {
        match self
            .members
            .iter_mut()
            .find(|existing| existing.user_id() == member.user_id())
        {
            Some(existing) => *existing = member,
            None => {
                self.members.push(member);
                self.member_count += 1;
            }
        }
    }

    fn remove_member(&mut self, user_id: &UserId) {
        let before = self.members.len();
        self.members.retain(|member| member.user_id() != user_id);
        if self.members.len() < before {
            self.member_count = (self.member_count - 1).max(0);
        }
    }

    fn update_member_user(&mut self, user: &User) {
        for member in self.members.iter_mut().filter(|m| m.user_id() == &user.id) {
            member.user = user.clone();
        }
    }

    fn set_banned(&mut self, user_id: &UserId, banned: bool, current_user_id: Option<&UserId>) {
        for member in self.members.iter_mut().filter(|m| m.user_id() == user_id) {
            member.banned = banned;
        }
        if current_user_id == Some(user_id) {
            if let Some(membership) = self.membership.as_mut() {
                membership.banned = banned;
            }
        }
    }

    fn set_read(&mut self, user: &User, last_read: DateTime<Utc>) {
        self.reads.insert(
            user.id.clone(),
            ChannelUserRead {
                user: user.clone(),
                last_read,
                unread_messages: 0,
            },
        );
    }

    /// Copies channel-level fields. Messages are managed by message events.
    pub fn apply_channel(&mut self, channel: &Channel) {
        self.name = channel.name.clone();
        self.hidden = channel.hidden;
        self.frozen = channel.frozen;
        self.deleted_at = channel.deleted_at;
        self.member_count = channel.member_count;
        if !channel.members.is_empty() {
            self.members = channel.members.clone();
        }
        if channel.membership.is_some() {
            self.membership = channel.membership.clone();
        }
        if !channel.own_capabilities.is_empty() {
            self.own_capabilities = channel.own_capabilities.clone();
        }
        if channel.watcher_count > 0 {
            self.watcher_count = channel.watcher_count;
        }
        for read in &channel.reads {
            self.reads.insert(read.user.id.clone(), read.clone());
        }
    }

    fn apply(&mut self, event: &ChatEvent, current_user_id: Option<&UserId>) {
        match event {
            ChatEvent::MessageNew {
                message,
                watcher_count,
                ..
            } => {
                if *watcher_count > 0 {
                    self.watcher_count = *watcher_count;
                }
                self.hidden = false;
                self.upsert_message(message.clone());
            }
            ChatEvent::NotificationMessageNew { message, .. } => {
                self.hidden = false;
                self.upsert_message(message.clone());
            }
            ChatEvent::MessageUpdated { message, .. }
            | ChatEvent::ReactionNew { message, .. }
            | ChatEvent::ReactionUpdated { message, .. }
            | ChatEvent::ReactionDeleted { message, .. } => self.upsert_message(message.clone()),
            ChatEvent::MessageDeleted {
                created_at,
                message,
                hard_delete,
                ..
            } => {
                if *hard_delete {
                    self.remove_message(&message.id);
                } else {
                    let mut message = message.clone();
                    message.deleted_at = message.deleted_at.or(Some(*created_at));
                    self.upsert_message(message);
                }
            }
            ChatEvent::MessageRead {
                created_at, user, ..
            }
            | ChatEvent::NotificationMarkRead {
                created_at, user, ..
            } => self.set_read(user, *created_at),
            ChatEvent::MarkAllRead {
                created_at, user, ..
            } => {
                if current_user_id == Some(&user.id) {
                    self.set_read(user, *created_at);
                }
            }
            ChatEvent::MemberAdded { member, .. }
            | ChatEvent::MemberUpdated { member, .. }
            | ChatEvent::NotificationInvited { member, .. } => {
                if current_user_id == Some(member.user_id()) {
                    self.membership = Some(member.clone());
                }
                self.upsert_member(member.clone());
            }
            ChatEvent::MemberRemoved { user, .. } => {
                self.remove_member(&user.id);
                if current_user_id == Some(&user.id) {
                    self.membership = None;
                }
            }
            ChatEvent::TypingStart { user, .. } => {
                self.typing.insert(user.id.clone());
            }
            ChatEvent::TypingStop { user, .. } => {
                self.typing.remove(&user.id);
            }
            ChatEvent::ChannelUserBanned { user, .. } => {
                self.set_banned(&user.id, true, current_user_id)
            }
            ChatEvent::ChannelUserUnbanned { user, .. } => {
                self.set_banned(&user.id, false, current_user_id)
            }
            ChatEvent::ChannelUpdated { channel, .. } => self.apply_channel(channel),
            ChatEvent::ChannelDeleted {
                created_at,
                channel,
                ..
            }
            | ChatEvent::NotificationChannelDeleted {
                created_at,
                channel,
                ..
            } => {
                self.apply_channel(channel);
                self.deleted_at = channel.deleted_at.or(Some(*created_at));
            }
            ChatEvent::ChannelTruncated {
                created_at,
                channel,
                ..
            }
            | ChatEvent::NotificationChannelTruncated {
                created_at,
                channel,
                ..
            } => {
                self.apply_channel(channel);
                self.truncate_before(*created_at);
            }
            ChatEvent::ChannelHidden {
                created_at,
                clear_history,
                ..
            } => {
                self.hidden = true;
                if *clear_history {
                    self.truncate_before(*created_at);
                }
            }
            ChatEvent::ChannelVisible { .. } => self.hidden = false,
            ChatEvent::NotificationAddedToChannel {
                channel, member, ..
            } => {
                self.apply_channel(channel);
                if current_user_id == Some(member.user_id()) {
                    self.membership = Some(member.clone());
                }
            }
            ChatEvent::NotificationRemovedFromChannel { channel, .. } => {
                self.membership = None;
                self.members = channel.members.clone();
                self.member_count = channel.member_count;
            }
            ChatEvent::NotificationInviteAccepted {
                channel, member, ..
            }
            | ChatEvent::NotificationInviteRejected {
                channel, member, ..
            } => {
                self.apply_channel(channel);
                self.upsert_member(member.clone());
            }
            ChatEvent::NotificationChannelMutesUpdated { me, .. } => {
                self.muted = me.channel_mutes.iter().any(|mute| mute.cid == self.cid);
            }
            ChatEvent::UserPresenceChanged { user, .. } | ChatEvent::UserUpdated { user, .. } => {
                self.update_member_user(user)
            }
            ChatEvent::GlobalUserBanned { user, .. } => {
                let mut user = user.clone();
                user.banned = true;
                self.update_member_user(&user);
            }
            ChatEvent::GlobalUserUnbanned { user, .. } => {
                let mut user = user.clone();
                user.banned = false;
                self.update_member_user(&user);
            }
            ChatEvent::Connected { .. }
            | ChatEvent::Disconnected { .. }
            | ChatEvent::HealthCheck { .. }
            | ChatEvent::NotificationMutesUpdated { .. } => {}
        }
    }
}

/// Writer side of a channel view. Only the event handler calls it.
pub struct ChannelLogic {
    cid: Cid,
    global_state: Arc<GlobalState>,
    state: watch::Sender<ChannelSnapshot>,
}

impl ChannelLogic {
    pub fn new(cid: Cid, global_state: Arc<GlobalState>) -> Self {
        let (state, _) = watch::channel(ChannelSnapshot::new(cid.clone()));
        Self {
            cid,
            global_state,
            state,
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn state(&self) -> ChannelState {
        ChannelState {
            receiver: self.state.subscribe(),
        }
    }

    /// Seeds the view from stored data.
    pub fn update_data_from_channel(&self, channel: &Channel, messages: Vec<Message>) {
        self.state.send_modify(|snapshot| {
            snapshot.apply_channel(channel);
            for message in messages {
                snapshot.upsert_message(message);
            }
        });
    }

    pub fn handle_event(&self, event: &ChatEvent) {
        self.handle_events(std::slice::from_ref(event));
    }

    /// Applies `events` in order and notifies subscribers once.
    pub fn handle_events(&self, events: &[ChatEvent]) {
        let current_user_id = self.global_state.user().map(|user| user.id);
        trace!(cid = %self.cid, size = events.len(), "channel: handling events");
        self.state.send_modify(|snapshot| {
            for event in events {
                snapshot.apply(event, current_user_id.as_ref());
            }
        });
    }
}

/// Read-only handle to a channel view.
#[derive(Clone)]
pub struct ChannelState {
    receiver: watch::Receiver<ChannelSnapshot>,
}

impl ChannelState {
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn cid(&self) -> Cid {
        self.receiver.borrow().cid.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.receiver.borrow().messages.clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.receiver.borrow().members.clone()
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.receiver.borrow().has_member(user_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelSnapshot> {
        self.receiver.clone()
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
