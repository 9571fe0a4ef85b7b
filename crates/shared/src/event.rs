use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Channel, Cid, ConnectionId, Member, Message, MessageId, Reaction, User};

/// One server notification. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Connected {
        created_at: DateTime<Utc>,
        me: User,
        connection_id: ConnectionId,
    },
    Disconnected {
        created_at: DateTime<Utc>,
    },
    HealthCheck {
        created_at: DateTime<Utc>,
        connection_id: ConnectionId,
    },
    MessageNew {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        message: Message,
        #[serde(default)]
        total_unread_count: i32,
        #[serde(default)]
        unread_channels: i32,
        #[serde(default)]
        watcher_count: i32,
    },
    MessageUpdated {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        message: Message,
    },
    MessageDeleted {
        created_at: DateTime<Utc>,
        cid: Cid,
        #[serde(default)]
        user: Option<User>,
        message: Message,
        #[serde(default)]
        hard_delete: bool,
    },
    MessageRead {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
    },
    ReactionNew {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        message: Message,
        reaction: Reaction,
    },
    ReactionUpdated {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        message: Message,
        reaction: Reaction,
    },
    ReactionDeleted {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        message: Message,
        reaction: Reaction,
    },
    MemberAdded {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        member: Member,
    },
    MemberUpdated {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        member: Member,
    },
    MemberRemoved {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
    },
    ChannelUpdated {
        created_at: DateTime<Utc>,
        cid: Cid,
        channel: Channel,
        #[serde(default)]
        user: Option<User>,
    },
    ChannelDeleted {
        created_at: DateTime<Utc>,
        cid: Cid,
        channel: Channel,
        #[serde(default)]
        user: Option<User>,
    },
    ChannelTruncated {
        created_at: DateTime<Utc>,
        cid: Cid,
        channel: Channel,
        #[serde(default)]
        user: Option<User>,
    },
    ChannelHidden {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        #[serde(default)]
        clear_history: bool,
    },
    ChannelVisible {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
    },
    ChannelUserBanned {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        #[serde(default)]
        expiration: Option<DateTime<Utc>>,
    },
    ChannelUserUnbanned {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
    },
    GlobalUserBanned {
        created_at: DateTime<Utc>,
        user: User,
    },
    GlobalUserUnbanned {
        created_at: DateTime<Utc>,
        user: User,
    },
    UserUpdated {
        created_at: DateTime<Utc>,
        user: User,
    },
    UserPresenceChanged {
        created_at: DateTime<Utc>,
        user: User,
    },
    TypingStart {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
    },
    TypingStop {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
    },
    NotificationMessageNew {
        created_at: DateTime<Utc>,
        cid: Cid,
        channel: Channel,
        message: Message,
        #[serde(default)]
        total_unread_count: i32,
        #[serde(default)]
        unread_channels: i32,
    },
    NotificationMarkRead {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        #[serde(default)]
        total_unread_count: i32,
        #[serde(default)]
        unread_channels: i32,
    },
    MarkAllRead {
        created_at: DateTime<Utc>,
        user: User,
        #[serde(default)]
        total_unread_count: i32,
        #[serde(default)]
        unread_channels: i32,
    },
    NotificationAddedToChannel {
        created_at: DateTime<Utc>,
        cid: Cid,
        channel: Channel,
        member: Member,
    },
    NotificationRemovedFromChannel {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        channel: Channel,
    },
    NotificationInvited {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        member: Member,
    },
    NotificationInviteAccepted {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        member: Member,
        channel: Channel,
    },
    NotificationInviteRejected {
        created_at: DateTime<Utc>,
        cid: Cid,
        user: User,
        member: Member,
        channel: Channel,
    },
    NotificationChannelDeleted {
        created_at: DateTime<Utc>,
        cid: Cid,
        channel: Channel,
    },
    NotificationChannelTruncated {
        created_at: DateTime<Utc>,
        cid: Cid,
        channel: Channel,
    },
    NotificationMutesUpdated {
        created_at: DateTime<Utc>,
        me: User,
    },
    NotificationChannelMutesUpdated {
        created_at: DateTime<Utc>,
        me: User,
    },
}

impl ChatEvent {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ChatEvent::Connected { created_at, .. }
            | ChatEvent::Disconnected { created_at }
            | ChatEvent::HealthCheck { created_at, .. }
            | ChatEvent::MessageNew { created_at, .. }
            | ChatEvent::MessageUpdated { created_at, .. }
            | ChatEvent::MessageDeleted { created_at, .. }
            | ChatEvent::MessageRead { created_at, .. }
            | ChatEvent::ReactionNew { created_at, .. }
            | ChatEvent::ReactionUpdated { created_at, .. }
            | ChatEvent::ReactionDeleted { created_at, .. }
            | ChatEvent::MemberAdded { created_at, .. }
            | ChatEvent::MemberUpdated { created_at, .. }
            | ChatEvent::MemberRemoved { created_at, .. }
            | ChatEvent::ChannelUpdated { created_at, .. }
            | ChatEvent::ChannelDeleted { created_at, .. }
            | ChatEvent::ChannelTruncated { created_at, .. }
            | ChatEvent::ChannelHidden { created_at, .. }
            | ChatEvent::ChannelVisible { created_at, .. }
            | ChatEvent::ChannelUserBanned { created_at, .. }
            | ChatEvent::ChannelUserUnbanned { created_at, .. }
            | ChatEvent::GlobalUserBanned { created_at, .. }
            | ChatEvent::GlobalUserUnbanned { created_at, .. }
            | ChatEvent::UserUpdated { created_at, .. }
            | ChatEvent::UserPresenceChanged { created_at, .. }
            | ChatEvent::TypingStart { created_at, .. }
            | ChatEvent::TypingStop { created_at, .. }
            | ChatEvent::NotificationMessageNew { created_at, .. }
            | ChatEvent::NotificationMarkRead { created_at, .. }
            | ChatEvent::MarkAllRead { created_at, .. }
            | ChatEvent::NotificationAddedToChannel { created_at, .. }
            | ChatEvent::NotificationRemovedFromChannel { created_at, .. }
            | ChatEvent::NotificationInvited { created_at, .. }
            | ChatEvent::NotificationInviteAccepted { created_at, .. }
            | ChatEvent::NotificationInviteRejected { created_at, .. }
            | ChatEvent::NotificationChannelDeleted { created_at, .. }
            | ChatEvent::NotificationChannelTruncated { created_at, .. }
            | ChatEvent::NotificationMutesUpdated { created_at, .. }
            | ChatEvent::NotificationChannelMutesUpdated { created_at, .. } => *created_at,
        }
    }

    /// Channel scope of the event, if it has one.
    pub fn cid(&self) -> Option<&Cid> {
        match self {
            ChatEvent::MessageNew { cid, .. }
            | ChatEvent::MessageUpdated { cid, .. }
            | ChatEvent::MessageDeleted { cid, .. }
            | ChatEvent::MessageRead { cid, .. }
            | ChatEvent::ReactionNew { cid, .. }
            | ChatEvent::ReactionUpdated { cid, .. }
            | ChatEvent::ReactionDeleted { cid, .. }
            | ChatEvent::MemberAdded { cid, .. }
            | ChatEvent::MemberUpdated { cid, .. }
            | ChatEvent::MemberRemoved { cid, .. }
            | ChatEvent::ChannelUpdated { cid, .. }
            | ChatEvent::ChannelDeleted { cid, .. }
            | ChatEvent::ChannelTruncated { cid, .. }
            | ChatEvent::ChannelHidden { cid, .. }
            | ChatEvent::ChannelVisible { cid, .. }
            | ChatEvent::ChannelUserBanned { cid, .. }
            | ChatEvent::ChannelUserUnbanned { cid, .. }
            | ChatEvent::TypingStart { cid, .. }
            | ChatEvent::TypingStop { cid, .. }
            | ChatEvent::NotificationMessageNew { cid, .. }
            | ChatEvent::NotificationMarkRead { cid, .. }
            | ChatEvent::NotificationAddedToChannel { cid, .. }
            | ChatEvent::NotificationRemovedFromChannel { cid, .. }
            | ChatEvent::NotificationInvited { cid, .. }
            | ChatEvent::NotificationInviteAccepted { cid, .. }
            | ChatEvent::NotificationInviteRejected { cid, .. }
            | ChatEvent::NotificationChannelDeleted { cid, .. }
            | ChatEvent::NotificationChannelTruncated { cid, .. } => Some(cid),
            ChatEvent::Connected { .. }
            | ChatEvent::Disconnected { .. }
            | ChatEvent::HealthCheck { .. }
            | ChatEvent::GlobalUserBanned { .. }
            | ChatEvent::GlobalUserUnbanned { .. }
            | ChatEvent::UserUpdated { .. }
            | ChatEvent::UserPresenceChanged { .. }
            | ChatEvent::MarkAllRead { .. }
            | ChatEvent::NotificationMutesUpdated { .. }
            | ChatEvent::NotificationChannelMutesUpdated { .. } => None,
        }
    }

    /// The acting or affected user carried by the event.
    pub fn user(&self) -> Option<&User> {
        match self {
            ChatEvent::MessageNew { user, .. }
            | ChatEvent::MessageUpdated { user, .. }
            | ChatEvent::MessageRead { user, .. }
            | ChatEvent::ReactionNew { user, .. }
            | ChatEvent::ReactionUpdated { user, .. }
            | ChatEvent::ReactionDeleted { user, .. }
            | ChatEvent::MemberAdded { user, .. }
            | ChatEvent::MemberUpdated { user, .. }
            | ChatEvent::MemberRemoved { user, .. }
            | ChatEvent::ChannelHidden { user, .. }
            | ChatEvent::ChannelVisible { user, .. }
            | ChatEvent::ChannelUserBanned { user, .. }
            | ChatEvent::ChannelUserUnbanned { user, .. }
            | ChatEvent::GlobalUserBanned { user, .. }
            | ChatEvent::GlobalUserUnbanned { user, .. }
            | ChatEvent::UserUpdated { user, .. }
            | ChatEvent::UserPresenceChanged { user, .. }
            | ChatEvent::TypingStart { user, .. }
            | ChatEvent::TypingStop { user, .. }
            | ChatEvent::NotificationMarkRead { user, .. }
            | ChatEvent::MarkAllRead { user, .. }
            | ChatEvent::NotificationRemovedFromChannel { user, .. }
            | ChatEvent::NotificationInvited { user, .. }
            | ChatEvent::NotificationInviteAccepted { user, .. }
            | ChatEvent::NotificationInviteRejected { user, .. } => Some(user),
            ChatEvent::MessageDeleted { user, .. }
            | ChatEvent::ChannelUpdated { user, .. }
            | ChatEvent::ChannelDeleted { user, .. }
            | ChatEvent::ChannelTruncated { user, .. } => user.as_ref(),
            ChatEvent::Connected { .. }
            | ChatEvent::Disconnected { .. }
            | ChatEvent::HealthCheck { .. }
            | ChatEvent::NotificationMessageNew { .. }
            | ChatEvent::NotificationAddedToChannel { .. }
            | ChatEvent::NotificationChannelDeleted { .. }
            | ChatEvent::NotificationChannelTruncated { .. }
            | ChatEvent::NotificationMutesUpdated { .. }
            | ChatEvent::NotificationChannelMutesUpdated { .. } => None,
        }
    }

    /// The authenticated user snapshot carried by "me"-scoped events.
    pub fn me(&self) -> Option<&User> {
        match self {
            ChatEvent::Connected { me, .. }
            | ChatEvent::NotificationMutesUpdated { me, .. }
            | ChatEvent::NotificationChannelMutesUpdated { me, .. } => Some(me),
            _ => None,
        }
    }

    /// Id of the message the event touches, used to prefetch stored copies.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            ChatEvent::ReactionNew { reaction, .. } | ChatEvent::ReactionDeleted { reaction, .. } => {
                Some(&reaction.message_id)
            }
            ChatEvent::MessageNew { message, .. }
            | ChatEvent::MessageUpdated { message, .. }
            | ChatEvent::MessageDeleted { message, .. }
            | ChatEvent::NotificationMessageNew { message, .. }
            | ChatEvent::ReactionUpdated { message, .. } => Some(&message.id),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ChatEvent::Connected { .. } => "health.check.connected",
            ChatEvent::Disconnected { .. } => "connection.disconnected",
            ChatEvent::HealthCheck { .. } => "health.check",
            ChatEvent::MessageNew { .. } => "message.new",
            ChatEvent::MessageUpdated { .. } => "message.updated",
            ChatEvent::MessageDeleted { .. } => "message.deleted",
            ChatEvent::MessageRead { .. } => "message.read",
            ChatEvent::ReactionNew { .. } => "reaction.new",
            ChatEvent::ReactionUpdated { .. } => "reaction.updated",
            ChatEvent::ReactionDeleted { .. } => "reaction.deleted",
            ChatEvent::MemberAdded { .. } => "member.added",
            ChatEvent::MemberUpdated { .. } => "member.updated",
            ChatEvent::MemberRemoved { .. } => "member.removed",
            ChatEvent::ChannelUpdated { .. } => "channel.updated",
            ChatEvent::ChannelDeleted { .. } => "channel.deleted",
            ChatEvent::ChannelTruncated { .. } => "channel.truncated",
            ChatEvent::ChannelHidden { .. } => "channel.hidden",
            ChatEvent::ChannelVisible { .. } => "channel.visible",
            ChatEvent::ChannelUserBanned { .. } => "user.banned",
            ChatEvent::ChannelUserUnbanned { .. } => "user.unbanned",
            ChatEvent::GlobalUserBanned { .. } => "user.banned.global",
            ChatEvent::GlobalUserUnbanned { .. } => "user.unbanned.global",
            ChatEvent::UserUpdated { .. } => "user.updated",
            ChatEvent::UserPresenceChanged { .. } => "user.presence.changed",
            ChatEvent::TypingStart { .. } => "typing.start",
            ChatEvent::TypingStop { .. } => "typing.stop",
            ChatEvent::NotificationMessageNew { .. } => "notification.message_new",
            ChatEvent::NotificationMarkRead { .. } => "notification.mark_read",
            ChatEvent::MarkAllRead { .. } => "notification.mark_all_read",
            ChatEvent::NotificationAddedToChannel { .. } => "notification.added_to_channel",
            ChatEvent::NotificationRemovedFromChannel { .. } => {
                "notification.removed_from_channel"
            }
            ChatEvent::NotificationInvited { .. } => "notification.invited",
            ChatEvent::NotificationInviteAccepted { .. } => "notification.invite_accepted",
            ChatEvent::NotificationInviteRejected { .. } => "notification.invite_rejected",
            ChatEvent::NotificationChannelDeleted { .. } => "notification.channel_deleted",
            ChatEvent::NotificationChannelTruncated { .. } => "notification.channel_truncated",
            ChatEvent::NotificationMutesUpdated { .. } => "notification.mutes_updated",
            ChatEvent::NotificationChannelMutesUpdated { .. } => {
                "notification.channel_mutes_updated"
            }
        }
    }

    /// Connection lifecycle events are always processed on their own.
    pub fn is_connection_lifecycle(&self) -> bool {
        matches!(
            self,
            ChatEvent::Connected { .. }
                | ChatEvent::Disconnected { .. }
                | ChatEvent::HealthCheck { .. }
        )
    }
}

/// Stable sort by `created_at`; ties keep their arrival order.
pub fn sort_by_created_at(events: &mut [ChatEvent]) {
    events.sort_by_key(ChatEvent::created_at);
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("time") + Duration::seconds(seconds)
    }

    fn typing(seconds: i64, user: &str) -> ChatEvent {
        ChatEvent::TypingStart {
            created_at: at(seconds),
            cid: "messaging:1".parse().expect("cid"),
            user: User::new(user),
        }
    }

    #[test]
    fn parses_internally_tagged_events() {
        let raw = r#"{
            "type": "message_read",
            "created_at": "2023-11-14T22:13:20Z",
            "cid": "messaging:general",
            "user": { "id": "jc" }
        }"#;
        let event: ChatEvent = serde_json::from_str(raw).expect("event");
        assert_eq!(event.event_type(), "message.read");
        assert_eq!(event.cid().map(ToString::to_string).as_deref(), Some("messaging:general"));
        assert_eq!(event.user().map(|u| u.id.as_str()), Some("jc"));
    }

    #[test]
    fn sort_is_stable_and_idempotent() {
        let mut events = vec![
            typing(3, "c"),
            typing(1, "a"),
            typing(3, "d"),
            typing(1, "b"),
            typing(2, "e"),
        ];
        sort_by_created_at(&mut events);
        let once = events.clone();
        sort_by_created_at(&mut events);
        sort_by_created_at(&mut events);
        assert_eq!(events, once);

        let order: Vec<&str> = events
            .iter()
            .filter_map(|e| e.user().map(|u| u.id.as_str()))
            .collect();
        assert_eq!(order, vec!["a", "b", "e", "c", "d"]);
    }

    #[test]
    fn lifecycle_events_have_no_channel_scope() {
        let event = ChatEvent::HealthCheck {
            created_at: at(0),
            connection_id: ConnectionId::from("conn"),
        };
        assert!(event.is_connection_lifecycle());
        assert!(event.cid().is_none());
        assert!(!typing(0, "a").is_connection_lifecycle());
    }
}
