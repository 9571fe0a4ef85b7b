use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ConnectionId);

pub const CAPABILITY_READ_EVENTS: &str = "read-events";
pub const CAPABILITY_TYPING_EVENTS: &str = "typing-events";
pub const CAPABILITY_SEND_REACTION: &str = "send-reaction";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cid '{0}': expected <type>:<id>")]
pub struct CidParseError(pub String);

/// Composite channel identifier, serialized as `"<type>:<id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid {
    channel_type: String,
    channel_id: String,
}

impl Cid {
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once(':') {
            Some((channel_type, channel_id))
                if !channel_type.is_empty() && !channel_id.is_empty() =>
            {
                Ok(Self::new(channel_type, channel_id))
            }
            _ => Err(CidParseError(raw.to_string())),
        }
    }
}

impl TryFrom<String> for Cid {
    type Error = CidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cid> for String {
    fn from(value: Cid) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.channel_id)
    }
}

/// Local synchronization status of an entity that may have been created offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Completed,
    SyncNeeded,
    InProgress,
    FailedPermanently,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::SyncNeeded => "sync_needed",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::FailedPermanently => "failed_permanently",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(SyncStatus::Completed),
            "sync_needed" => Some(SyncStatus::SyncNeeded),
            "in_progress" => Some(SyncStatus::InProgress),
            "failed_permanently" => Some(SyncStatus::FailedPermanently),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMute {
    pub cid: Cid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub image: String,
    pub role: String,
    pub online: bool,
    pub invisible: bool,
    pub banned: bool,
    pub last_active: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub total_unread_count: i32,
    pub unread_channels: i32,
    pub mutes: Vec<UserId>,
    pub channel_mutes: Vec<ChannelMute>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub reaction_type: String,
    pub score: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub enforce_unique: bool,
    pub sync_status: SyncStatus,
}

impl Reaction {
    pub fn new(
        message_id: impl Into<String>,
        user_id: impl Into<String>,
        reaction_type: impl Into<String>,
    ) -> Self {
        Self {
            message_id: MessageId::new(message_id),
            user_id: UserId::new(user_id),
            reaction_type: reaction_type.into(),
            score: 1,
            ..Self::default()
        }
    }

    fn merge_key(&self) -> (&UserId, &str) {
        (&self.user_id, self.reaction_type.as_str())
    }
}

/// Merges `recent` into `cached`, keyed by user and reaction type. Entries
/// from `recent` replace cached ones; cached order is kept for the rest.
pub fn merge_reactions(
    recent: impl IntoIterator<Item = Reaction>,
    cached: impl IntoIterator<Item = Reaction>,
) -> Vec<Reaction> {
    let mut merged: Vec<Reaction> = cached.into_iter().collect();
    for reaction in recent {
        match merged
            .iter()
            .position(|existing| existing.merge_key() == reaction.merge_key())
        {
            Some(index) => merged[index] = reaction,
            None => merged.push(reaction),
        }
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default)]
    pub cid: Option<Cid>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: User,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    #[serde(default)]
    pub reply_count: i32,
    #[serde(default)]
    pub latest_reactions: Vec<Reaction>,
    #[serde(default)]
    pub own_reactions: Vec<Reaction>,
    #[serde(default)]
    pub reaction_counts: BTreeMap<String, i32>,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        user: User,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(id),
            cid: None,
            text: text.into(),
            user,
            created_at,
            updated_at: None,
            deleted_at: None,
            parent_id: None,
            reply_count: 0,
            latest_reactions: Vec::new(),
            own_reactions: Vec::new(),
            reaction_counts: BTreeMap::new(),
            sync_status: SyncStatus::Completed,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    pub user: User,
    pub role: String,
    pub banned: bool,
    pub shadow_banned: bool,
    pub invited: bool,
    pub invite_accepted_at: Option<DateTime<Utc>>,
    pub invite_rejected_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(user: User) -> Self {
        Self {
            user,
            role: "channel_member".to_string(),
            ..Self::default()
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelUserRead {
    pub user: User,
    pub last_read: DateTime<Utc>,
    #[serde(default)]
    pub unread_messages: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub cid: Cid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub hidden_messages_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub member_count: i32,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub membership: Option<Member>,
    #[serde(default)]
    pub reads: Vec<ChannelUserRead>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub watcher_count: i32,
    #[serde(default)]
    pub own_capabilities: BTreeSet<String>,
}

impl Channel {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            name: String::new(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
            last_message_at: None,
            hidden: false,
            hidden_messages_before: None,
            frozen: false,
            member_count: 0,
            members: Vec::new(),
            membership: None,
            reads: Vec::new(),
            messages: Vec::new(),
            watcher_count: 0,
            own_capabilities: BTreeSet::new(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.own_capabilities.contains(capability)
    }

    pub fn without_messages(&self) -> Self {
        Self {
            messages: Vec::new(),
            ..self.clone()
        }
    }

    pub fn has_member(&self, user_id: &UserId) -> bool {
        self.members.iter().any(|member| member.user_id() == user_id)
    }

    pub fn add_member(mut self, member: Member) -> Self {
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
        self
    }

    pub fn update_member(mut self, member: Member) -> Self {
        if let Some(existing) = self
            .members
            .iter_mut()
            .find(|existing| existing.user_id() == member.user_id())
        {
            *existing = member;
        }
        self
    }

    pub fn remove_member(mut self, user_id: &UserId) -> Self {
        let before = self.members.len();
        self.members.retain(|member| member.user_id() != user_id);
        if self.members.len() < before {
            self.member_count = (self.member_count - 1).max(0);
        }
        self
    }

    pub fn update_member_banned(mut self, user_id: &UserId, banned: bool) -> Self {
        for member in self.members.iter_mut().filter(|m| m.user_id() == user_id) {
            member.banned = banned;
        }
        self
    }

    pub fn add_membership(mut self, current_user_id: &UserId, member: Member) -> Self {
        if member.user_id() == current_user_id {
            self.membership = Some(member);
        }
        self
    }

    pub fn update_membership(mut self, member: Member) -> Self {
        if self
            .membership
            .as_ref()
            .is_some_and(|membership| membership.user_id() == member.user_id())
        {
            self.membership = Some(member);
        }
        self
    }

    pub fn update_membership_banned(mut self, user_id: &UserId, banned: bool) -> Self {
        if let Some(membership) = self
            .membership
            .as_mut()
            .filter(|membership| membership.user_id() == user_id)
        {
            membership.banned = banned;
        }
        self
    }

    pub fn remove_membership(mut self, current_user_id: &UserId) -> Self {
        if self
            .membership
            .as_ref()
            .is_some_and(|membership| membership.user_id() == current_user_id)
        {
            self.membership = None;
        }
        self
    }

    pub fn update_reads(&mut self, read: ChannelUserRead) {
        match self
            .reads
            .iter_mut()
            .find(|existing| existing.user.id == read.user.id)
        {
            Some(existing) => *existing = read,
            None => self.reads.push(read),
        }
    }
}

/// Per-channel-type feature flags cached from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub channel_type: String,
    pub read_events: bool,
    pub typing_events: bool,
    pub reactions: bool,
    pub replies: bool,
    pub mutes: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Durable checkpoint used to request only events newer than the last
/// reconciled point after a reconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub user_id: UserId,
    pub last_synced_at: BTreeMap<Cid, DateTime<Utc>>,
    pub marked_all_read_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(raw: &str) -> Cid {
        raw.parse().expect("cid")
    }

    #[test]
    fn parses_and_formats_cid() {
        let parsed = cid("messaging:general");
        assert_eq!(parsed.channel_type(), "messaging");
        assert_eq!(parsed.channel_id(), "general");
        assert_eq!(parsed.to_string(), "messaging:general");
    }

    #[test]
    fn cid_keeps_colons_in_channel_id() {
        let parsed = cid("livestream:a:b");
        assert_eq!(parsed.channel_type(), "livestream");
        assert_eq!(parsed.channel_id(), "a:b");
    }

    #[test]
    fn rejects_malformed_cids() {
        assert!("messaging".parse::<Cid>().is_err());
        assert!(":general".parse::<Cid>().is_err());
        assert!("messaging:".parse::<Cid>().is_err());
    }

    #[test]
    fn cid_serializes_as_plain_string() {
        let json = serde_json::to_string(&cid("messaging:1")).expect("json");
        assert_eq!(json, "\"messaging:1\"");
        let back: Cid = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, cid("messaging:1"));
        assert!(serde_json::from_str::<Cid>("\"bogus\"").is_err());
    }

    #[test]
    fn sync_state_round_trips_cid_keyed_checkpoints() {
        let mut state = SyncState::new(UserId::from("jc"));
        state.last_synced_at.insert(cid("messaging:1"), Utc::now());
        let json = serde_json::to_string(&state).expect("json");
        let back: SyncState = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, state);
    }

    #[test]
    fn merge_reactions_prefers_recent_entries() {
        let mut cached = Reaction::new("m1", "a", "like");
        cached.score = 1;
        let mut recent = Reaction::new("m1", "a", "like");
        recent.score = 3;
        let other = Reaction::new("m1", "a", "love");

        let merged = merge_reactions(vec![recent.clone(), other.clone()], vec![cached]);
        assert_eq!(merged, vec![recent, other]);
    }

    #[test]
    fn member_mutations_track_count_and_membership() {
        let alice = User::new("alice");
        let bob = User::new("bob");
        let channel = Channel::new(cid("messaging:1"))
            .add_member(Member::new(alice.clone()))
            .add_member(Member::new(bob.clone()))
            .add_member(Member::new(bob.clone()))
            .add_membership(&alice.id, Member::new(alice.clone()));
        assert_eq!(channel.member_count, 2);
        assert!(channel.membership.is_some());

        let channel = channel
            .update_member_banned(&bob.id, true)
            .update_membership_banned(&alice.id, true);
        assert!(channel.members.iter().any(|m| m.user.id == bob.id && m.banned));
        assert!(channel.membership.as_ref().is_some_and(|m| m.banned));

        let channel = channel.remove_member(&bob.id).remove_membership(&bob.id);
        assert_eq!(channel.member_count, 1);
        assert!(channel.membership.is_some());
        let channel = channel.remove_membership(&alice.id);
        assert!(channel.membership.is_none());
    }

    #[test]
    fn update_reads_replaces_existing_entry() {
        let mut channel = Channel::new(cid("messaging:1"));
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(5);
        channel.update_reads(ChannelUserRead {
            user: User::new("a"),
            last_read: first,
            unread_messages: 2,
        });
        channel.update_reads(ChannelUserRead {
            user: User::new("a"),
            last_read: later,
            unread_messages: 0,
        });
        assert_eq!(channel.reads.len(), 1);
        assert_eq!(channel.reads[0].last_read, later);
    }
}
