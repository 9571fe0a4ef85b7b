use std::sync::Arc;

use shared::{domain::Cid, event::ChatEvent};
use tokio::sync::watch;
use tracing::trace;

use crate::global_state::GlobalState;

/// Channel filter of a channel-list query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryFilter {
    pub channel_type: Option<String>,
}

impl QueryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn channel_type(channel_type: impl Into<String>) -> Self {
        Self {
            channel_type: Some(channel_type.into()),
        }
    }

    pub fn matches(&self, cid: &Cid) -> bool {
        self.channel_type
            .as_deref()
            .map_or(true, |channel_type| channel_type == cid.channel_type())
    }
}

/// Keeps the ordered cid list of one channel query in step with events.
pub struct QueryChannelsLogic {
    filter: QueryFilter,
    global_state: Arc<GlobalState>,
    cids: watch::Sender<Vec<Cid>>,
}

impl QueryChannelsLogic {
    pub fn new(filter: QueryFilter, global_state: Arc<GlobalState>) -> Self {
        Self {
            filter,
            global_state,
            cids: watch::channel(Vec::new()).0,
        }
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    pub fn state(&self) -> QueryChannelsState {
        QueryChannelsState {
            receiver: self.cids.subscribe(),
        }
    }

    /// Replaces the list, e.g. with the result of a backend query.
    pub fn set_channels(&self, cids: Vec<Cid>) {
        let filtered = cids
            .into_iter()
            .filter(|cid| self.filter.matches(cid))
            .collect();
        self.cids.send_replace(filtered);
    }

    pub fn handle_events(&self, events: &[ChatEvent]) {
        let current_user_id = self.global_state.user().map(|user| user.id);
        trace!(size = events.len(), "query: handling events");
        self.cids.send_if_modified(|cids| {
            let mut modified = false;
            for event in events {
                match event {
                    ChatEvent::NotificationAddedToChannel { cid, .. }
                    | ChatEvent::NotificationMessageNew { cid, .. }
                    | ChatEvent::NotificationInviteAccepted { cid, .. }
                    | ChatEvent::MessageNew { cid, .. }
                    | ChatEvent::ChannelVisible { cid, .. } => {
                        if self.filter.matches(cid) && !cids.contains(cid) {
                            cids.push(cid.clone());
                            modified = true;
                        }
                    }
                    ChatEvent::ChannelDeleted { cid, .. }
                    | ChatEvent::NotificationChannelDeleted { cid, .. }
                    | ChatEvent::NotificationRemovedFromChannel { cid, .. }
                    | ChatEvent::ChannelHidden { cid, .. } => {
                        modified |= remove_cid(cids, cid);
                    }
                    ChatEvent::MemberRemoved { cid, user, .. } => {
                        if current_user_id.as_ref() == Some(&user.id) {
                            modified |= remove_cid(cids, cid);
                        }
                    }
                    ChatEvent::Connected { .. }
                    | ChatEvent::Disconnected { .. }
                    | ChatEvent::HealthCheck { .. }
                    | ChatEvent::MessageUpdated { .. }
                    | ChatEvent::MessageDeleted { .. }
                    | ChatEvent::MessageRead { .. }
                    | ChatEvent::ReactionNew { .. }
                    | ChatEvent::ReactionUpdated { .. }
                    | ChatEvent::ReactionDeleted { .. }
                    | ChatEvent::MemberAdded { .. }
                    | ChatEvent::MemberUpdated { .. }
                    | ChatEvent::ChannelUpdated { .. }
                    | ChatEvent::ChannelTruncated { .. }
                    | ChatEvent::ChannelUserBanned { .. }
                    | ChatEvent::ChannelUserUnbanned { .. }
                    | ChatEvent::GlobalUserBanned { .. }
                    | ChatEvent::GlobalUserUnbanned { .. }
                    | ChatEvent::UserUpdated { .. }
                    | ChatEvent::UserPresenceChanged { .. }
                    | ChatEvent::TypingStart { .. }
                    | ChatEvent::TypingStop { .. }
                    | ChatEvent::NotificationMarkRead { .. }
                    | ChatEvent::MarkAllRead { .. }
                    | ChatEvent::NotificationInvited { .. }
                    | ChatEvent::NotificationInviteRejected { .. }
                    | ChatEvent::NotificationChannelTruncated { .. }
                    | ChatEvent::NotificationMutesUpdated { .. }
                    | ChatEvent::NotificationChannelMutesUpdated { .. } => {}
                }
            }
            modified
        });
    }
}

fn remove_cid(cids: &mut Vec<Cid>, cid: &Cid) -> bool {
    let before = cids.len();
    cids.retain(|existing| existing != cid);
    cids.len() != before
}

#[derive(Clone)]
pub struct QueryChannelsState {
    receiver: watch::Receiver<Vec<Cid>>,
}

impl QueryChannelsState {
    pub fn channels(&self) -> Vec<Cid> {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Cid>> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shared::domain::{Channel, Member, Message, User};

    use super::*;

    fn cid(raw: &str) -> Cid {
        raw.parse().expect("cid")
    }

    fn message_new(raw: &str) -> ChatEvent {
        ChatEvent::MessageNew {
            created_at: Utc::now(),
            cid: cid(raw),
            user: User::new("bob"),
            message: Message::new("m1", User::new("bob"), "hi", Utc::now()),
            total_unread_count: 0,
            unread_channels: 0,
            watcher_count: 0,
        }
    }

    #[test]
    fn adds_matching_channels_once_and_removes_on_leave() {
        let global_state = Arc::new(GlobalState::new());
        global_state.set_user(User::new("jc"));
        let logic = QueryChannelsLogic::new(QueryFilter::channel_type("messaging"), global_state);
        let state = logic.state();

        logic.handle_events(&[
            message_new("messaging:1"),
            message_new("livestream:2"),
            ChatEvent::NotificationAddedToChannel {
                created_at: Utc::now(),
                cid: cid("messaging:3"),
                channel: Channel::new(cid("messaging:3")),
                member: Member::new(User::new("jc")),
            },
            message_new("messaging:1"),
        ]);
        assert_eq!(state.channels(), vec![cid("messaging:1"), cid("messaging:3")]);

        logic.handle_events(&[
            ChatEvent::MemberRemoved {
                created_at: Utc::now(),
                cid: cid("messaging:1"),
                user: User::new("someone-else"),
            },
            ChatEvent::MemberRemoved {
                created_at: Utc::now(),
                cid: cid("messaging:3"),
                user: User::new("jc"),
            },
        ]);
        assert_eq!(state.channels(), vec![cid("messaging:1")]);
    }

    #[test]
    fn unfiltered_query_accepts_every_type() {
        let logic = QueryChannelsLogic::new(QueryFilter::all(), Arc::new(GlobalState::new()));
        logic.set_channels(vec![cid("messaging:1")]);
        logic.handle_events(&[message_new("livestream:2")]);
        assert_eq!(
            logic.state().channels(),
            vec![cid("messaging:1"), cid("livestream:2")]
        );
    }

    #[test]
    fn events_that_do_not_change_membership_leave_the_list_untouched() {
        let logic = QueryChannelsLogic::new(QueryFilter::all(), Arc::new(GlobalState::new()));
        logic.set_channels(vec![cid("messaging:1")]);
        let mut receiver = logic.state().subscribe();
        receiver.borrow_and_update();

        logic.handle_events(&[
            ChatEvent::TypingStart {
                created_at: Utc::now(),
                cid: cid("messaging:2"),
                user: User::new("bob"),
            },
            ChatEvent::ChannelTruncated {
                created_at: Utc::now(),
                cid: cid("messaging:1"),
                channel: Channel::new(cid("messaging:1")),
                user: None,
            },
        ]);

        assert!(!receiver.has_changed().expect("open"));
        assert_eq!(logic.state().channels(), vec![cid("messaging:1")]);
    }
}
