use shared::domain::{ChannelMute, User, UserId};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    UserSet,
    Connected,
    Disconnected,
}

/// A self-user snapshot. `Full` carries mutes and unread counts, `Part`
/// only profile fields.
#[derive(Debug, Clone)]
pub enum SelfUser {
    Full(User),
    Part(User),
}

/// Process-wide session state. Written only by the event handler; everything
/// else subscribes.
pub struct GlobalState {
    user: watch::Sender<Option<User>>,
    total_unread_count: watch::Sender<i32>,
    channel_unread_count: watch::Sender<i32>,
    channel_mutes: watch::Sender<Vec<ChannelMute>>,
    muted_users: watch::Sender<Vec<UserId>>,
    session: watch::Sender<SessionState>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            user: watch::channel(None).0,
            total_unread_count: watch::channel(0).0,
            channel_unread_count: watch::channel(0).0,
            channel_mutes: watch::channel(Vec::new()).0,
            muted_users: watch::channel(Vec::new()).0,
            session: watch::channel(SessionState::Idle).0,
        }
    }

    pub fn set_user(&self, user: User) {
        self.user.send_replace(Some(user));
        self.session.send_replace(SessionState::UserSet);
    }

    pub fn update_current_user(&self, self_user: SelfUser) {
        match self_user {
            SelfUser::Full(me) => {
                self.total_unread_count.send_replace(me.total_unread_count);
                self.channel_unread_count.send_replace(me.unread_channels);
                self.channel_mutes.send_replace(me.channel_mutes.clone());
                self.muted_users.send_replace(me.mutes.clone());
                self.user.send_replace(Some(me));
            }
            SelfUser::Part(me) => {
                self.user.send_modify(|current| {
                    let merged = match current.take() {
                        Some(previous) => User {
                            total_unread_count: previous.total_unread_count,
                            unread_channels: previous.unread_channels,
                            mutes: previous.mutes,
                            channel_mutes: previous.channel_mutes,
                            ..me
                        },
                        None => me,
                    };
                    *current = Some(merged);
                });
            }
        }
    }

    pub fn set_total_unread_count(&self, count: i32) {
        self.total_unread_count.send_replace(count);
    }

    pub fn set_channel_unread_count(&self, count: i32) {
        self.channel_unread_count.send_replace(count);
    }

    pub fn set_session_state(&self, state: SessionState) {
        self.session.send_replace(state);
    }

    /// Resets every container to its initial value.
    pub fn clear_state(&self) {
        self.user.send_replace(None);
        self.total_unread_count.send_replace(0);
        self.channel_unread_count.send_replace(0);
        self.channel_mutes.send_replace(Vec::new());
        self.muted_users.send_replace(Vec::new());
        self.session.send_replace(SessionState::Idle);
    }

    pub fn user(&self) -> Option<User> {
        self.user.borrow().clone()
    }

    pub fn total_unread_count(&self) -> i32 {
        *self.total_unread_count.borrow()
    }

    pub fn channel_unread_count(&self) -> i32 {
        *self.channel_unread_count.borrow()
    }

    pub fn channel_mutes(&self) -> Vec<ChannelMute> {
        self.channel_mutes.borrow().clone()
    }

    pub fn muted_users(&self) -> Vec<UserId> {
        self.muted_users.borrow().clone()
    }

    pub fn session_state(&self) -> SessionState {
        *self.session.borrow()
    }

    pub fn subscribe_user(&self) -> watch::Receiver<Option<User>> {
        self.user.subscribe()
    }

    pub fn subscribe_total_unread_count(&self) -> watch::Receiver<i32> {
        self.total_unread_count.subscribe()
    }

    pub fn subscribe_channel_unread_count(&self) -> watch::Receiver<i32> {
        self.channel_unread_count.subscribe()
    }

    pub fn subscribe_session_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }
}
