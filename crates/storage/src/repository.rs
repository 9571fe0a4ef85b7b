use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{
    Channel, ChannelConfig, Cid, Message, MessageId, Reaction, SyncState, SyncStatus, User, UserId,
};

/// Upserts staged by one reconciliation pass, committed as one transaction.
#[derive(Debug, Clone, Default)]
pub struct BatchWrite {
    pub users: Vec<User>,
    pub channels: Vec<Channel>,
    pub messages: Vec<Message>,
}

impl BatchWrite {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.channels.is_empty() && self.messages.is_empty()
    }
}

/// Destructive operations applied after the upserts of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Deletion {
    MessagesBefore { cid: Cid, before: DateTime<Utc> },
    Message { message: Message },
    ChannelDeletedAt { cid: Cid, deleted_at: DateTime<Utc> },
    EvictChannel { cid: Cid },
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn select_all_cids(&self) -> Result<Vec<Cid>>;
    async fn select_channels(&self, cids: &[Cid]) -> Result<Vec<Channel>>;
    async fn select_channel_messages(&self, cid: &Cid) -> Result<Vec<Message>>;
    async fn select_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>>;
    async fn select_users(&self, ids: &[UserId]) -> Result<Vec<User>>;

    async fn select_current_user(&self) -> Result<Option<User>>;
    async fn insert_current_user(&self, user: &User) -> Result<()>;

    /// Commits every upsert in `batch` atomically.
    async fn write_batch(&self, batch: &BatchWrite) -> Result<()>;

    /// Applies every deletion atomically; cache evictions happen after commit.
    async fn apply_deletions(&self, deletions: &[Deletion]) -> Result<()>;

    async fn delete_channel_messages_before(&self, cid: &Cid, before: DateTime<Utc>) -> Result<()> {
        let deletions = [Deletion::MessagesBefore {
            cid: cid.clone(),
            before,
        }];
        self.apply_deletions(&deletions).await
    }

    async fn delete_channel_message(&self, message: &Message) -> Result<()> {
        let deletions = [Deletion::Message {
            message: message.clone(),
        }];
        self.apply_deletions(&deletions).await
    }

    async fn evict_channel(&self, cid: &Cid) -> Result<()> {
        let deletions = [Deletion::EvictChannel { cid: cid.clone() }];
        self.apply_deletions(&deletions).await
    }

    async fn set_channel_deleted_at(&self, cid: &Cid, deleted_at: DateTime<Utc>) -> Result<()> {
        let deletions = [Deletion::ChannelDeletedAt {
            cid: cid.clone(),
            deleted_at,
        }];
        self.apply_deletions(&deletions).await
    }

    async fn cache_channel_configs(&self) -> Result<()>;
    async fn select_channel_config(&self, channel_type: &str) -> Result<Option<ChannelConfig>>;
    async fn insert_channel_configs(&self, configs: &[ChannelConfig]) -> Result<()>;

    async fn select_sync_state(&self, user_id: &UserId) -> Result<Option<SyncState>>;
    async fn insert_sync_state(&self, state: &SyncState) -> Result<()>;

    async fn select_messages_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Message>>;
    async fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>>;
    async fn insert_messages(&self, messages: &[Message]) -> Result<()> {
        let batch = BatchWrite {
            messages: messages.to_vec(),
            ..BatchWrite::default()
        };
        self.write_batch(&batch).await
    }
    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()>;
}
