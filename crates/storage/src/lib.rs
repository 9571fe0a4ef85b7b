use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use shared::domain::{
    Channel, ChannelConfig, Cid, Message, MessageId, Reaction, SyncState, SyncStatus, User, UserId,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite, Transaction,
};
use tracing::debug;

mod repository;

pub use repository::{BatchWrite, Deletion, Repository};

const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

/// SQLite-backed offline cache. Channels read through an in-process cache
/// that individual operations can evict.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    channel_cache: Arc<RwLock<HashMap<Cid, Channel>>>,
    channel_configs: Arc<RwLock<HashMap<String, ChannelConfig>>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every connection to an in-memory url opens its own database
        let pool_options = if database_url.starts_with(MEMORY_DATABASE_URL) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            channel_cache: Arc::new(RwLock::new(HashMap::new())),
            channel_configs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub fn is_channel_cached(&self, cid: &Cid) -> bool {
        self.channel_cache
            .read()
            .map(|cache| cache.contains_key(cid))
            .unwrap_or(false)
    }

    fn cached_channel(&self, cid: &Cid) -> Option<Channel> {
        self.channel_cache
            .read()
            .ok()
            .and_then(|cache| cache.get(cid).cloned())
    }

    fn cache_channels(&self, channels: impl IntoIterator<Item = Channel>) {
        if let Ok(mut cache) = self.channel_cache.write() {
            for channel in channels {
                cache.insert(channel.cid.clone(), channel);
            }
        }
    }

    fn evict_cached_channel(&self, cid: &Cid) {
        if let Ok(mut cache) = self.channel_cache.write() {
            cache.remove(cid);
        }
    }

    async fn load_channel(&self, cid: &Cid) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT data FROM channels WHERE cid = ?")
            .bind(cid.to_string())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to select channel {cid}"))?;
        row.map(|row| decode_row::<Channel>(&row)).transpose()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to encode json column")
}

fn decode_row<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T> {
    let raw: String = row.try_get("data")?;
    serde_json::from_str(&raw).context("failed to decode json column")
}

/// Timestamp columns hold microseconds since the epoch.
fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

async fn upsert_user(tx: &mut Transaction<'_, Sqlite>, user: &User) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (id, data) VALUES (?, ?)
         ON CONFLICT(id) DO UPDATE SET data = excluded.data",
    )
    .bind(user.id.as_str())
    .bind(encode(user)?)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to upsert user {}", user.id))?;
    Ok(())
}

async fn upsert_channel(tx: &mut Transaction<'_, Sqlite>, channel: &Channel) -> Result<()> {
    sqlx::query(
        "INSERT INTO channels (cid, channel_type, deleted_at, data) VALUES (?, ?, ?, ?)
         ON CONFLICT(cid) DO UPDATE SET
            channel_type = excluded.channel_type,
            deleted_at = excluded.deleted_at,
            data = excluded.data",
    )
    .bind(channel.cid.to_string())
    .bind(channel.cid.channel_type())
    .bind(channel.deleted_at.map(micros))
    .bind(encode(channel)?)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to upsert channel {}", channel.cid))?;
    Ok(())
}

async fn upsert_message(tx: &mut Transaction<'_, Sqlite>, message: &Message) -> Result<()> {
    let cid = message
        .cid
        .as_ref()
        .ok_or_else(|| anyhow!("message {} has no cid", message.id))?;
    sqlx::query(
        "INSERT INTO messages (id, cid, created_at, deleted_at, sync_status, data)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            cid = excluded.cid,
            created_at = excluded.created_at,
            deleted_at = excluded.deleted_at,
            sync_status = excluded.sync_status,
            data = excluded.data",
    )
    .bind(message.id.as_str())
    .bind(cid.to_string())
    .bind(micros(message.created_at))
    .bind(message.deleted_at.map(micros))
    .bind(message.sync_status.as_str())
    .bind(encode(message)?)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to upsert message {}", message.id))?;
    Ok(())
}

#[async_trait]
impl Repository for Storage {
    async fn select_all_cids(&self) -> Result<Vec<Cid>> {
        let rows = sqlx::query("SELECT cid FROM channels ORDER BY cid")
            .fetch_all(&self.pool)
            .await
            .context("failed to select cids")?;
        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("cid")?;
                raw.parse::<Cid>().map_err(anyhow::Error::from)
            })
            .collect()
    }

    async fn select_channels(&self, cids: &[Cid]) -> Result<Vec<Channel>> {
        let mut channels = Vec::with_capacity(cids.len());
        let mut loaded = Vec::new();
        for cid in cids {
            if let Some(channel) = self.cached_channel(cid) {
                channels.push(channel);
            } else if let Some(channel) = self.load_channel(cid).await? {
                loaded.push(channel.clone());
                channels.push(channel);
            }
        }
        self.cache_channels(loaded);
        Ok(channels)
    }

    async fn select_channel_messages(&self, cid: &Cid) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT data FROM messages WHERE cid = ? ORDER BY created_at, id")
            .bind(cid.to_string())
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to select messages for {cid}"))?;
        rows.iter().map(decode_row).collect()
    }

    async fn select_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT data FROM messages WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to select message {id}"))?;
            if let Some(row) = row {
                messages.push(decode_row(&row)?);
            }
        }
        Ok(messages)
    }

    async fn select_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query("SELECT data FROM users WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to select user {id}"))?;
            if let Some(row) = row {
                users.push(decode_row(&row)?);
            }
        }
        Ok(users)
    }

    async fn select_current_user(&self) -> Result<Option<User>> {
        let row = sqlx::query("SELECT data FROM own_user WHERE slot = 1")
            .fetch_optional(&self.pool)
            .await
            .context("failed to select current user")?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn insert_current_user(&self, user: &User) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO own_user (slot, user_id, data) VALUES (1, ?, ?)
             ON CONFLICT(slot) DO UPDATE SET user_id = excluded.user_id, data = excluded.data",
        )
        .bind(user.id.as_str())
        .bind(encode(user)?)
        .execute(&mut *tx)
        .await
        .context("failed to store current user")?;
        upsert_user(&mut tx, user).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_batch(&self, batch: &BatchWrite) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let channels: Vec<Channel> = batch.channels.iter().map(Channel::without_messages).collect();

        let mut tx = self.pool.begin().await?;
        for user in &batch.users {
            upsert_user(&mut tx, user).await?;
        }
        for channel in &channels {
            upsert_channel(&mut tx, channel).await?;
        }
        for message in &batch.messages {
            upsert_message(&mut tx, message).await?;
        }
        tx.commit().await.context("failed to commit batch write")?;

        debug!(
            users = batch.users.len(),
            channels = channels.len(),
            messages = batch.messages.len(),
            "storage: batch committed"
        );
        self.cache_channels(channels);
        Ok(())
    }

    async fn apply_deletions(&self, deletions: &[Deletion]) -> Result<()> {
        if deletions.is_empty() {
            return Ok(());
        }
        let mut evicted = Vec::new();
        let mut tx = self.pool.begin().await?;
        for deletion in deletions {
            match deletion {
                Deletion::MessagesBefore { cid, before } => {
                    sqlx::query("DELETE FROM messages WHERE cid = ? AND created_at < ?")
                        .bind(cid.to_string())
                        .bind(micros(*before))
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to truncate messages of {cid}"))?;
                    evicted.push(cid.clone());
                }
                Deletion::Message { message } => {
                    sqlx::query("DELETE FROM messages WHERE id = ?")
                        .bind(message.id.as_str())
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to delete message {}", message.id))?;
                    sqlx::query("DELETE FROM reactions WHERE message_id = ?")
                        .bind(message.id.as_str())
                        .execute(&mut *tx)
                        .await
                        .with_context(|| {
                            format!("failed to delete reactions of message {}", message.id)
                        })?;
                }
                Deletion::ChannelDeletedAt { cid, deleted_at } => {
                    let row = sqlx::query("SELECT data FROM channels WHERE cid = ?")
                        .bind(cid.to_string())
                        .fetch_optional(&mut *tx)
                        .await
                        .with_context(|| format!("failed to select channel {cid}"))?;
                    if let Some(row) = row {
                        let mut channel: Channel = decode_row(&row)?;
                        channel.deleted_at = Some(*deleted_at);
                        upsert_channel(&mut tx, &channel).await?;
                    }
                    evicted.push(cid.clone());
                }
                Deletion::EvictChannel { cid } => evicted.push(cid.clone()),
            }
        }
        tx.commit().await.context("failed to commit deletions")?;

        for cid in &evicted {
            self.evict_cached_channel(cid);
        }
        Ok(())
    }

    async fn cache_channel_configs(&self) -> Result<()> {
        let rows = sqlx::query("SELECT data FROM channel_configs")
            .fetch_all(&self.pool)
            .await
            .context("failed to select channel configs")?;
        let configs = rows
            .iter()
            .map(decode_row::<ChannelConfig>)
            .collect::<Result<Vec<_>>>()?;
        if let Ok(mut cache) = self.channel_configs.write() {
            cache.clear();
            for config in configs {
                cache.insert(config.channel_type.clone(), config);
            }
        }
        Ok(())
    }

    async fn select_channel_config(&self, channel_type: &str) -> Result<Option<ChannelConfig>> {
        Ok(self
            .channel_configs
            .read()
            .ok()
            .and_then(|cache| cache.get(channel_type).cloned()))
    }

    async fn insert_channel_configs(&self, configs: &[ChannelConfig]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for config in configs {
            sqlx::query(
                "INSERT INTO channel_configs (channel_type, data) VALUES (?, ?)
                 ON CONFLICT(channel_type) DO UPDATE SET data = excluded.data",
            )
            .bind(config.channel_type.as_str())
            .bind(encode(config)?)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to store config for {}", config.channel_type))?;
        }
        tx.commit().await?;

        if let Ok(mut cache) = self.channel_configs.write() {
            for config in configs {
                cache.insert(config.channel_type.clone(), config.clone());
            }
        }
        Ok(())
    }

    async fn select_sync_state(&self, user_id: &UserId) -> Result<Option<SyncState>> {
        let row = sqlx::query("SELECT data FROM sync_state WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to select sync state for {user_id}"))?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn insert_sync_state(&self, state: &SyncState) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_state (user_id, data) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET data = excluded.data",
        )
        .bind(state.user_id.as_str())
        .bind(encode(state)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store sync state for {}", state.user_id))?;
        Ok(())
    }

    async fn select_messages_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Message>> {
        let rows =
            sqlx::query("SELECT data FROM messages WHERE sync_status = ? ORDER BY created_at, id")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
                .context("failed to select messages by sync status")?;
        rows.iter().map(decode_row).collect()
    }

    async fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
        let rows = sqlx::query("SELECT data FROM reactions WHERE sync_status = ?")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .context("failed to select reactions by sync status")?;
        rows.iter().map(decode_row).collect()
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()> {
        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, reaction_type, deleted_at, sync_status, data)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id, user_id, reaction_type) DO UPDATE SET
                deleted_at = excluded.deleted_at,
                sync_status = excluded.sync_status,
                data = excluded.data",
        )
        .bind(reaction.message_id.as_str())
        .bind(reaction.user_id.as_str())
        .bind(reaction.reaction_type.as_str())
        .bind(reaction.deleted_at.map(micros))
        .bind(reaction.sync_status.as_str())
        .bind(encode(reaction)?)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to store reaction {} on message {}",
                reaction.reaction_type, reaction.message_id
            )
        })?;
        Ok(())
    }
}

/// Turns a bare path or `sqlite:` url into a `sqlite://` url and creates its
/// parent directory.
pub fn prepare_database_url(raw_database_url: &str) -> Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return MEMORY_DATABASE_URL.to_string();
    }

    if raw_database_url.starts_with(MEMORY_DATABASE_URL)
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with(MEMORY_DATABASE_URL) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
