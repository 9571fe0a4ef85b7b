use std::{collections::BTreeMap, sync::Arc};

use shared::domain::Cid;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    channel::{ChannelLogic, ChannelState},
    global_state::GlobalState,
    query::{QueryChannelsLogic, QueryChannelsState, QueryFilter},
};

/// Owns the logic units of every active channel and query. Asking for a
/// unit creates it and marks it active.
pub struct LogicRegistry {
    global_state: Arc<GlobalState>,
    channels: RwLock<BTreeMap<Cid, Arc<ChannelLogic>>>,
    queries: RwLock<BTreeMap<QueryFilter, Arc<QueryChannelsLogic>>>,
}

impl LogicRegistry {
    pub fn new(global_state: Arc<GlobalState>) -> Self {
        Self {
            global_state,
            channels: RwLock::new(BTreeMap::new()),
            queries: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn channel(&self, cid: &Cid) -> Arc<ChannelLogic> {
        if let Some(logic) = self.channels.read().await.get(cid) {
            return Arc::clone(logic);
        }
        let mut channels = self.channels.write().await;
        Arc::clone(channels.entry(cid.clone()).or_insert_with(|| {
            debug!(cid = %cid, "registry: channel activated");
            Arc::new(ChannelLogic::new(
                cid.clone(),
                Arc::clone(&self.global_state),
            ))
        }))
    }

    pub async fn is_active_channel(&self, cid: &Cid) -> bool {
        self.channels.read().await.contains_key(cid)
    }

    pub async fn active_channels(&self) -> Vec<Arc<ChannelLogic>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn active_cids(&self) -> Vec<Cid> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn query_channels(&self, filter: &QueryFilter) -> Arc<QueryChannelsLogic> {
        if let Some(logic) = self.queries.read().await.get(filter) {
            return Arc::clone(logic);
        }
        let mut queries = self.queries.write().await;
        Arc::clone(queries.entry(filter.clone()).or_insert_with(|| {
            Arc::new(QueryChannelsLogic::new(
                filter.clone(),
                Arc::clone(&self.global_state),
            ))
        }))
    }

    pub async fn active_queries(&self) -> Vec<Arc<QueryChannelsLogic>> {
        self.queries.read().await.values().cloned().collect()
    }

    pub async fn remove_channel(&self, cid: &Cid) {
        self.channels.write().await.remove(cid);
    }

    pub async fn remove_query(&self, filter: &QueryFilter) {
        self.queries.write().await.remove(filter);
    }

    pub async fn clear(&self) {
        self.channels.write().await.clear();
        self.queries.write().await.clear();
    }
}

/// Read-only side of [`LogicRegistry`].
#[derive(Clone)]
pub struct StateRegistry {
    logic: Arc<LogicRegistry>,
}

impl StateRegistry {
    pub fn new(logic: Arc<LogicRegistry>) -> Self {
        Self { logic }
    }

    pub async fn channel(&self, cid: &Cid) -> ChannelState {
        self.logic.channel(cid).await.state()
    }

    pub async fn active_channel_states(&self) -> Vec<ChannelState> {
        self.logic
            .active_channels()
            .await
            .iter()
            .map(|logic| logic.state())
            .collect()
    }

    pub async fn query_channels(&self, filter: &QueryFilter) -> QueryChannelsState {
        self.logic.query_channels(filter).await.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requesting_a_channel_activates_it_once() {
        let registry = Arc::new(LogicRegistry::new(Arc::new(GlobalState::new())));
        let cid: Cid = "messaging:1".parse().expect("cid");
        assert!(!registry.is_active_channel(&cid).await);

        let first = registry.channel(&cid).await;
        let second = registry.channel(&cid).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_active_channel(&cid).await);
        assert_eq!(registry.active_cids().await, vec![cid.clone()]);

        let states = StateRegistry::new(Arc::clone(&registry));
        assert_eq!(states.active_channel_states().await.len(), 1);

        registry.remove_channel(&cid).await;
        assert!(registry.active_channels().await.is_empty());
    }

    #[tokio::test]
    async fn queries_are_keyed_by_filter() {
        let registry = LogicRegistry::new(Arc::new(GlobalState::new()));
        registry.query_channels(&QueryFilter::all()).await;
        registry
            .query_channels(&QueryFilter::channel_type("messaging"))
            .await;
        registry.query_channels(&QueryFilter::all()).await;
        assert_eq!(registry.active_queries().await.len(), 2);

        registry.clear().await;
        assert!(registry.active_queries().await.is_empty());
    }
}
