//! In-memory store
//!
//! Keeps resources as JSON specs in an ordered map and broadcasts a
//! `StoreEvent` for every committed change.

use async_trait::async_trait;
use chrono::Utc;
use keelson_common::{Metadata, Namespace, RawResource, Resource, ResourceKind};
use std::collections::BTreeMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{ChangeType, LabelQuery, Mutator, Reader, Store, StoreEvent};
use crate::error::{StoreError, StoreResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type ResourceKey = (Namespace, ResourceKind, String);

/// Store backed by process memory
pub struct MemoryStore {
    resources: RwLock<BTreeMap<ResourceKey, RawResource>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            resources: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Number of stored resources across all namespaces
    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }

    fn notify(&self, namespace: Namespace, kind: ResourceKind, id: &str, change: ChangeType) {
        // no subscribers is fine
        let _ = self.events.send(StoreEvent {
            namespace,
            kind,
            id: id.to_string(),
            change,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reader for MemoryStore {
    async fn get_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        id: &str,
    ) -> StoreResult<RawResource> {
        let resources = self.resources.read().await;

        resources
            .get(&(namespace, kind, id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace,
                kind,
                id: id.to_string(),
            })
    }

    async fn list_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        query: &LabelQuery,
    ) -> StoreResult<Vec<RawResource>> {
        let resources = self.resources.read().await;

        Ok(resources
            .iter()
            .filter(|((ns, k, _), res)| {
                *ns == namespace && *k == kind && query.matches(&res.metadata.labels)
            })
            .map(|(_, res)| res.clone())
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn modify_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        id: &str,
        mutate: Mutator<'_>,
    ) -> StoreResult<RawResource> {
        let key = (namespace, kind, id.to_string());
        let mut resources = self.resources.write().await;

        let existing = resources.get(&key).cloned();
        let mut working = existing.clone().unwrap_or_else(|| Resource {
            metadata: Metadata::new(namespace, kind, id),
            spec: serde_json::Value::Null,
        });

        mutate(&mut working)?;

        // identity fields are owned by the store
        working.metadata.namespace = namespace;
        working.metadata.kind = kind;
        working.metadata.id = id.to_string();

        let change = match &existing {
            Some(current)
                if current.spec == working.spec
                    && current.metadata.labels == working.metadata.labels =>
            {
                debug!(kind = %kind, namespace = %namespace, id = id, "Resource unchanged");
                return Ok(current.clone());
            }
            Some(current) => {
                working.metadata.version = current.metadata.version + 1;
                working.metadata.created_at = current.metadata.created_at;
                working.metadata.updated_at = Utc::now();
                ChangeType::Updated
            }
            None => {
                let now = Utc::now();
                working.metadata.version = 1;
                working.metadata.created_at = now;
                working.metadata.updated_at = now;
                ChangeType::Created
            }
        };

        resources.insert(key, working.clone());
        drop(resources);

        self.notify(namespace, kind, id, change);

        Ok(working)
    }

    async fn destroy_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        id: &str,
    ) -> StoreResult<()> {
        let mut resources = self.resources.write().await;

        if resources.remove(&(namespace, kind, id.to_string())).is_none() {
            return Err(StoreError::NotFound {
                namespace,
                kind,
                id: id.to_string(),
            });
        }
        drop(resources);

        self.notify(namespace, kind, id, ChangeType::Destroyed);

        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
