//! Declarative resource store contract
//!
//! Controllers read and write resources through these traits:
//! - `Reader`: get by ID and list by label query
//! - `Store`: modify-or-create, destroy and change notifications
//! - `ReaderExt` / `StoreExt`: typed helpers over the raw calls

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use keelson_common::{Namespace, RawResource, Resource, ResourceKind, ResourceSpec};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use crate::error::{StoreError, StoreResult};

/// Single label selector term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelTerm {
    Equal(String, String),
    Exists(String),
}

/// Conjunction of label terms, empty query matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelQuery {
    terms: Vec<LabelTerm>,
}

impl LabelQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn equal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Equal(key.into(), value.into()));
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Exists(key.into()));
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|term| match term {
            LabelTerm::Equal(key, value) => labels.get(key) == Some(value),
            LabelTerm::Exists(key) => labels.contains_key(key),
        })
    }
}

/// Kind of change a store event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Destroyed,
}

/// Store change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub namespace: Namespace,
    pub kind: ResourceKind,
    pub id: String,
    pub change: ChangeType,
}

/// Mutation applied by `Store::modify_raw`, nothing is committed when it fails
pub type Mutator<'a> = Box<dyn FnOnce(&mut RawResource) -> StoreResult<()> + Send + 'a>;

/// Read access to resources
#[async_trait]
pub trait Reader: Send + Sync {
    async fn get_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        id: &str,
    ) -> StoreResult<RawResource>;

    /// List resources matching the query, ordered by ID
    async fn list_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        query: &LabelQuery,
    ) -> StoreResult<Vec<RawResource>>;
}

/// Read-write access to resources
#[async_trait]
pub trait Store: Reader {
    /// Fetch the resource (or a fresh one with an empty spec), mutate it and commit
    async fn modify_raw(
        &self,
        namespace: Namespace,
        kind: ResourceKind,
        id: &str,
        mutate: Mutator<'_>,
    ) -> StoreResult<RawResource>;

    async fn destroy_raw(&self, namespace: Namespace, kind: ResourceKind, id: &str)
        -> StoreResult<()>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Typed reads
#[async_trait]
pub trait ReaderExt: Reader {
    async fn get<S: ResourceSpec>(&self, namespace: Namespace, id: &str) -> StoreResult<Resource<S>> {
        let raw = self.get_raw(namespace, S::KIND, id).await?;
        Ok(Resource::from_raw(raw)?)
    }

    /// Like `get`, but a missing resource is `None`
    async fn get_optional<S: ResourceSpec>(
        &self,
        namespace: Namespace,
        id: &str,
    ) -> StoreResult<Option<Resource<S>>> {
        match self.get::<S>(namespace, id).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list<S: ResourceSpec>(
        &self,
        namespace: Namespace,
        query: &LabelQuery,
    ) -> StoreResult<Vec<Resource<S>>> {
        self.list_raw(namespace, S::KIND, query)
            .await?
            .into_iter()
            .map(|raw| Resource::from_raw(raw).map_err(StoreError::from))
            .collect()
    }
}

impl<R: Reader + ?Sized> ReaderExt for R {}

/// Typed writes
#[async_trait]
pub trait StoreExt: Store {
    async fn modify<S, F>(&self, namespace: Namespace, id: &str, mutate: F) -> StoreResult<Resource<S>>
    where
        S: ResourceSpec,
        F: FnOnce(&mut Resource<S>) -> StoreResult<()> + Send,
    {
        let raw = self
            .modify_raw(namespace, S::KIND, id, typed_mutator(mutate))
            .await?;

        Ok(Resource::from_raw(raw)?)
    }

    async fn destroy<S: ResourceSpec>(&self, namespace: Namespace, id: &str) -> StoreResult<()> {
        self.destroy_raw(namespace, S::KIND, id).await
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

/// Wrap a typed mutation into a raw one
pub(crate) fn typed_mutator<'a, S, F>(mutate: F) -> Mutator<'a>
where
    S: ResourceSpec,
    F: FnOnce(&mut Resource<S>) -> StoreResult<()> + Send + 'a,
{
    Box::new(move |raw: &mut RawResource| {
        let mut typed = Resource::<S>::from_raw(raw.clone())?;
        mutate(&mut typed)?;
        *raw = typed.into_raw()?;
        Ok(())
    })
}
