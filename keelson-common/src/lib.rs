//! Common types shared between the keelson controllers and their consumers

pub mod resources;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use resources::*;

/// Well-known resource labels
pub mod labels {
    /// Name of the cluster a resource belongs to
    pub const LABEL_CLUSTER: &str = "keelson.dev/cluster";
    /// Machine set a machine is allocated to
    pub const LABEL_MACHINE_SET: &str = "keelson.dev/machine-set";
    /// Marks control plane machines and machine sets
    pub const LABEL_CONTROL_PLANE_ROLE: &str = "keelson.dev/role-controlplane";
    /// Marks infrastructure machines waiting to be accepted
    pub const LABEL_PENDING_ACCEPT: &str = "keelson.dev/pending-accept";
}

/// Resource namespace
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Namespace {
    Default,
    /// Non-durable state recomputed on every controller pass
    Ephemeral,
    InfraProvider,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Ephemeral => "ephemeral",
            Self::InfraProvider => "infra-provider",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    MachineStatus,
    MachineIdentity,
    MachineSet,
    TransportConfig,
    InfraMachine,
    MachineStatusMetrics,
    ControlPlaneStatus,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MachineStatus => "MachineStatus",
            Self::MachineIdentity => "MachineIdentity",
            Self::MachineSet => "MachineSet",
            Self::TransportConfig => "TransportConfig",
            Self::InfraMachine => "InfraMachine",
            Self::MachineStatusMetrics => "MachineStatusMetrics",
            Self::ControlPlaneStatus => "ControlPlaneStatus",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed resource payload
pub trait ResourceSpec:
    Serialize + DeserializeOwned + Default + Clone + std::fmt::Debug + Send + Sync + 'static
{
    const KIND: ResourceKind;
}

/// Resource metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub namespace: Namespace,
    pub kind: ResourceKind,
    pub id: String,
    /// Bumped on every committed change, 0 for resources that were never stored
    pub version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Metadata {
    pub fn new(namespace: Namespace, kind: ResourceKind, id: impl Into<String>) -> Self {
        let now = Utc::now();

        Self {
            namespace,
            kind,
            id: id.into(),
            version: 0,
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored resource: metadata plus spec
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource<S> {
    pub metadata: Metadata,
    pub spec: S,
}

/// Untyped resource as kept by stores
pub type RawResource = Resource<serde_json::Value>;

impl<S> Resource<S> {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Get a label value
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    pub fn has_label(&self, key: &str) -> bool {
        self.metadata.labels.contains_key(key)
    }
}

impl<S: ResourceSpec> Resource<S> {
    pub fn new(namespace: Namespace, id: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(namespace, S::KIND, id),
            spec: S::default(),
        }
    }

    pub fn with_spec(mut self, spec: S) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Decode a raw resource, an empty spec decodes to the default value
    pub fn from_raw(raw: RawResource) -> Result<Self> {
        if raw.metadata.kind != S::KIND {
            return Err(Error::KindMismatch {
                expected: S::KIND,
                actual: raw.metadata.kind,
            });
        }

        let spec = if raw.spec.is_null() {
            S::default()
        } else {
            serde_json::from_value(raw.spec)?
        };

        Ok(Self {
            metadata: raw.metadata,
            spec,
        })
    }

    pub fn into_raw(self) -> Result<RawResource> {
        Ok(Resource {
            metadata: self.metadata,
            spec: serde_json::to_value(self.spec)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Resource kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        expected: ResourceKind,
        actual: ResourceKind,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
