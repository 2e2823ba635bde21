use chrono::{DateTime, Utc};
use k8s_openapi::serde_json::Value;
use serde::{Deserialize, Serialize};

/// Subset of object metadata the cache needs for identity and recency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// One cluster object as the cache sees it: typed metadata plus the rest of
/// the body kept opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub metadata: ResourceMeta,
    #[serde(flatten)]
    pub payload: Value,
}

/// Stable cache identity for a resource: `namespace/name`, bare `name` for
/// cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub namespace: Option<String>,
    pub name: String,
    /// Extra identity component for kinds whose `namespace/name` is not
    /// unique upstream (`PackageManifest` repeats names across catalog
    /// sources, so the reporting catalog participates in identity).
    pub qualifier: Option<String>,
}

impl QualifiedName {
    #[must_use]
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_owned()),
            name: name.to_owned(),
            qualifier: None,
        }
    }

    #[must_use]
    pub fn cluster_scoped(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_owned(),
            qualifier: None,
        }
    }
}

impl std::fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}/{}", self.name)?;
        } else {
            write!(f, "{}", self.name)?;
        }
        if let Some(q) = &self.qualifier {
            write!(f, "@{q}")?;
        }
        Ok(())
    }
}

impl Resource {
    #[must_use]
    pub fn qualified_name(&self) -> QualifiedName {
        let qualifier = if self.kind.as_deref() == Some("PackageManifest") {
            self.payload
                .pointer("/status/catalogSource")
                .and_then(Value::as_str)
                .map(str::to_owned)
        } else {
            None
        };
        QualifiedName {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            qualifier,
        }
    }

    /// `resourceVersion` as a number; the server hands these out as opaque
    /// strings but orders them numerically, and anything unparseable loses
    /// every comparison.
    #[must_use]
    pub fn resource_version(&self) -> u64 {
        self.metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(0)
    }

    /// Whether `self` should replace `current` in the cache.
    ///
    /// A differing uid means the name was reused for a new object, so the
    /// later `creationTimestamp` wins. Same uid compares `resourceVersion`
    /// numerically. Anything not strictly more recent is dropped by the
    /// caller, which also makes re-applying a duplicated event a no-op.
    #[must_use]
    pub fn more_recent_than(&self, current: &Self) -> bool {
        if self.metadata.uid != current.metadata.uid {
            return self.metadata.creation_timestamp > current.metadata.creation_timestamp;
        }
        self.resource_version() > current.resource_version()
    }
}
