use std::collections::BTreeMap;

use crate::k8s::utils::format_selector;

/// One list-then-watch query: which kind, where, and how it is filtered.
///
/// Two structurally equal descriptors produce the same [`key`](Self::key)
/// and therefore share one cache entry and one transport channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDescriptor {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub label_selector: BTreeMap<String, String>,
    pub field_selector: BTreeMap<String, String>,
    pub limit: u32,
}

impl WatchDescriptor {
    #[must_use]
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            namespace: None,
            name: None,
            label_selector: BTreeMap::new(),
            field_selector: BTreeMap::new(),
            limit: super::sync::config::DEFAULT_PAGE_LIMIT,
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_owned());
        self
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.label_selector.insert(key.to_owned(), value.to_owned());
        self
    }

    #[must_use]
    pub fn field(mut self, key: &str, value: &str) -> Self {
        self.field_selector.insert(key.to_owned(), value.to_owned());
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Canonical subscription key. Selector maps are `BTreeMap`s, so the
    /// serialization is stable regardless of insertion order.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}--{}--{}--l:{}--f:{}--{}",
            self.kind,
            self.namespace.as_deref().unwrap_or("all"),
            self.name.as_deref().unwrap_or(""),
            format_selector(&self.label_selector),
            format_selector(&self.field_selector),
            self.limit,
        )
    }

    /// Label selector in the `k=v,k=v` wire form, or `None` when empty.
    #[must_use]
    pub fn label_selector_string(&self) -> Option<String> {
        if self.label_selector.is_empty() {
            None
        } else {
            Some(format_selector(&self.label_selector))
        }
    }

    /// Field selector in wire form; a `name` constraint is expressed as a
    /// `metadata.name` field selector, the same way the list endpoint
    /// expects it.
    #[must_use]
    pub fn field_selector_string(&self) -> Option<String> {
        let mut fields = self.field_selector.clone();
        if let Some(name) = &self.name {
            fields.insert("metadata.name".to_owned(), name.clone());
        }
        if fields.is_empty() {
            None
        } else {
            Some(format_selector(&fields))
        }
    }

    /// Endpoint the live watch for this query is addressed at; used as the
    /// transport channel's url (identification and logging).
    #[must_use]
    pub fn watch_path(&self, resource_version: &str) -> String {
        let mut path = match &self.namespace {
            Some(ns) => format!("/watch/{ns}/{}", self.kind.to_lowercase()),
            None => format!("/watch/{}", self.kind.to_lowercase()),
        };
        path.push_str("?watch=true");
        if let Some(labels) = self.label_selector_string() {
            path.push_str("&labelSelector=");
            path.push_str(&labels);
        }
        if let Some(fields) = self.field_selector_string() {
            path.push_str("&fieldSelector=");
            path.push_str(&fields);
        }
        if !resource_version.is_empty() {
            path.push_str("&resourceVersion=");
            path.push_str(resource_version);
        }
        path
    }
}
