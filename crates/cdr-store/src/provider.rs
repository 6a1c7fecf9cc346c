//! Local resource path abstraction
//!
//! The local store materializes units from whatever a [`ResourceProvider`]
//! can load. User versions are derived from content, so identical bytes
//! always yield identical versions on every node.

use async_trait::async_trait;
use bytes::Bytes;
use cdr_types::ResourceKind;
use dashmap::DashMap;

/// Raw content as returned by a resource provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidedResource {
    pub content: Bytes,
    /// Content-derived version string
    pub user_version: String,
    pub kind: ResourceKind,
}

impl ProvidedResource {
    pub fn new(kind: ResourceKind, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            user_version: content_version(&content),
            content,
            kind,
        }
    }
}

/// Version string derived from resource content
pub fn content_version(content: &[u8]) -> String {
    let hash = blake3::hash(content);
    hash.to_hex()[..16].to_string()
}

/// The node's own resource path
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn load(&self, name: &str) -> Option<ProvidedResource>;

    /// Names of every resource the provider can load
    fn list(&self) -> Vec<String>;
}

/// In-memory resource provider
#[derive(Debug, Default)]
pub struct InMemoryResourceProvider {
    resources: DashMap<String, ProvidedResource>,
}

impl InMemoryResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, kind: ResourceKind, content: impl Into<Bytes>) {
        self.resources
            .insert(name.into(), ProvidedResource::new(kind, content));
    }

    /// Insert with an explicit version instead of the content-derived one
    pub fn insert_versioned(
        &self,
        name: impl Into<String>,
        kind: ResourceKind,
        content: impl Into<Bytes>,
        user_version: impl Into<String>,
    ) {
        self.resources.insert(
            name.into(),
            ProvidedResource {
                content: content.into(),
                user_version: user_version.into(),
                kind,
            },
        );
    }

    pub fn remove(&self, name: &str) -> bool {
        self.resources.remove(name).is_some()
    }
}

#[async_trait]
impl ResourceProvider for InMemoryResourceProvider {
    async fn load(&self, name: &str) -> Option<ProvidedResource> {
        self.resources.get(name).map(|r| r.value().clone())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resources.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_content_derived_versions() {
        let provider = InMemoryResourceProvider::new();
        provider.insert("Task1", ResourceKind::Task, &b"body"[..]);
        provider.insert("Task2", ResourceKind::Task, &b"body"[..]);
        provider.insert("Task3", ResourceKind::Task, &b"other"[..]);

        let v1 = provider.load("Task1").await.unwrap().user_version;
        let v2 = provider.load("Task2").await.unwrap().user_version;
        let v3 = provider.load("Task3").await.unwrap().user_version;

        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
        assert_eq!(v1.len(), 16);
        assert!(provider.load("Missing").await.is_none());
        assert_eq!(provider.list(), vec!["Task1", "Task2", "Task3"]);
    }
}
