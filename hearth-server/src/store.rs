//! Document store access
//!
//! The server only needs single-record reads and writes with equality
//! filters, so the store is reached through the narrow [`DocumentStore`]
//! trait. [`MemoryStore`] backs `memory://` URLs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub type Document = Map<String, Value>;

pub const USERS: &str = "users";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unsupported document store url: {0}")]
    UnsupportedUrl(String),

    #[error("no document in '{0}' matched the filter")]
    NotFound(String),

    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Equality filter: every field must match exactly.
#[derive(Debug, Clone, Default)]
pub struct Filter(Vec<(String, Value)>);

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self(vec![(field.into(), value.into())])
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.0
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(&self, collection: &str, filter: &Filter)
        -> Result<Option<Document>, StoreError>;

    async fn insert(&self, collection: &str, doc: Document) -> Result<(), StoreError>;

    /// Replace the first document matching `filter`.
    async fn update(&self, collection: &str, filter: &Filter, doc: Document)
        -> Result<(), StoreError>;
}

/// Open the store named by `url`.
pub fn connect(url: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
    if url.starts_with("memory:") {
        Ok(Arc::new(MemoryStore::default()))
    } else {
        Err(StoreError::UnsupportedUrl(url.to_string()))
    }
}

/// Process-local store keyed by collection name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d)))
            .cloned())
    }

    async fn insert(&self, collection: &str, doc: Document) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        doc: Document,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let slot = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| filter.matches(d)))
            .ok_or_else(|| StoreError::NotFound(collection.to_string()))?;
        *slot = doc;
        Ok(())
    }
}

/// A site account as stored in the `users` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_blog_author: bool,
}

impl User {
    /// Resolve the account with the given id.
    pub async fn find_by_id(
        store: &dyn DocumentStore,
        id: &str,
    ) -> Result<Option<User>, StoreError> {
        match store.find_one(USERS, &Filter::eq("id", id)).await? {
            Some(doc) => Ok(Some(serde_json::from_value(Value::Object(doc))?)),
            None => Ok(None),
        }
    }

    pub fn can_write_posts(&self) -> bool {
        self.is_admin || self.is_blog_author
    }
}
