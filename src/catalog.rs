//! Collaborators outside the cache core: metadata resolution and sessions.

use crate::key::normalize_key;
use crate::{CdnError, Result};
use axum::http::{header, HeaderMap};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// What the metadata store knows about a public identifier.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRecord {
    pub storage_key: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Resolves an opaque request key to a storage object reference.
#[async_trait::async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, key: &str) -> Result<SourceRecord>;
}

/// Identifies the user behind a request, if any.
pub trait SessionProvider: Send + Sync {
    fn current_user(&self, headers: &HeaderMap) -> Option<String>;
}

/// Treats every key as a public object stored under the same name.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicBucket;

#[async_trait::async_trait]
impl MetadataResolver for PublicBucket {
    async fn resolve(&self, key: &str) -> Result<SourceRecord> {
        Ok(SourceRecord {
            storage_key: normalize_key(key)?,
            is_private: false,
            owner_id: None,
            content_type: None,
        })
    }
}

impl SessionProvider for PublicBucket {
    fn current_user(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    objects: HashMap<String, SourceRecord>,
    /// Bearer token -> user id.
    #[serde(default)]
    sessions: HashMap<String, String>,
}

/// Static catalog of objects and session tokens, loaded from JSON:
///
/// ```json
/// {
///   "objects": { "banner.png": { "storage_key": "uploads/banner.png", "is_private": false } },
///   "sessions": { "token-abc": "user-1" }
/// }
/// ```
#[derive(Debug, Default)]
pub struct Catalog {
    objects: RwLock<HashMap<String, SourceRecord>>,
    sessions: RwLock<HashMap<String, String>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw)
            .map_err(|e| CdnError::InvalidArgument(format!("Invalid catalog: {}", e)))?;
        let catalog = Self::new();
        for (key, record) in file.objects {
            catalog.insert(&key, record)?;
        }
        *catalog.sessions.write() = file.sessions;
        Ok(catalog)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CdnError::InvalidArgument(format!("Cannot read catalog {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn insert(&self, key: &str, record: SourceRecord) -> Result<()> {
        self.objects.write().insert(normalize_key(key)?, record);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<SourceRecord> {
        let key = normalize_key(key).ok()?;
        self.objects.write().remove(&key)
    }

    pub fn add_session(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.sessions.write().insert(token.into(), user_id.into());
    }
}

#[async_trait::async_trait]
impl MetadataResolver for Catalog {
    async fn resolve(&self, key: &str) -> Result<SourceRecord> {
        let key = normalize_key(key)?;
        self.objects
            .read()
            .get(&key)
            .cloned()
            .ok_or(CdnError::NotFound(key))
    }
}

impl SessionProvider for Catalog {
    fn current_user(&self, headers: &HeaderMap) -> Option<String> {
        let token = bearer_token(headers)?;
        self.sessions.read().get(token).cloned()
    }
}

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Whether `user` may read the object described by `record`.
pub fn can_access(record: &SourceRecord, user: Option<&str>) -> bool {
    if !record.is_private {
        return true;
    }
    match (user, record.owner_id.as_deref()) {
        (Some(user), Some(owner)) => user == owner,
        _ => false,
    }
}
