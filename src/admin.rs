//! Administrative routes: source replacement and deletion, cache purge.
//!
//! Mounted only when an admin token is configured; every route requires
//! `Authorization: Bearer <token>`.

use crate::catalog::bearer_token;
use crate::config::ImageFormat;
use crate::key::{base_of, normalize_key};
use crate::{CdnError, ImageCdn, Result};
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;

pub async fn require_admin(State(cdn): State<Arc<ImageCdn>>, request: Request, next: Next) -> Response {
    let authorized = match (cdn.config.admin_token.as_deref(), bearer_token(request.headers())) {
        (Some(expected), Some(given)) => expected == given,
        _ => false,
    };
    if !authorized {
        tracing::warn!("Rejected admin request to {}", request.uri().path());
        return CdnError::Unauthorized("admin token required".into()).into_response();
    }
    next.run(request).await
}

/// Storage key for a public key: what the resolver says, or the key itself
/// for objects it does not know yet.
async fn storage_key(cdn: &ImageCdn, key: &str) -> Result<String> {
    match cdn.resolver.resolve(key).await {
        Ok(record) => Ok(record.storage_key),
        Err(CdnError::NotFound(_)) => normalize_key(key),
        Err(e) => Err(e),
    }
}

/// `PUT /admin/objects/*key`: replaces the source bytes and drops every
/// variant derived from the old ones.
pub async fn put_object(
    State(cdn): State<Arc<ImageCdn>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let key = normalize_key(&key)?;
    if body.is_empty() {
        return Err(CdnError::InvalidArgument("Empty upload".into()));
    }
    if body.len() > cdn.config.max_input_size {
        return Err(CdnError::InvalidArgument(format!(
            "Upload too large: {} bytes (max {})",
            body.len(),
            cdn.config.max_input_size
        )));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            key.rsplit('.')
                .next()
                .and_then(ImageFormat::from_extension)
                .map(|f| f.content_type().to_string())
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());
    if !content_type.starts_with("image/") {
        return Err(CdnError::InvalidArgument(format!("Not an image: {}", content_type)));
    }

    let storage_key = storage_key(&cdn, &key).await?;
    let size = body.len();
    cdn.source.store().put(&storage_key, body, &content_type).await?;
    let invalidated = cdn.cache.invalidate_prefix(&base_of(&key)?).await;
    tracing::info!("Stored source key={} ({} bytes), invalidated {} variants", key, size, invalidated);

    Ok(Json(json!({ "key": key, "size_bytes": size, "invalidated": invalidated })))
}

/// `DELETE /admin/objects/*key`: removes the source and all its variants.
pub async fn delete_object(
    State(cdn): State<Arc<ImageCdn>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let key = normalize_key(&key)?;
    let storage_key = storage_key(&cdn, &key).await?;
    cdn.source.store().delete(&storage_key).await?;
    let invalidated = cdn.cache.invalidate_prefix(&base_of(&key)?).await;
    tracing::info!("Deleted source key={}, invalidated {} variants", key, invalidated);

    Ok(Json(json!({ "key": key, "invalidated": invalidated })))
}

pub async fn purge_cache(State(cdn): State<Arc<ImageCdn>>) -> Json<serde_json::Value> {
    let purged = cdn.cache.purge_expired().await;
    Json(json!({ "purged": purged }))
}

pub async fn clear_cache(State(cdn): State<Arc<ImageCdn>>) -> Json<serde_json::Value> {
    let cleared = cdn.cache.clear().await;
    Json(json!({ "cleared": cleared }))
}
