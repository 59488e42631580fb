//! Request pipeline in front of the variant cache.
//!
//! Order matters: the rate limit and the access check both run before the
//! cache or the blob store is touched.

pub mod conditional;
pub mod rate_limit;

pub use conditional::{CacheStatus, ImageResponse};
pub use rate_limit::{ClientRateLimiter, Decision};

use crate::cache::{etag_for, CacheControl, CachedVariant, NewVariant};
use crate::catalog::can_access;
use crate::config::FitMode;
use crate::key::{canonicalize, normalize_key, VariantKey};
use crate::transform::params::TransformOptions;
use crate::transform::{self, DASHBOARD_DEFAULT_FIT, PUBLIC_DEFAULT_FIT};
use crate::{CdnError, ImageCdn, Result};
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Which route a request came in on; decides the default fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// `/cdn/*key`
    Public,
    /// `/images/*key`
    Dashboard,
}

impl Surface {
    pub fn default_fit(self) -> FitMode {
        match self {
            Surface::Public => PUBLIC_DEFAULT_FIT,
            Surface::Dashboard => DASHBOARD_DEFAULT_FIT,
        }
    }
}

const UNKNOWN_CLIENT: &str = "unknown-client";

/// Rate-limit key for a request: the first `X-Forwarded-For` hop when the
/// proxy is trusted, else the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map(|p| p.ip().to_string()).unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

pub async fn public_handler(
    State(cdn): State<Arc<ImageCdn>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response> {
    let client = client_key(&headers, peer.map(|c| c.0), cdn.config.trust_forwarded);
    serve_image(&cdn, Surface::Public, &key, query.as_deref(), &headers, &client).await
}

pub async fn dashboard_handler(
    State(cdn): State<Arc<ImageCdn>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response> {
    let client = client_key(&headers, peer.map(|c| c.0), cdn.config.trust_forwarded);
    serve_image(&cdn, Surface::Dashboard, &key, query.as_deref(), &headers, &client).await
}

/// Serves one image request end to end.
pub async fn serve_image(
    cdn: &ImageCdn,
    surface: Surface,
    raw_key: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    client: &str,
) -> Result<Response> {
    let decision = cdn.limiter.protect(client, 1);
    if !decision.allowed {
        cdn.metrics.rate_limited.inc();
        tracing::warn!("Rate limited client={} retry_in={}ms", client, decision.ms_before_next);
        return Err(CdnError::RateLimited {
            remaining: decision.remaining_points,
            retry_after: Duration::from_millis(decision.ms_before_next),
        });
    }

    let options: TransformOptions = query.unwrap_or_default().parse()?;
    let key = normalize_key(raw_key)?;
    tracing::debug!("Image request: key={}, surface={:?}, options={:?}", key, surface, options);

    let record = cdn.resolver.resolve(&key).await?;
    let user = cdn.sessions.current_user(headers);
    if !can_access(&record, user.as_deref()) {
        tracing::warn!("Access denied: key={}, user={:?}", key, user);
        return Err(CdnError::AccessDenied(key));
    }

    let options = options.with_default_fit(surface.default_fit());
    let variant_key = canonicalize(&key, &options)?;
    let cache_control = if record.is_private {
        CacheControl::for_private(cdn.config.passthrough_max_age)
    } else if options.is_passthrough() {
        CacheControl::for_passthrough(cdn.config.passthrough_max_age)
    } else {
        CacheControl::for_variant(cdn.config.cache_ttl)
    };

    if let Some(hit) = cdn.cache.get(variant_key.as_str()).await {
        cdn.metrics.cache_hits.inc();
        return Ok(respond_hit(&variant_key, &hit, cache_control, &options, headers));
    }
    cdn.metrics.cache_misses.inc();

    // One fetch and transform per variant; later arrivals find it cached
    let _in_flight = cdn.inflight.lock(variant_key.as_str()).await;
    if let Some(hit) = cdn.cache.recheck(variant_key.as_str()).await {
        return Ok(respond_hit(&variant_key, &hit, cache_control, &options, headers));
    }

    tracing::info!("Cache miss for key={}, fetching {}", variant_key, record.storage_key);
    let (source, bytes) = cdn.source.fetch(&record).await?;

    let (payload, content_type, transformed) = if options.is_passthrough() {
        (bytes, source.content_type.clone(), false)
    } else {
        let opts = options.clone();
        let content_type = source.content_type.clone();
        let result = tokio::task::spawn_blocking(move || transform::transform(bytes, &content_type, &opts))
            .await
            .map_err(|e| CdnError::TransformFailed(format!("transform task: {}", e)))
            .and_then(|r| r);
        match result {
            Ok((payload, content_type)) => {
                cdn.metrics.transforms.inc();
                (payload, content_type, true)
            }
            Err(e) => {
                cdn.metrics.transform_errors.inc();
                tracing::error!("Transform failed for key={} with {:?}: {}", variant_key, options, e);
                return Err(e);
            }
        }
    };

    let new_variant = NewVariant {
        bytes: payload,
        content_type,
        freshness_token: source.freshness_token.clone(),
        transformed,
    };
    let stored = match cdn.cache.put(variant_key.as_str(), new_variant.clone(), cdn.config.cache_ttl).await {
        Ok(stored) => stored,
        Err(e) => {
            // Serving still works without the cache
            tracing::warn!("Failed to cache key={}: {}", variant_key, e);
            uncached(new_variant)
        }
    };

    let status = if transformed { CacheStatus::MissTransformed } else { CacheStatus::Miss };
    let download_name = options.download.then(|| variant_key.file_name());
    Ok(ImageResponse {
        variant: &stored,
        status,
        cache_control,
        attachment: download_name.as_deref(),
    }
    .render(headers))
}

fn respond_hit(
    variant_key: &VariantKey,
    hit: &CachedVariant,
    cache_control: CacheControl,
    options: &TransformOptions,
    headers: &HeaderMap,
) -> Response {
    tracing::info!("Cache hit for key={}", variant_key);
    let download_name = options.download.then(|| variant_key.file_name());
    ImageResponse {
        variant: hit,
        status: CacheStatus::Hit,
        cache_control,
        attachment: download_name.as_deref(),
    }
    .render(headers)
}

fn uncached(variant: NewVariant) -> CachedVariant {
    let stored_at = OffsetDateTime::now_utc();
    CachedVariant {
        etag: etag_for(variant.bytes.len(), variant.freshness_token.as_deref(), stored_at),
        bytes: variant.bytes,
        content_type: variant.content_type,
        transformed: variant.transformed,
        stored_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_key_prefers_trusted_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer: Option<SocketAddr> = "127.0.0.1:5000".parse().ok();

        assert_eq!(client_key(&headers, peer, true), "203.0.113.9");
        assert_eq!(client_key(&headers, peer, false), "127.0.0.1");
        assert_eq!(client_key(&HeaderMap::new(), None, false), "unknown-client");
    }

    #[test]
    fn surfaces_have_distinct_fit_defaults() {
        assert_eq!(Surface::Public.default_fit(), FitMode::Cover);
        assert_eq!(Surface::Dashboard.default_fit(), FitMode::Inside);
    }
}
