use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub mod admin;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod fetch;
pub mod gatekeeper;
pub mod key;
pub mod metrics;
pub mod transform;

use crate::cache::{build_cache, CacheControl, CachePolicy, InFlight};
use crate::catalog::{Catalog, MetadataResolver, PublicBucket, SessionProvider};
use crate::config::{BlobBackend, CdnConfig, ConfigError};
use crate::fetch::{BlobSource, BlobStore, FsBlobStore, HttpBlobStore};
use crate::gatekeeper::ClientRateLimiter;
use crate::metrics::Metrics;

#[derive(Error, Debug)]
pub enum CdnError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { remaining: u32, retry_after: Duration },
    #[error("Transient backing store error: {0}")]
    Transient(String),
    #[error("Empty body: {0}")]
    EmptyBody(String),
    #[error("Transformation failed: {0}")]
    TransformFailed(String),
    #[error("Cache error: {0}")]
    InternalCache(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CdnError>;

impl CdnError {
    pub fn status(&self) -> StatusCode {
        match self {
            CdnError::InvalidKey(_) | CdnError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CdnError::NotFound(_) => StatusCode::NOT_FOUND,
            CdnError::AccessDenied(_) => StatusCode::FORBIDDEN,
            CdnError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CdnError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CdnError::Transient(_)
            | CdnError::EmptyBody(_)
            | CdnError::TransformFailed(_)
            | CdnError::InternalCache(_)
            | CdnError::Config(_)
            | CdnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            CdnError::InvalidKey(_) => "invalid_key",
            CdnError::InvalidArgument(_) => "invalid_argument",
            CdnError::NotFound(_) => "not_found",
            CdnError::AccessDenied(_) => "access_denied",
            CdnError::Unauthorized(_) => "unauthorized",
            CdnError::RateLimited { .. } => "rate_limited",
            CdnError::Transient(_) => "upstream_unavailable",
            CdnError::EmptyBody(_) => "empty_body",
            CdnError::TransformFailed(_) => "transform_failed",
            CdnError::InternalCache(_) | CdnError::Config(_) | CdnError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for CdnError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Server-side detail stays in the logs
        let message = if status.is_server_error() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        let body = Json(json!({ "error": self.code(), "message": message }));

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&CacheControl::no_cache().header_value()) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        if let CdnError::RateLimited { remaining, retry_after } = &self {
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs as u64));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(*remaining));
        }
        response
    }
}

/// Shared service state: the variant cache and everything in front of and
/// behind it. Built once and passed to the router.
pub struct ImageCdn {
    pub config: CdnConfig,
    pub cache: Arc<dyn CachePolicy>,
    pub source: BlobSource,
    pub resolver: Arc<dyn MetadataResolver>,
    pub sessions: Arc<dyn SessionProvider>,
    pub limiter: ClientRateLimiter,
    pub inflight: InFlight,
    pub metrics: Metrics,
    shutdown: CancellationToken,
}

impl ImageCdn {
    /// Assembles a service from explicit collaborators.
    pub fn new(
        config: CdnConfig,
        cache: Arc<dyn CachePolicy>,
        store: Arc<dyn BlobStore>,
        resolver: Arc<dyn MetadataResolver>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = ClientRateLimiter::new(config.rate_limit_points, config.rate_limit_duration)?;
        let metrics = Metrics::new().map_err(|e| CdnError::Internal(format!("metrics registry: {}", e)))?;
        Ok(Self {
            source: BlobSource::new(store, config.fetch_timeout),
            config,
            cache,
            resolver,
            sessions,
            limiter,
            inflight: InFlight::new(),
            metrics,
            shutdown: CancellationToken::new(),
        })
    }

    /// Builds every collaborator from `config`.
    pub async fn init(config: CdnConfig) -> Result<Arc<Self>> {
        // Before anything touches the filesystem or network
        config.validate()?;

        let store: Arc<dyn BlobStore> = match &config.blob {
            BlobBackend::Http { endpoint, token } => Arc::new(HttpBlobStore::new(
                endpoint.clone(),
                token.clone(),
                config.max_input_size,
                config.fetch_timeout,
            )?),
            BlobBackend::Fs { dir } => Arc::new(FsBlobStore::new(dir.clone(), config.max_input_size)),
        };

        let resolver: Arc<dyn MetadataResolver>;
        let sessions: Arc<dyn SessionProvider>;
        match &config.catalog_path {
            Some(path) => {
                let catalog = Arc::new(Catalog::load(path).await?);
                tracing::info!("Loaded catalog from {}", path.display());
                resolver = catalog.clone();
                sessions = catalog;
            }
            None => {
                resolver = Arc::new(PublicBucket);
                sessions = Arc::new(PublicBucket);
            }
        }

        let cache = build_cache(&config).await?;
        let cdn = Arc::new(Self::new(config, cache, store, resolver, sessions)?);
        cdn.spawn_purge_task();
        Ok(cdn)
    }

    /// Sweeps expired cache entries and idle rate-limit buckets every
    /// `purge_interval` until [`ImageCdn::shutdown`].
    pub fn spawn_purge_task(self: &Arc<Self>) -> JoinHandle<()> {
        let cdn = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cdn.config.purge_interval);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = cdn.cache.purge_expired().await;
                        cdn.limiter.shrink();
                        tracing::debug!("Periodic purge removed {} entries", purged);
                    }
                }
            }
            tracing::info!("Purge task stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "imagecdn"
    }))
}

/// Cache statistics endpoint
async fn cache_stats_handler(State(cdn): State<Arc<ImageCdn>>) -> impl IntoResponse {
    let stats = cdn.cache.stats();
    let hits = cdn.metrics.cache_hits.get();
    let misses = cdn.metrics.cache_misses.get();
    let total_requests = hits + misses;
    let hit_rate = if total_requests > 0 {
        (hits as f64 / total_requests as f64) * 100.0
    } else {
        0.0
    };

    Json(json!({
        "cache": stats,
        "requests": {
            "cache_hits": hits,
            "cache_misses": misses,
            "total": total_requests,
            "hit_rate_percent": hit_rate,
            "rate_limited": cdn.metrics.rate_limited.get(),
        },
        "transforms": {
            "total": cdn.metrics.transforms.get(),
            "errors": cdn.metrics.transform_errors.get(),
        }
    }))
}

/// Metrics endpoint (Prometheus text format)
async fn metrics_handler(State(cdn): State<Arc<ImageCdn>>) -> impl IntoResponse {
    let (content_type, body) = cdn.metrics.render();
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body)
}

pub fn router(cdn: Arc<ImageCdn>) -> Router {
    // Observability endpoints - NO rate limiting
    let observability_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/stats/cache", get(cache_stats_handler))
        .route("/metrics", get(metrics_handler));

    // Image endpoints - rate limited inside the pipeline
    let image_routes = Router::new()
        .route("/cdn/*key", get(gatekeeper::public_handler))
        .route("/images/*key", get(gatekeeper::dashboard_handler));

    let mut app = Router::new().merge(observability_routes).merge(image_routes);

    if cdn.config.admin_token.is_some() {
        let admin_routes = Router::new()
            .route("/admin/objects/*key", put(admin::put_object).delete(admin::delete_object))
            .route("/admin/cache/purge", post(admin::purge_cache))
            .route("/admin/cache", delete(admin::clear_cache))
            .layer(DefaultBodyLimit::max(cdn.config.max_input_size))
            .route_layer(middleware::from_fn_with_state(cdn.clone(), admin::require_admin));
        app = app.merge(admin_routes);
        tracing::info!("Admin routes enabled");
    } else {
        tracing::info!("Admin routes disabled (no admin token)");
    }

    app.layer(TraceLayer::new_for_http()).with_state(cdn)
}
