use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use bytes::Bytes;
use image::GenericImageView;
use imagecdn::cache::{DiskCache, MemoryCache};
use imagecdn::catalog::{Catalog, SourceRecord};
use imagecdn::config::{CacheBackend, CdnConfig};
use imagecdn::fetch::{BlobStore, MemoryBlobStore};
use imagecdn::{router, ImageCdn};
use serde_json::Value;
use std::sync::Arc;
use tower::util::ServiceExt; // for `oneshot`

struct TestApp {
    app: Router,
    cdn: Arc<ImageCdn>,
    store: Arc<MemoryBlobStore>,
    catalog: Arc<Catalog>,
}

/// 400x300 PNG with a gradient so resizes produce distinct bytes.
fn banner_png() -> Vec<u8> {
    let img = image::RgbImage::from_fn(400, 300, |x, y| image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut png = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    png
}

fn record(storage_key: &str) -> SourceRecord {
    SourceRecord { storage_key: storage_key.into(), is_private: false, owner_id: None, content_type: None }
}

async fn setup(config: CdnConfig) -> TestApp {
    let store = Arc::new(MemoryBlobStore::new());
    store
        .put("uploads/banner.png", Bytes::from(banner_png()), "image/png")
        .await
        .unwrap();

    let catalog = Arc::new(Catalog::new());
    catalog.insert("banner.png", record("uploads/banner.png")).unwrap();
    catalog
        .insert(
            "secret.png",
            SourceRecord { is_private: true, owner_id: Some("u1".into()), ..record("uploads/banner.png") },
        )
        .unwrap();
    catalog.add_session("tok-1", "u1");
    catalog.add_session("tok-2", "u2");

    let cache: Arc<dyn imagecdn::cache::CachePolicy> = match config.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new(config.max_entries)),
        CacheBackend::Disk => Arc::new(DiskCache::init(config.cache_dir.clone(), config.max_entries).await.unwrap()),
    };
    let cdn = Arc::new(ImageCdn::new(config, cache, store.clone(), catalog.clone(), catalog.clone()).unwrap());
    TestApp { app: router(cdn.clone()), cdn, store, catalog }
}

async fn get(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn header_str<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response.headers().get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

#[tokio::test]
async fn test_miss_then_hit_then_not_modified() {
    let t = setup(CdnConfig::default()).await;

    let first = get(&t.app, "/cdn/banner.png?w=200&f=webp").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header_str(&first, "x-cache-status"), "MISS-TRANSFORMED");
    assert_eq!(header_str(&first, "content-type"), "image/webp");
    assert_eq!(header_str(&first, "cache-control"), "public, max-age=86400, immutable");
    assert_eq!(header_str(&first, "vary"), "Accept");
    assert!(first.headers().contains_key(header::LAST_MODIFIED));
    let etag = header_str(&first, "etag").to_string();
    assert!(etag.starts_with("W/\""));
    let first_body = body_bytes(first).await;

    let second = get(&t.app, "/cdn/banner.png?w=200&f=webp").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header_str(&second, "x-cache-status"), "HIT");
    assert_eq!(header_str(&second, "etag"), etag);
    assert_eq!(body_bytes(second).await, first_body);

    let replay = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/cdn/banner.png?w=200&f=webp")
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(replay).await.is_empty());

    // Only the first request reached the blob store
    assert_eq!(t.store.get_count(), 1);
    assert_eq!(t.cdn.metrics.transforms.get(), 1);
}

#[tokio::test]
async fn test_equivalent_queries_share_a_variant() {
    let t = setup(CdnConfig::default()).await;

    let a = get(&t.app, "/cdn/banner.png?w=120&h=80&f=webp").await;
    assert_eq!(header_str(&a, "x-cache-status"), "MISS-TRANSFORMED");
    let b = get(&t.app, "/cdn/banner.png?format=webp&height=80&width=120").await;
    assert_eq!(header_str(&b, "x-cache-status"), "HIT");
    // download only shapes headers
    let c = get(&t.app, "/cdn/banner.png?f=webp&h=80&w=120&download=true").await;
    assert_eq!(header_str(&c, "x-cache-status"), "HIT");
    assert_eq!(t.cdn.cache.len(), 1);
}

#[tokio::test]
async fn test_passthrough_is_cached_untransformed() {
    let t = setup(CdnConfig::default()).await;

    let first = get(&t.app, "/cdn/banner.png").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header_str(&first, "x-cache-status"), "MISS");
    assert_eq!(header_str(&first, "cache-control"), "public, max-age=3600");
    assert_eq!(header_str(&first, "content-type"), "image/png");
    assert_eq!(body_bytes(first).await.as_ref(), banner_png().as_slice());

    let second = get(&t.app, "/cdn/banner.png").await;
    assert_eq!(header_str(&second, "x-cache-status"), "HIT");
    assert_eq!(t.cdn.metrics.transforms.get(), 0);
}

#[tokio::test]
async fn test_fit_default_depends_on_surface() {
    let t = setup(CdnConfig::default()).await;

    let public = get(&t.app, "/cdn/banner.png?w=100&h=100").await;
    let public = image::load_from_memory(&body_bytes(public).await).unwrap();
    assert_eq!(public.dimensions(), (100, 100));

    let dashboard = get(&t.app, "/images/banner.png?w=100&h=100").await;
    assert_eq!(header_str(&dashboard, "x-cache-status"), "MISS-TRANSFORMED");
    let dashboard = image::load_from_memory(&body_bytes(dashboard).await).unwrap();
    assert_eq!(dashboard.dimensions(), (100, 75));
}

#[tokio::test]
async fn test_never_upscales() {
    let t = setup(CdnConfig::default()).await;
    let response = get(&t.app, "/images/banner.png?w=2000").await;
    assert_eq!(response.status(), StatusCode::OK);
    let img = image::load_from_memory(&body_bytes(response).await).unwrap();
    assert_eq!(img.dimensions(), (400, 300));
}

#[tokio::test]
async fn test_download_sets_content_disposition() {
    let t = setup(CdnConfig::default()).await;
    let response = get(&t.app, "/cdn/banner.png?w=100&download=true").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_str(&response, "content-disposition"),
        "attachment; filename=\"banner_fit_cover-width_100.png\""
    );

    let inline = get(&t.app, "/cdn/banner.png?w=100").await;
    assert!(!inline.headers().contains_key(header::CONTENT_DISPOSITION));
}

#[tokio::test]
async fn test_private_object_denied_before_any_work() {
    let t = setup(CdnConfig::default()).await;

    let anonymous = get(&t.app, "/cdn/secret.png?w=100").await;
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(anonymous).await["error"], "access_denied");

    let other_user = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/cdn/secret.png?w=100")
                .header(header::AUTHORIZATION, "Bearer tok-2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(other_user.status(), StatusCode::FORBIDDEN);

    assert_eq!(t.store.get_count(), 0);
    assert!(t.cdn.cache.is_empty());

    let owner = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/cdn/secret.png?w=100")
                .header(header::AUTHORIZATION, "Bearer tok-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(owner.status(), StatusCode::OK);
    assert_eq!(header_str(&owner, "cache-control"), "private, max-age=3600");
}

#[tokio::test]
async fn test_rate_limit_short_circuits() {
    let config = CdnConfig { rate_limit_points: 2, ..CdnConfig::default() };
    let t = setup(config).await;

    assert_eq!(get(&t.app, "/cdn/banner.png").await.status(), StatusCode::OK);
    assert_eq!(get(&t.app, "/cdn/banner.png").await.status(), StatusCode::OK);

    let denied = get(&t.app, "/cdn/banner.png?w=50").await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(denied.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(header_str(&denied, "x-ratelimit-remaining"), "0");
    assert_eq!(body_json(denied).await["error"], "rate_limited");

    // The denied request never reached the cache or the store
    assert_eq!(t.store.get_count(), 1);
    assert_eq!(t.cdn.cache.len(), 1);
    assert_eq!(t.cdn.metrics.rate_limited.get(), 1);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let t = setup(CdnConfig::default()).await;

    for uri in [
        "/cdn/banner.png?q=0",
        "/cdn/banner.png?q=101",
        "/cdn/banner.png?f=gif",
        "/cdn/banner.png?w=abc",
        "/cdn/banner.png?fit=stretch",
        "/cdn/banner.png?download=maybe",
        "/cdn/banner.png?w=4000000000&h=1&fit=contain",
        "/cdn/banner.png?w=9000",
    ] {
        let response = get(&t.app, uri).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body_json(response).await["error"], "invalid_argument", "{}", uri);
    }

    let traversal = get(&t.app, "/cdn/..%2F..%2Fetc%2Fpasswd").await;
    assert_eq!(traversal.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(traversal).await["error"], "invalid_key");

    assert_eq!(t.store.get_count(), 0);
}

#[tokio::test]
async fn test_unknown_keys_are_not_found() {
    let t = setup(CdnConfig::default()).await;

    let unknown = get(&t.app, "/cdn/missing.png").await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(unknown).await["error"], "not_found");

    // Known to the catalog, gone from the store
    t.catalog.insert("ghost.png", record("uploads/ghost.png")).unwrap();
    let ghost = get(&t.app, "/cdn/ghost.png?w=10").await;
    assert_eq!(ghost.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_transform_failure_is_500_and_not_cached() {
    let t = setup(CdnConfig::default()).await;
    t.store
        .put("uploads/broken.png", Bytes::from_static(b"definitely not a png"), "image/png")
        .await
        .unwrap();
    t.catalog.insert("broken.png", record("uploads/broken.png")).unwrap();

    let response = get(&t.app, "/cdn/broken.png?w=100").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"], "transform_failed");
    assert_eq!(json["message"], "Internal server error");

    assert!(t.cdn.cache.is_empty());
    assert_eq!(t.cdn.metrics.transform_errors.get(), 1);
}

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let t = setup(CdnConfig::default()).await;

    let requests = (0..8).map(|_| get(&t.app, "/cdn/banner.png?w=150&f=jpeg"));
    let responses = futures::future::join_all(requests).await;

    let mut transformed = 0;
    for response in &responses {
        assert_eq!(response.status(), StatusCode::OK);
        if header_str(response, "x-cache-status") == "MISS-TRANSFORMED" {
            transformed += 1;
        }
    }
    assert_eq!(transformed, 1);
    assert_eq!(t.store.get_count(), 1);
    assert!(t.cdn.inflight.is_empty());

    // Every request is counted once, the same way in both places
    let stats = t.cdn.cache.stats();
    assert_eq!(stats.hits + stats.misses, 8);
    assert_eq!(stats.hits, t.cdn.metrics.cache_hits.get());
    assert_eq!(stats.misses, t.cdn.metrics.cache_misses.get());
}

fn solid(format: image::ImageFormat, color: [u8; 3]) -> Bytes {
    let img = image::RgbImage::from_pixel(60, 40, image::Rgb(color));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), format)
        .unwrap();
    Bytes::from(out)
}

#[tokio::test]
async fn test_sources_sharing_a_stem_never_share_variants() {
    let t = setup(CdnConfig::default()).await;
    t.store
        .put("uploads/photo.jpg", solid(image::ImageFormat::Jpeg, [255, 0, 0]), "image/jpeg")
        .await
        .unwrap();
    t.store
        .put("uploads/photo.png", solid(image::ImageFormat::Png, [0, 0, 255]), "image/png")
        .await
        .unwrap();
    t.catalog
        .insert(
            "photo.jpg",
            SourceRecord { is_private: true, owner_id: Some("u1".into()), ..record("uploads/photo.jpg") },
        )
        .unwrap();
    t.catalog.insert("photo.png", record("uploads/photo.png")).unwrap();

    let owner = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/cdn/photo.jpg?f=png")
                .header(header::AUTHORIZATION, "Bearer tok-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(owner.status(), StatusCode::OK);
    let private = image::load_from_memory(&body_bytes(owner).await).unwrap().to_rgb8();
    assert!(private.get_pixel(0, 0)[0] > 200);

    let anonymous = get(&t.app, "/cdn/photo.png?f=png").await;
    assert_eq!(anonymous.status(), StatusCode::OK);
    assert_eq!(header_str(&anonymous, "x-cache-status"), "MISS-TRANSFORMED");
    let public = image::load_from_memory(&body_bytes(anonymous).await).unwrap().to_rgb8();
    let pixel = public.get_pixel(0, 0);
    assert!(pixel[2] > 200 && pixel[0] < 50, "got {:?}", pixel);

    assert_eq!(t.cdn.cache.len(), 2);
    assert_eq!(t.store.get_count(), 2);
}

fn admin_request(method: &str, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(body).unwrap()
}

#[tokio::test]
async fn test_admin_routes_require_token() {
    let config = CdnConfig { admin_token: Some("admin-secret".into()), ..CdnConfig::default() };
    let t = setup(config).await;

    let missing = t.app.clone().oneshot(admin_request("DELETE", "/admin/cache", None, Body::empty())).await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = t
        .app
        .clone()
        .oneshot(admin_request("DELETE", "/admin/cache", Some("nope"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    // Without a configured token the routes do not exist
    let disabled = setup(CdnConfig::default()).await;
    let response = disabled
        .app
        .clone()
        .oneshot(admin_request("DELETE", "/admin/cache", Some("admin-secret"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_delete_invalidates_variants() {
    let config = CdnConfig { admin_token: Some("admin-secret".into()), ..CdnConfig::default() };
    let t = setup(config).await;

    get(&t.app, "/cdn/banner.png?w=100").await;
    get(&t.app, "/cdn/banner.png?w=50&f=webp").await;
    get(&t.app, "/cdn/banner.png").await;
    assert_eq!(t.cdn.cache.len(), 3);

    let response = t
        .app
        .clone()
        .oneshot(admin_request("DELETE", "/admin/objects/banner.png", Some("admin-secret"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["invalidated"], 3);
    assert!(t.cdn.cache.is_empty());

    assert_eq!(get(&t.app, "/cdn/banner.png?w=100").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_put_replaces_source() {
    let config = CdnConfig { admin_token: Some("admin-secret".into()), ..CdnConfig::default() };
    let t = setup(config).await;

    let before = get(&t.app, "/cdn/banner.png?w=100").await;
    let before_etag = header_str(&before, "etag").to_string();

    let img = image::DynamicImage::new_rgb8(50, 50);
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png).unwrap();
    let mut upload = admin_request("PUT", "/admin/objects/banner.png", Some("admin-secret"), Body::from(png));
    upload.headers_mut().insert(header::CONTENT_TYPE, "image/png".parse().unwrap());
    let response = t.app.clone().oneshot(upload).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["invalidated"], 1);

    let after = get(&t.app, "/cdn/banner.png?w=100").await;
    assert_eq!(header_str(&after, "x-cache-status"), "MISS-TRANSFORMED");
    assert_ne!(header_str(&after, "etag"), before_etag);
    let img = image::load_from_memory(&body_bytes(after).await).unwrap();
    assert_eq!(img.dimensions(), (50, 50));
}

#[tokio::test]
async fn test_admin_clear_and_purge() {
    let config = CdnConfig { admin_token: Some("admin-secret".into()), ..CdnConfig::default() };
    let t = setup(config).await;
    get(&t.app, "/cdn/banner.png?w=100").await;

    let purge = t
        .app
        .clone()
        .oneshot(admin_request("POST", "/admin/cache/purge", Some("admin-secret"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(body_json(purge).await["purged"], 0);

    let clear = t
        .app
        .clone()
        .oneshot(admin_request("DELETE", "/admin/cache", Some("admin-secret"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(body_json(clear).await["cleared"], 1);
    assert!(t.cdn.cache.is_empty());
}

#[tokio::test]
async fn test_observability_endpoints() {
    let t = setup(CdnConfig::default()).await;
    get(&t.app, "/cdn/banner.png?w=100").await;
    get(&t.app, "/cdn/banner.png?w=100").await;

    let health = body_json(get(&t.app, "/health").await).await;
    assert_eq!(health["status"], "healthy");

    let stats = body_json(get(&t.app, "/stats/cache").await).await;
    assert_eq!(stats["cache"]["entry_count"], 1);
    assert_eq!(stats["cache"]["max_entries"], 100);
    assert_eq!(stats["requests"]["cache_hits"], 1);
    assert_eq!(stats["requests"]["cache_misses"], 1);
    assert_eq!(stats["cache"]["hits"], 1);
    assert_eq!(stats["cache"]["misses"], 1);
    assert_eq!(stats["transforms"]["total"], 1);

    let metrics = get(&t.app, "/metrics").await;
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(metrics).await.to_vec()).unwrap();
    assert!(text.contains("imagecdn_cache_hits_total 1"));
}

#[tokio::test]
async fn test_disk_backend_serves_hits() {
    let dir = std::env::temp_dir().join(format!("imagecdn-it-{}", std::process::id()));
    let config = CdnConfig { cache_backend: CacheBackend::Disk, cache_dir: dir.clone(), ..CdnConfig::default() };
    let t = setup(config).await;

    let first = get(&t.app, "/cdn/banner.png?w=80&f=webp").await;
    assert_eq!(header_str(&first, "x-cache-status"), "MISS-TRANSFORMED");
    let first_body = body_bytes(first).await;

    let second = get(&t.app, "/cdn/banner.png?w=80&f=webp").await;
    assert_eq!(header_str(&second, "x-cache-status"), "HIT");
    assert_eq!(body_bytes(second).await, first_body);
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_shutdown_stops_purge_task() {
    let t = setup(CdnConfig::default()).await;
    let handle = t.cdn.spawn_purge_task();
    t.cdn.shutdown();
    assert!(t.cdn.is_shut_down());
    handle.await.unwrap();
}
