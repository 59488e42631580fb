use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the image CDN.
///
/// Simulates production traffic against a running server:
/// - repeated variants of a small set of images (cache hits)
/// - randomized dimensions (cache misses, fetch + transform)
/// - dashboard-surface requests with the `inside` fit default
/// - health and stats monitoring endpoints
///
/// The server's rate limit must be raised for the run
/// (`IMAGECDN_RATE_LIMIT_POINTS`), otherwise most requests end in 429.
///
/// # Usage
/// ```bash
/// cd loadtest
/// LOADTEST_IMAGE=banner.png cargo run --release -- --host http://localhost:8080 --users 10 --hatch-rate 2 --run-time 60s
/// ```
///
/// # Performance Targets
/// - Cache hits: <20ms p95 latency
/// - Cache misses: <200ms p95 latency (WebP) / <400ms (AVIF)
/// - Error rate: <1%

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("CachePerformance")
                // Consistent parameters validate cache hit performance
                .register_transaction(transaction!(cached_image).set_weight(15)?)
                // Unique parameters validate transformation throughput
                .register_transaction(transaction!(uncached_image).set_weight(5)?)
                .register_transaction(transaction!(original_image).set_weight(3)?)
        )
        .register_scenario(
            scenario!("Dashboard")
                .register_transaction(transaction!(dashboard_thumbnail).set_weight(10)?)
                .register_transaction(transaction!(cache_stats).set_weight(1)?)
                // Continuous health validation ensures service availability
                .register_transaction(transaction!(health_check).set_weight(1)?)
        )
        .execute()
        .await?;

    Ok(())
}

fn image_key() -> String {
    std::env::var("LOADTEST_IMAGE").unwrap_or_else(|_| "banner.png".to_string())
}

/// Fixed parameters: every request after the first is a cache hit.
async fn cached_image(user: &mut GooseUser) -> TransactionResult {
    let url = format!("/cdn/{}?w=500&h=500&f=webp&q=80", image_key());
    let _goose = user.get(&url).await?;
    Ok(())
}

/// Randomized dimensions spread requests over many variant keys, measuring
/// fetch + transform latency and eviction churn.
async fn uncached_image(user: &mut GooseUser) -> TransactionResult {
    // Generate random parameters before await to satisfy Send bounds
    let url = {
        let mut rng = rand::thread_rng();
        let width = rng.gen_range(100..1000);
        let height = rng.gen_range(100..1000);
        let formats = ["webp", "jpeg", "avif", "png"];
        let format = formats[rng.gen_range(0..formats.len())];
        format!("/cdn/{}?w={}&h={}&f={}", image_key(), width, height, format)
    };

    let _goose = user.get(&url).await?;
    Ok(())
}

/// Untransformed original, served through the same bounded cache.
async fn original_image(user: &mut GooseUser) -> TransactionResult {
    let url = format!("/cdn/{}", image_key());
    let _goose = user.get(&url).await?;
    Ok(())
}

/// Thumbnails as the dashboard requests them (fit defaults to `inside`).
async fn dashboard_thumbnail(user: &mut GooseUser) -> TransactionResult {
    let url = {
        let mut rng = rand::thread_rng();
        let sizes = [64, 128, 256];
        let size = sizes[rng.gen_range(0..sizes.len())];
        format!("/images/{}?w={}&h={}", image_key(), size, size)
    };

    let _goose = user.get(&url).await?;
    Ok(())
}

/// Samples cache statistics the way a monitoring scraper would.
async fn cache_stats(user: &mut GooseUser) -> TransactionResult {
    let mut goose = user.get("/stats/cache").await?;
    if let Ok(response) = goose.response {
        let stats = response.text().await.ok().and_then(|t| serde_json::from_str::<serde_json::Value>(&t).ok());
        if let Some(stats) = stats {
            if stats["cache"]["entry_count"].as_u64() > stats["cache"]["max_entries"].as_u64() {
                return user.set_failure("cache exceeded capacity", &mut goose.request, None, None);
            }
        }
    }
    Ok(())
}

/// Monitors service availability via health check endpoint.
async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/health").await?;
    Ok(())
}
