use std::time::Duration;

/// `Cache-Control` policy for one class of response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheControl {
    /// Browser and shared cache lifetime in seconds (`max-age`).
    pub max_age: u64,

    /// Allow shared caches (CDNs, proxies) to store the response.
    pub public: bool,

    /// Content at this URL never changes for the lifetime of the response.
    pub immutable: bool,
}

impl CacheControl {
    /// Transformed variants: the query string fully determines the bytes.
    pub fn for_variant(ttl: Duration) -> Self {
        Self { max_age: ttl.as_secs(), public: true, immutable: true }
    }

    /// Untransformed originals may be replaced under the same key.
    pub fn for_passthrough(max_age: Duration) -> Self {
        Self { max_age: max_age.as_secs(), public: true, immutable: false }
    }

    /// Private objects are only cacheable by the requesting browser.
    pub fn for_private(max_age: Duration) -> Self {
        Self { max_age: max_age.as_secs(), public: false, immutable: false }
    }

    /// Error responses and admin endpoints.
    pub fn no_cache() -> Self {
        Self { max_age: 0, public: false, immutable: false }
    }

    pub fn header_value(&self) -> String {
        if self.max_age == 0 {
            return "no-store, no-cache, must-revalidate".to_string();
        }

        let mut parts = vec![
            if self.public { "public" } else { "private" }.to_string(),
            format!("max-age={}", self.max_age),
        ];
        if self.immutable {
            parts.push("immutable".to_string());
        }
        parts.join(", ")
    }
}
