use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Output formats the transform pipeline can encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
    Avif,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Avif => "image/avif",
        }
    }

    /// Quality used when the request does not carry `q`.
    ///
    /// PNG is lossless; its value is recorded for completeness but never
    /// reaches the encoder.
    pub fn default_quality(self) -> u8 {
        match self {
            ImageFormat::Jpeg => 85,
            ImageFormat::Png => 90,
            ImageFormat::Webp => 80,
            ImageFormat::Avif => 70,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::Webp),
            "avif" => Some(ImageFormat::Avif),
            _ => None,
        }
    }

    pub fn from_content_type(ct: &str) -> Option<Self> {
        let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            "image/webp" => Some(ImageFormat::Webp),
            "image/avif" => Some(ImageFormat::Avif),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            "webp" => Ok(ImageFormat::Webp),
            "avif" => Ok(ImageFormat::Avif),
            _ => Err(format!("Invalid format: {}", s)),
        }
    }
}

/// Resize fit modes, named after their CSS `object-fit` counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    Cover,
    Contain,
    Fill,
    Inside,
    Outside,
}

impl std::fmt::Display for FitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FitMode::Cover => "cover",
            FitMode::Contain => "contain",
            FitMode::Fill => "fill",
            FitMode::Inside => "inside",
            FitMode::Outside => "outside",
        };
        f.write_str(s)
    }
}

impl FromStr for FitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cover" => Ok(FitMode::Cover),
            "contain" => Ok(FitMode::Contain),
            "fill" => Ok(FitMode::Fill),
            "inside" => Ok(FitMode::Inside),
            "outside" => Ok(FitMode::Outside),
            _ => Err(format!("Invalid fit mode: {}", s)),
        }
    }
}

/// Where cached variant payloads live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Disk,
}

impl FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheBackend::Memory),
            "disk" => Ok(CacheBackend::Disk),
            other => Err(ConfigError::Invalid("IMAGECDN_CACHE_BACKEND", other.to_string())),
        }
    }
}

/// Backing store the original images are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobBackend {
    /// Object store reachable over HTTP (`GET/PUT/DELETE {endpoint}/{key}`).
    Http { endpoint: String, token: Option<String> },
    /// Local directory, one file per storage key.
    Fs { dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct CdnConfig {
    pub cache_backend: CacheBackend,
    pub cache_dir: PathBuf,
    pub max_entries: usize,
    /// TTL of cached variants; also the `max-age` of transformed responses.
    pub cache_ttl: Duration,
    /// `max-age` for untransformed originals.
    pub passthrough_max_age: Duration,
    pub purge_interval: Duration,
    pub rate_limit_points: u32,
    pub rate_limit_duration: Duration,
    /// Take the client address from `X-Forwarded-For` when behind a proxy.
    pub trust_forwarded: bool,
    pub fetch_timeout: Duration,
    pub max_input_size: usize, // bytes
    pub blob: BlobBackend,
    pub catalog_path: Option<PathBuf>,
    pub admin_token: Option<String>,
    pub port: u16,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            cache_backend: CacheBackend::Memory,
            cache_dir: PathBuf::from("./cache"),
            max_entries: 100,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            passthrough_max_age: Duration::from_secs(60 * 60),
            purge_interval: Duration::from_secs(24 * 60 * 60),
            rate_limit_points: 100,
            rate_limit_duration: Duration::from_secs(300),
            trust_forwarded: false,
            fetch_timeout: Duration::from_secs(10),
            max_input_size: 8 * 1024 * 1024,
            blob: BlobBackend::Fs { dir: PathBuf::from("./media") },
            catalog_path: None,
            admin_token: None,
            port: 8080,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
    #[error("Max entries must be > 0")]
    InvalidMaxEntries,
    #[error("Rate limit points and duration must be > 0")]
    InvalidRateLimit,
    #[error("Max input size must be > 0")]
    InvalidMaxInput,
    #[error("Fetch timeout must be > 0")]
    InvalidTimeout,
    #[error("Blob endpoint cannot be empty")]
    EmptyEndpoint,
}

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, raw)),
        None => Ok(None),
    }
}

fn env_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

impl CdnConfig {
    /// Loads configuration from `IMAGECDN_*` environment variables, falling
    /// back to [`CdnConfig::default`] for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let blob = match env_var("IMAGECDN_BLOB_BACKEND").as_deref() {
            Some("http") => BlobBackend::Http {
                endpoint: env_var("IMAGECDN_BLOB_ENDPOINT").unwrap_or_default(),
                token: env_var("IMAGECDN_BLOB_TOKEN"),
            },
            Some("fs") | None => BlobBackend::Fs {
                dir: env_var("IMAGECDN_BLOB_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./media")),
            },
            Some(other) => {
                return Err(ConfigError::Invalid("IMAGECDN_BLOB_BACKEND", other.to_string()))
            }
        };

        let cfg = Self {
            cache_backend: env_parse("IMAGECDN_CACHE_BACKEND")?.unwrap_or(defaults.cache_backend),
            cache_dir: env_var("IMAGECDN_CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            max_entries: env_parse("IMAGECDN_MAX_ENTRIES")?.unwrap_or(defaults.max_entries),
            cache_ttl: env_secs("IMAGECDN_CACHE_TTL_SECS")?.unwrap_or(defaults.cache_ttl),
            passthrough_max_age: env_secs("IMAGECDN_PASSTHROUGH_MAX_AGE_SECS")?
                .unwrap_or(defaults.passthrough_max_age),
            purge_interval: env_secs("IMAGECDN_PURGE_INTERVAL_SECS")?.unwrap_or(defaults.purge_interval),
            rate_limit_points: env_parse("IMAGECDN_RATE_LIMIT_POINTS")?.unwrap_or(defaults.rate_limit_points),
            rate_limit_duration: env_secs("IMAGECDN_RATE_LIMIT_DURATION_SECS")?
                .unwrap_or(defaults.rate_limit_duration),
            trust_forwarded: env_parse("IMAGECDN_TRUST_FORWARDED")?.unwrap_or(defaults.trust_forwarded),
            fetch_timeout: env_secs("IMAGECDN_FETCH_TIMEOUT_SECS")?.unwrap_or(defaults.fetch_timeout),
            max_input_size: env_parse("IMAGECDN_MAX_INPUT_SIZE")?.unwrap_or(defaults.max_input_size),
            blob,
            catalog_path: env_var("IMAGECDN_CATALOG").map(PathBuf::from),
            admin_token: env_var("IMAGECDN_ADMIN_TOKEN"),
            // Cloud platforms inject PORT
            port: env_parse("PORT")?.unwrap_or(defaults.port),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 { return Err(ConfigError::InvalidMaxEntries); }
        if self.rate_limit_points == 0 || self.rate_limit_duration.is_zero() {
            return Err(ConfigError::InvalidRateLimit);
        }
        if self.max_input_size == 0 { return Err(ConfigError::InvalidMaxInput); }
        if self.fetch_timeout.is_zero() { return Err(ConfigError::InvalidTimeout); }
        if self.purge_interval.is_zero() {
            return Err(ConfigError::Invalid("IMAGECDN_PURGE_INTERVAL_SECS", "0".into()));
        }
        if let BlobBackend::Http { endpoint, .. } = &self.blob {
            if endpoint.trim().is_empty() { return Err(ConfigError::EmptyEndpoint); }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CdnConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let cfg = CdnConfig { max_entries: 0, ..CdnConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidMaxEntries)));
    }

    #[test]
    fn http_backend_needs_endpoint() {
        let cfg = CdnConfig {
            blob: BlobBackend::Http { endpoint: " ".into(), token: None },
            ..CdnConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyEndpoint)));
    }

    #[test]
    fn format_lookup_by_extension_and_content_type() {
        assert_eq!(ImageFormat::from_extension("JPG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_content_type("image/webp; q=1"), Some(ImageFormat::Webp));
        assert_eq!(ImageFormat::from_content_type("image/gif"), None);
        assert_eq!("avif".parse::<ImageFormat>(), Ok(ImageFormat::Avif));
    }
}
