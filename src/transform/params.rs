use crate::config::{FitMode, ImageFormat};
use crate::CdnError;
use serde::Deserialize;
use std::str::FromStr;

/// Largest width or height a request may ask for. Outputs never exceed the
/// source either way; this bounds what a query can make the pipeline allocate.
pub const MAX_DIMENSION: u32 = 8192;

/// Transform requested for a stored image.
///
/// Absent fields mean "keep what the source has". `download` only shapes the
/// response headers and never takes part in the variant key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub format: Option<ImageFormat>,
    pub fit: Option<FitMode>,
    pub download: bool,
}

/// Raw query as sent by the client; short and long names are both accepted.
#[derive(Debug, Default, Deserialize)]
struct RawQuery {
    #[serde(alias = "width")]
    w: Option<String>,
    #[serde(alias = "height")]
    h: Option<String>,
    #[serde(alias = "quality")]
    q: Option<String>,
    #[serde(alias = "format")]
    f: Option<String>,
    fit: Option<String>,
    download: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_dimension(name: &str, raw: Option<String>) -> Result<Option<u32>, CdnError> {
    match non_empty(raw) {
        None => Ok(None),
        Some(s) => match s.parse::<u32>() {
            Ok(v) if (1..=MAX_DIMENSION).contains(&v) => Ok(Some(v)),
            _ => Err(CdnError::InvalidArgument(format!(
                "Invalid {}: {} (expected 1..={})",
                name, s, MAX_DIMENSION
            ))),
        },
    }
}

impl TransformOptions {
    /// True when nothing content-shaping was requested.
    pub fn is_passthrough(&self) -> bool {
        self.width.is_none()
            && self.height.is_none()
            && self.quality.is_none()
            && self.format.is_none()
            && self.fit.is_none()
    }

    pub fn resizes(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }

    /// Fills in the surface's default fit when a resize is requested, so the
    /// variant key always records the geometry that was actually produced.
    pub fn with_default_fit(mut self, fit: FitMode) -> Self {
        if self.resizes() && self.fit.is_none() {
            self.fit = Some(fit);
        }
        self
    }

    /// Content-shaping fields as `(name, value)` pairs, sorted by name.
    pub fn key_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::with_capacity(5);
        if let Some(fit) = self.fit { fields.push(("fit", fit.to_string())); }
        if let Some(f) = self.format { fields.push(("format", f.to_string())); }
        if let Some(h) = self.height { fields.push(("height", h.to_string())); }
        if let Some(q) = self.quality { fields.push(("quality", q.to_string())); }
        if let Some(w) = self.width { fields.push(("width", w.to_string())); }
        fields.sort_by(|a, b| a.0.cmp(b.0));
        fields
    }
}

impl FromStr for TransformOptions {
    type Err = CdnError;

    /// Parses and validates a URL query string such as `w=200&f=webp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: RawQuery = serde_urlencoded::from_str(s)
            .map_err(|e| CdnError::InvalidArgument(format!("Malformed query: {}", e)))?;

        let quality = match non_empty(raw.q) {
            None => None,
            Some(q) => match q.parse::<u8>() {
                Ok(v) if (1..=100).contains(&v) => Some(v),
                _ => return Err(CdnError::InvalidArgument(format!("Invalid quality: {}", q))),
            },
        };

        let format = non_empty(raw.f)
            .map(|f| f.parse::<ImageFormat>())
            .transpose()
            .map_err(CdnError::InvalidArgument)?;

        let fit = non_empty(raw.fit)
            .map(|f| f.parse::<FitMode>())
            .transpose()
            .map_err(CdnError::InvalidArgument)?;

        let download = match non_empty(raw.download).as_deref() {
            None | Some("false") | Some("0") => false,
            Some("true") | Some("1") => true,
            Some(other) => {
                return Err(CdnError::InvalidArgument(format!("Invalid download flag: {}", other)))
            }
        };

        Ok(Self {
            width: parse_dimension("width", raw.w)?,
            height: parse_dimension("height", raw.h)?,
            quality,
            format,
            fit,
            download,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_names() {
        let a: TransformOptions = "w=300&h=200&f=webp&q=75&fit=inside".parse().unwrap();
        let b: TransformOptions = "width=300&height=200&format=webp&quality=75&fit=inside".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.width, Some(300));
        assert_eq!(a.fit, Some(FitMode::Inside));
    }

    #[test]
    fn empty_query_is_passthrough() {
        let opts: TransformOptions = "".parse().unwrap();
        assert!(opts.is_passthrough());
        let download: TransformOptions = "download=true".parse().unwrap();
        assert!(download.is_passthrough());
        assert!(download.download);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!("q=0".parse::<TransformOptions>().is_err());
        assert!("q=101".parse::<TransformOptions>().is_err());
        assert!("w=-5".parse::<TransformOptions>().is_err());
        assert!("w=0".parse::<TransformOptions>().is_err());
        assert!("f=gif".parse::<TransformOptions>().is_err());
        assert!("fit=stretch".parse::<TransformOptions>().is_err());
        assert!("download=maybe".parse::<TransformOptions>().is_err());
    }

    #[test]
    fn dimensions_are_bounded() {
        let max: TransformOptions = format!("w={}&h={}", MAX_DIMENSION, MAX_DIMENSION).parse().unwrap();
        assert_eq!(max.width, Some(MAX_DIMENSION));

        for query in ["w=8193", "h=20000", "w=4000000000&h=1&fit=contain", "w=99999999999"] {
            let err = query.parse::<TransformOptions>().unwrap_err();
            assert!(matches!(err, CdnError::InvalidArgument(_)), "{}", query);
        }
    }

    #[test]
    fn default_fit_only_applies_to_resizes() {
        let resize: TransformOptions = "w=100".parse().unwrap();
        assert_eq!(resize.with_default_fit(FitMode::Cover).fit, Some(FitMode::Cover));
        let reformat: TransformOptions = "f=png".parse().unwrap();
        assert_eq!(reformat.with_default_fit(FitMode::Cover).fit, None);
    }
}
