use crate::cache::{CacheControl, CachedVariant};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use time::macros::format_description;
use time::OffsetDateTime;

pub const X_CACHE_STATUS: HeaderName = HeaderName::from_static("x-cache-status");

/// How a response was produced, reported in `X-Cache-Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    MissTransformed,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::MissTransformed => "MISS-TRANSFORMED",
        }
    }
}

/// True when `If-None-Match` lists `etag` (weak comparison) or is `*`.
pub fn is_not_modified(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let wanted = strip_weak(etag);
    value
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || strip_weak(candidate) == wanted)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

/// IMF-fixdate as used by `Last-Modified`.
pub fn http_date(at: OffsetDateTime) -> String {
    let fmt = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    at.to_offset(time::UtcOffset::UTC)
        .format(&fmt)
        .unwrap_or_default()
}

/// Everything needed to render an image response.
pub struct ImageResponse<'a> {
    pub variant: &'a CachedVariant,
    pub status: CacheStatus,
    pub cache_control: CacheControl,
    /// `Some(file name)` when the client asked for a download.
    pub attachment: Option<&'a str>,
}

impl ImageResponse<'_> {
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let v = self.variant;
        if let Ok(value) = HeaderValue::from_str(&v.etag) {
            headers.insert(header::ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.cache_control.header_value()) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        if let Ok(value) = HeaderValue::from_str(&http_date(v.stored_at)) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        headers.insert(header::VARY, HeaderValue::from_static("Accept"));
        headers.insert(X_CACHE_STATUS, HeaderValue::from_static(self.status.as_str()));
        headers
    }

    /// `304` with validators only, or `200` with the payload.
    pub fn render(self, request_headers: &HeaderMap) -> Response {
        let mut headers = self.headers();
        if is_not_modified(request_headers, &self.variant.etag) {
            return (StatusCode::NOT_MODIFIED, headers).into_response();
        }

        let content_type = HeaderValue::from_str(&self.variant.content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream"));
        headers.insert(header::CONTENT_TYPE, content_type);
        if let Some(name) = self.attachment {
            // Quotes and control characters cannot appear in a quoted filename
            let safe: String = name.chars().filter(|c| *c != '"' && *c != '\\' && !c.is_control()).collect();
            if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe)) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }
        (StatusCode::OK, headers, Body::from(self.variant.bytes.clone())).into_response()
    }
}
