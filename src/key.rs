//! Variant key derivation.
//!
//! A variant key is `{base}?{field_value-field_value}.{ext}` where `base` is
//! the normalized source key (extension included), the fields are the
//! content-shaping transform options sorted by name, and `ext` is the output
//! extension. Untransformed originals are cached under `base` itself.
//!
//! `?` never survives [`normalize_key`], so a variant key maps back to exactly
//! one source and no source key can pose as a variant of another.

use crate::transform::params::TransformOptions;
use crate::CdnError;
use sha2::{Digest, Sha256};

/// Longest base key accepted from a request.
pub const MAX_KEY_LEN: usize = 1024;

/// Longest file name the disk backend will create.
pub const MAX_FILE_NAME_LEN: usize = 200;

const FIELD_SEPARATOR: &str = "-";
const PAIR_SEPARATOR: char = '_';
const PARAMS_SEPARATOR: char = '?';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    key: String,
    base: String,
    params: String,
    extension: String,
}

impl VariantKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The prefix shared by every variant of the same source.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Download name for `Content-Disposition`: the source file stem, the
    /// params and the output extension, e.g. `banner_fit_cover-width_100.png`.
    pub fn file_name(&self) -> String {
        let name = self.base.rsplit('/').next().unwrap_or(&self.base);
        if self.params.is_empty() {
            return name.to_string();
        }
        let (stem, _) = split_extension(name);
        let mut file_name = format!("{}{}{}", stem, PAIR_SEPARATOR, self.params);
        if !self.extension.is_empty() {
            file_name.push('.');
            file_name.push_str(&self.extension);
        }
        file_name
    }
}

impl std::fmt::Display for VariantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Normalizes a storage key: drops empty and `.` segments, rejects `..`,
/// `?`, NUL and control characters.
pub fn normalize_key(raw: &str) -> Result<String, CdnError> {
    if raw.len() > MAX_KEY_LEN {
        return Err(CdnError::InvalidKey("key too long".into()));
    }
    if raw.chars().any(|c| c == '\0' || c.is_control()) {
        return Err(CdnError::InvalidKey("key contains control characters".into()));
    }
    if raw.contains(PARAMS_SEPARATOR) {
        return Err(CdnError::InvalidKey("key contains '?'".into()));
    }

    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(CdnError::InvalidKey("path traversal".into())),
            s if s.contains("..") => return Err(CdnError::InvalidKey("path traversal".into())),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(CdnError::InvalidKey("empty key".into()));
    }
    Ok(segments.join("/"))
}

/// Splits `dir/name.ext` into (`dir/name`, `ext`); dotfiles keep their name.
fn split_extension(key: &str) -> (&str, &str) {
    let name_start = key.rfind('/').map(|i| i + 1).unwrap_or(0);
    match key[name_start..].rfind('.') {
        Some(0) | None => (key, ""),
        Some(i) => (&key[..name_start + i], &key[name_start + i + 1..]),
    }
}

/// Base of a source key as used by [`canonicalize`], for prefix invalidation.
pub fn base_of(raw: &str) -> Result<String, CdnError> {
    normalize_key(raw)
}

/// Derives the cache key of the variant `options` describes.
pub fn canonicalize(base_key: &str, options: &TransformOptions) -> Result<VariantKey, CdnError> {
    let base = normalize_key(base_key)?;
    let fields = options.key_fields();
    if fields.is_empty() {
        let extension = split_extension(&base).1.to_string();
        return Ok(VariantKey { key: base.clone(), base, params: String::new(), extension });
    }

    let extension = match options.format {
        Some(f) => f.extension().to_string(),
        None => split_extension(&base).1.to_ascii_lowercase(),
    };
    let params = fields
        .iter()
        .map(|(name, value)| format!("{}{}{}", name, PAIR_SEPARATOR, value))
        .collect::<Vec<_>>()
        .join(FIELD_SEPARATOR);

    let mut key = String::with_capacity(base.len() + params.len() + extension.len() + 2);
    key.push_str(&base);
    key.push(PARAMS_SEPARATOR);
    key.push_str(&params);
    if !extension.is_empty() {
        key.push('.');
        key.push_str(&extension);
    }

    Ok(VariantKey { key, base, params, extension })
}

/// True when `key` belongs to the source whose base is `base`.
///
/// `photo.jpg` matches `photo.jpg` and `photo.jpg?width_100.webp` but neither
/// `photo.jpg.bak` nor `photo.png?width_100.webp`.
pub fn matches_base(key: &str, base: &str) -> bool {
    match key.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with(PARAMS_SEPARATOR),
        None => false,
    }
}

/// File name safe for any common filesystem.
///
/// Characters outside `[A-Za-z0-9._-]` are escaped as `~XX`; names that would
/// exceed [`MAX_FILE_NAME_LEN`] collapse to a SHA-256 digest.
pub fn storage_file_name(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => escaped.push(b as char),
            other => escaped.push_str(&format!("~{:02X}", other)),
        }
    }

    // Leading dots would hide the file or alias `.` and `..`
    if escaped.starts_with('.') {
        escaped.replace_range(0..1, "~2E");
    }

    if escaped.len() <= MAX_FILE_NAME_LEN {
        return escaped;
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
