use super::{Blob, BlobStore};
use crate::config::ImageFormat;
use crate::key::normalize_key;
use crate::{CdnError, Result};
use bytes::Bytes;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tokio::fs;

/// Originals stored as plain files below a root directory.
///
/// The freshness token is the file's modification time in milliseconds; the
/// content type is guessed from the extension.
pub struct FsBlobStore {
    root: PathBuf,
    max_size: usize,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, max_size: usize) -> Self {
        Self { root: root.into(), max_size }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let normalized = normalize_key(key)?;
        Ok(self.root.join(normalized))
    }
}

fn io_error(key: &str, e: std::io::Error) -> CdnError {
    match e.kind() {
        std::io::ErrorKind::NotFound => CdnError::NotFound(key.to_string()),
        std::io::ErrorKind::PermissionDenied => CdnError::AccessDenied(key.to_string()),
        _ => CdnError::Transient(e.to_string()),
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Blob> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| io_error(key, e))?;
        if !meta.is_file() {
            return Err(CdnError::NotFound(key.to_string()));
        }
        if meta.len() as usize > self.max_size {
            return Err(CdnError::InvalidArgument("Input exceeds size limit".into()));
        }

        let bytes = fs::read(&path).await.map_err(|e| io_error(key, e))?;
        let etag = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis().to_string());
        let content_type = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageFormat::from_extension)
            .map(|f| f.content_type().to_string());

        Ok(Blob { bytes: Bytes::from(bytes), content_type, etag })
    }

    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_error(key, e))?;
        }
        fs::write(&path, &bytes).await.map_err(|e| io_error(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_reads_and_deletes_files() {
        let root = std::env::temp_dir().join(format!("imagecdn-fs-blob-{}", std::process::id()));
        let store = FsBlobStore::new(&root, 1024);

        store.put("albums/cover.png", Bytes::from_static(b"png"), "image/png").await.unwrap();
        let blob = store.get("albums/cover.png").await.unwrap();
        assert_eq!(&blob.bytes[..], b"png");
        assert_eq!(blob.content_type.as_deref(), Some("image/png"));
        assert!(blob.etag.is_some());

        store.delete("albums/cover.png").await.unwrap();
        assert!(matches!(store.get("albums/cover.png").await, Err(CdnError::NotFound(_))));
        // deleting twice is fine
        store.delete("albums/cover.png").await.unwrap();
        assert!(matches!(store.get("../outside.png").await, Err(CdnError::InvalidKey(_))));

        let _ = fs::remove_dir_all(&root).await;
    }
}
