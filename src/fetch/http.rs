use super::{Blob, BlobStore};
use crate::{CdnError, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mime::Mime;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Object store reached over plain HTTP: `GET`, `PUT` and `DELETE` on
/// `{endpoint}/{key}`, optionally with a bearer token.
///
/// Fits R2/S3 buckets fronted by a signing proxy or worker, and any static
/// origin for read-only use.
pub struct HttpBlobStore {
    client: Client,
    endpoint: String,
    token: Option<String>,
    max_size: usize,
}

impl HttpBlobStore {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, max_size: usize, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CdnError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            max_size,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key.trim_start_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn map_send_error(key: &str, e: reqwest::Error) -> CdnError {
    if e.is_timeout() {
        CdnError::Transient(format!("request for {} timed out", key))
    } else {
        CdnError::Transient(e.to_string())
    }
}

fn map_status(key: &str, status: StatusCode) -> CdnError {
    match status {
        StatusCode::NOT_FOUND => CdnError::NotFound(key.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CdnError::AccessDenied(key.to_string()),
        s => CdnError::Transient(format!("Upstream status: {}", s)),
    }
}

#[async_trait::async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, key: &str) -> Result<Blob> {
        let resp = self
            .authorize(self.client.get(self.url_for(key)))
            .send()
            .await
            .map_err(|e| map_send_error(key, e))?;

        if !resp.status().is_success() {
            return Err(map_status(key, resp.status()));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(m) = content_type.as_deref().and_then(|ct| ct.parse::<Mime>().ok()) {
            if m.type_() != mime::IMAGE && m != mime::APPLICATION_OCTET_STREAM {
                return Err(CdnError::InvalidArgument(format!("{} is not an image", key)));
            }
        }

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Pre-flight size check based on Content-Length
        if let Some(len) = resp.content_length() {
            if len as usize > self.max_size {
                return Err(CdnError::InvalidArgument("Input exceeds size limit".into()));
            }
        }

        // Enforce the limit while streaming; Content-Length may lie
        let mut buf = BytesMut::with_capacity(8192);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream
            .next()
            .await
            .transpose()
            .map_err(|e| map_send_error(key, e))?
        {
            if buf.len() + chunk.len() > self.max_size {
                return Err(CdnError::InvalidArgument("Input exceeds size limit".into()));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(Blob { bytes: buf.freeze(), content_type, etag })
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        let resp = self
            .authorize(self.client.put(self.url_for(key)))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| map_send_error(key, e))?;
        if !resp.status().is_success() {
            return Err(map_status(key, resp.status()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .authorize(self.client.delete(self.url_for(key)))
            .send()
            .await
            .map_err(|e| map_send_error(key, e))?;
        // Deleting an already absent object is not an error
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(map_status(key, resp.status()));
        }
        Ok(())
    }
}
