//! S3-compatible object store using presigned requests.
//!
//! Requests are signed with `rusty-s3` (path-style addressing) and sent with
//! `reqwest`. Uploads carry an explicit `Content-Length` and the payload's
//! SHA-256 as object metadata, which `HEAD` and `GET` report back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use reqwest::{Client, StatusCode};
use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use tracing::{debug, warn};

use super::{ObjectBody, ObjectMeta, ObjectStore, ObjectSummary, PutMeta, StoredObject};
use crate::config::StoreCredentials;
use crate::context::ArtifactKey;
use crate::error::{ArchiveError, ArchiveResult};

/// Validity of presigned URLs.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// Object metadata header carrying the payload checksum.
pub const CHECKSUM_HEADER: &str = "x-amz-meta-sha256";

/// S3 backend.
pub struct S3ObjectStore {
    bucket: Bucket,
    credentials: Credentials,
    client: Client,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket.name())
            .field("endpoint", &self.bucket.base_url().as_str())
            .finish()
    }
}

impl S3ObjectStore {
    /// Build a client for `bucket`. Without an explicit endpoint the AWS
    /// regional endpoint is used.
    pub fn new(
        bucket: &str,
        region: &str,
        endpoint: Option<&str>,
        credentials: &StoreCredentials,
        connect_timeout: Duration,
    ) -> ArchiveResult<Self> {
        let endpoint = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", region));
        let base_url = endpoint
            .parse()
            .map_err(|e| ArchiveError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;
        let bucket = Bucket::new(base_url, UrlStyle::Path, bucket.to_string(), region.to_string())
            .map_err(|e| ArchiveError::Config(format!("failed to create S3 bucket handle: {e}")))?;
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ArchiveError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            bucket,
            credentials: Credentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
            ),
            client,
        })
    }
}

/// Map an unsuccessful HTTP status onto the error taxonomy.
pub fn classify_status(op: &str, status: StatusCode, body: &str) -> ArchiveError {
    let reason = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, truncate(body, 256))
    };
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ArchiveError::transient(op, reason)
    } else {
        ArchiveError::permanent(op, reason)
    }
}

fn classify_transport(op: &str, err: reqwest::Error) -> ArchiveError {
    if err.is_builder() {
        ArchiveError::permanent(op, err)
    } else {
        ArchiveError::transient(op, err)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn header_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn header_checksum(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
}

/// Objects and continuation token from one ListObjectsV2 page.
fn parse_listing(op: &str, body: &[u8]) -> ArchiveResult<(Vec<ObjectSummary>, Option<String>)> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ArchiveError::permanent(op, format!("listing is not utf-8: {e}")))?;
    let parsed = ListObjectsV2::parse_response(text)
        .map_err(|e| ArchiveError::permanent(op, format!("unparseable listing: {e}")))?;
    let objects = parsed
        .contents
        .into_iter()
        .filter(|obj| !obj.key.ends_with('/'))
        .map(|obj| ObjectSummary {
            key: obj.key,
            size: obj.size,
        })
        .collect();
    Ok((objects, parsed.next_continuation_token))
}

async fn error_for(op: &str, resp: reqwest::Response) -> ArchiveError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    classify_status(op, status, &body)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &ArtifactKey, body: ObjectBody, meta: &PutMeta) -> ArchiveResult<()> {
        let op = format!("PUT {}", key);
        let mut action = self.bucket.put_object(Some(&self.credentials), key.as_str());
        action.headers_mut().insert(CHECKSUM_HEADER, meta.checksum.clone());
        let url = action.sign(PRESIGN_DURATION);

        let len = body.len();
        let payload = match body {
            ObjectBody::Bytes(b) => reqwest::Body::from(b),
            ObjectBody::File { file, .. } => reqwest::Body::from(tokio::fs::File::from_std(file)),
        };
        let resp = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .header(CHECKSUM_HEADER, meta.checksum.as_str())
            .body(payload)
            .send()
            .await
            .map_err(|e| classify_transport(&op, e))?;
        if !resp.status().is_success() {
            return Err(error_for(&op, resp).await);
        }
        debug!(key = %key, len, "s3 put");
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> ArchiveResult<Option<StoredObject>> {
        let op = format!("GET {}", key);
        let url = self
            .bucket
            .get_object(Some(&self.credentials), key.as_str())
            .sign(PRESIGN_DURATION);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(&op, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(error_for(&op, resp).await);
        }
        let checksum = header_checksum(resp.headers());
        let declared = header_content_length(resp.headers());
        let data = resp.bytes().await.map_err(|e| classify_transport(&op, e))?;
        if let Some(declared) = declared {
            if declared != data.len() as u64 {
                return Err(ArchiveError::transient(
                    &op,
                    format!("short body: {} of {} bytes", data.len(), declared),
                ));
            }
        }
        Ok(Some(StoredObject { data, checksum }))
    }

    async fn head(&self, key: &ArtifactKey) -> ArchiveResult<Option<ObjectMeta>> {
        let op = format!("HEAD {}", key);
        let url = self
            .bucket
            .head_object(Some(&self.credentials), key.as_str())
            .sign(PRESIGN_DURATION);
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| classify_transport(&op, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(classify_status(&op, resp.status(), ""));
        }
        let size = header_content_length(resp.headers())
            .ok_or_else(|| ArchiveError::permanent(&op, "response has no Content-Length"))?;
        Ok(Some(ObjectMeta {
            size,
            checksum: header_checksum(resp.headers()),
        }))
    }

    async fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectSummary>> {
        let op = format!("LIST {}", prefix);
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", prefix);
            if let Some(token) = &continuation {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| classify_transport(&op, e))?;
            if !resp.status().is_success() {
                return Err(error_for(&op, resp).await);
            }
            let body = resp.bytes().await.map_err(|e| classify_transport(&op, e))?;
            let (page, next) = parse_listing(&op, &body)?;
            out.extend(page);
            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn delete(&self, key: &ArtifactKey) -> ArchiveResult<()> {
        let op = format!("DELETE {}", key);
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), key.as_str())
            .sign(PRESIGN_DURATION);
        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| classify_transport(&op, e))?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let err = error_for(&op, resp).await;
        warn!(key = %key, error = %err, "s3 delete failed");
        Err(err)
    }
}
