//! In-process object store with fault injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ObjectBody, ObjectMeta, ObjectStore, ObjectSummary, PutMeta, StoredObject};
use crate::context::ArtifactKey;
use crate::error::{ArchiveError, ArchiveResult};

/// Store operation a fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `put`
    Put,
    /// `get`
    Get,
    /// `head`
    Head,
    /// `list`
    List,
    /// `delete`
    Delete,
}

/// A scripted misbehaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a retryable error.
    Transient,
    /// Fail with a non-retryable error.
    Permanent,
    /// Accept a put but keep only the first half of the payload.
    ShortWrite,
    /// Sleep before serving the call.
    Delay(Duration),
}

#[derive(Debug)]
struct FaultRule {
    op: StoreOp,
    key_fragment: String,
    fault: Fault,
    remaining: usize,
}

/// Statistics for the memory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStoreStats {
    /// Put calls, including failed ones.
    pub put_attempts: u64,
    /// Puts that stored an object.
    pub puts: u64,
    /// Get calls.
    pub gets: u64,
    /// Head calls.
    pub heads: u64,
    /// List calls.
    pub lists: u64,
    /// Delete calls.
    pub deletes: u64,
    /// Faults that fired.
    pub faults_fired: u64,
    /// Total bytes currently stored.
    pub bytes_stored: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    checksum: Option<String>,
}

/// In-memory object store used by tests and `memory://` contexts.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Entry>>,
    faults: Mutex<Vec<FaultRule>>,
    put_attempts: Mutex<HashMap<String, u32>>,
    stats: Mutex<MemoryStoreStats>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `fault` on the next `times` calls of `op` whose key (or list
    /// prefix) contains `key_fragment`. An empty fragment matches every key.
    pub fn inject(&self, op: StoreOp, key_fragment: impl Into<String>, fault: Fault, times: usize) {
        self.faults.lock().unwrap().push(FaultRule {
            op,
            key_fragment: key_fragment.into(),
            fault,
            remaining: times,
        });
    }

    /// Drop all pending faults.
    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    /// Get statistics about store operations.
    pub fn stats(&self) -> MemoryStoreStats {
        self.stats.lock().unwrap().clone()
    }

    /// Put attempts seen for one key.
    pub fn put_attempts(&self, key: &str) -> u32 {
        self.put_attempts
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Stored payload of `key`, bypassing faults.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|e| e.data.clone())
    }

    /// Place an object directly, without a checksum.
    pub fn insert_raw(&self, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let mut stats = self.stats.lock().unwrap();
        let mut objects = self.objects.lock().unwrap();
        stats.bytes_stored += data.len() as u64;
        if let Some(old) = objects.insert(
            key.to_string(),
            Entry {
                data,
                checksum: None,
            },
        ) {
            stats.bytes_stored -= old.data.len() as u64;
        }
    }

    /// Flip one byte in the middle of a stored payload, keeping its
    /// recorded checksum. Returns false when the key is absent or empty.
    pub fn corrupt(&self, key: &str) -> bool {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(key) {
            Some(entry) if !entry.data.is_empty() => {
                let mut data = entry.data.to_vec();
                let mid = data.len() / 2;
                data[mid] ^= 0xff;
                entry.data = Bytes::from(data);
                true
            }
            _ => false,
        }
    }

    fn take_fault(&self, op: StoreOp, key: &str) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        let rule = faults
            .iter_mut()
            .find(|r| r.op == op && r.remaining > 0 && key.contains(&r.key_fragment))?;
        rule.remaining -= 1;
        let fault = rule.fault.clone();
        faults.retain(|r| r.remaining > 0);
        drop(faults);
        self.stats.lock().unwrap().faults_fired += 1;
        debug!(?op, key, ?fault, "memory store fault fired");
        Some(fault)
    }

    /// Apply a fault that fails the call or delays it. `ShortWrite` is
    /// returned for the caller to act on.
    async fn apply_fault(&self, op: StoreOp, key: &str) -> ArchiveResult<Option<Fault>> {
        match self.take_fault(op, key) {
            None => Ok(None),
            Some(Fault::Transient) => Err(ArchiveError::transient(
                format!("{:?} {}", op, key),
                "injected transient fault",
            )),
            Some(Fault::Permanent) => Err(ArchiveError::permanent(
                format!("{:?} {}", op, key),
                "injected permanent fault",
            )),
            Some(Fault::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(None)
            }
            Some(f @ Fault::ShortWrite) => Ok(Some(f)),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &ArtifactKey, body: ObjectBody, meta: &PutMeta) -> ArchiveResult<()> {
        let key = key.as_str();
        *self
            .put_attempts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert(0) += 1;
        self.stats.lock().unwrap().put_attempts += 1;

        let fault = self.apply_fault(StoreOp::Put, key).await?;
        let mut data = match body {
            ObjectBody::Bytes(b) => b,
            file @ ObjectBody::File { .. } => tokio::task::spawn_blocking(move || file.into_bytes())
                .await
                .map_err(|e| ArchiveError::permanent("memory put", e))??,
        };
        if fault == Some(Fault::ShortWrite) {
            data.truncate(data.len() / 2);
        }

        let len = data.len() as u64;
        let mut stats = self.stats.lock().unwrap();
        let mut objects = self.objects.lock().unwrap();
        if let Some(old) = objects.insert(
            key.to_string(),
            Entry {
                data,
                checksum: Some(meta.checksum.clone()),
            },
        ) {
            stats.bytes_stored -= old.data.len() as u64;
        }
        stats.puts += 1;
        stats.bytes_stored += len;
        debug!(key, len, "memory put");
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> ArchiveResult<Option<StoredObject>> {
        self.stats.lock().unwrap().gets += 1;
        self.apply_fault(StoreOp::Get, key.as_str()).await?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key.as_str())
            .map(|e| StoredObject {
                data: e.data.clone(),
                checksum: e.checksum.clone(),
            }))
    }

    async fn head(&self, key: &ArtifactKey) -> ArchiveResult<Option<ObjectMeta>> {
        self.stats.lock().unwrap().heads += 1;
        self.apply_fault(StoreOp::Head, key.as_str()).await?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key.as_str())
            .map(|e| ObjectMeta {
                size: e.data.len() as u64,
                checksum: e.checksum.clone(),
            }))
    }

    async fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectSummary>> {
        self.stats.lock().unwrap().lists += 1;
        self.apply_fault(StoreOp::List, prefix).await?;
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| ObjectSummary {
                key: k.clone(),
                size: e.data.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &ArtifactKey) -> ArchiveResult<()> {
        self.stats.lock().unwrap().deletes += 1;
        self.apply_fault(StoreOp::Delete, key.as_str()).await?;
        let mut stats = self.stats.lock().unwrap();
        if let Some(old) = self.objects.lock().unwrap().remove(key.as_str()) {
            stats.bytes_stored -= old.data.len() as u64;
        }
        Ok(())
    }
}
