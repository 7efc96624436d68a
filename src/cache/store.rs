//! Durable cache tier: a storage-agnostic key/value contract plus two backends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

const BLOB_EXT: &str = ".blob";

#[derive(Debug, Clone, PartialEq)]
pub struct DurableRecord {
    pub payload: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, CacheError>;
    async fn put(&self, key: &str, record: DurableRecord) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Remove every key starting with `prefix`; returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// In-process store. Useful for tests and for hosts without a disk.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, DurableRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, CacheError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, record: DurableRecord) -> Result<(), CacheError> {
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.records.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let before = self.records.len();
        self.records.retain(|k, _| !k.starts_with(prefix));
        Ok(before.saturating_sub(self.records.len()))
    }
}

#[derive(Serialize, Deserialize)]
struct BlobHeader {
    key: String,
    expires_at: DateTime<Utc>,
}

/// One file per key under a directory: a JSON header line followed by the
/// raw payload bytes.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir).map_err(|e| CacheError::Write {
            key: dir.display().to_string(),
            message: format!("Failed to create cache directory: {}", e),
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", encode_key(key), BLOB_EXT))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<DurableRecord>, CacheError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::Read {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        };
        let split = bytes.iter().position(|b| *b == b'\n').ok_or_else(|| CacheError::Read {
            key: key.to_string(),
            message: "missing blob header".into(),
        })?;
        let header: BlobHeader = serde_json::from_slice(&bytes[..split])?;
        if header.key != key {
            return Err(CacheError::Read {
                key: key.to_string(),
                message: format!("blob belongs to '{}'", header.key),
            });
        }
        Ok(Some(DurableRecord {
            payload: bytes[split + 1..].to_vec(),
            expires_at: header.expires_at,
        }))
    }

    async fn put(&self, key: &str, record: DurableRecord) -> Result<(), CacheError> {
        let header = BlobHeader {
            key: key.to_string(),
            expires_at: record.expires_at,
        };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&record.payload);

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let write_err = |e: std::io::Error| CacheError::Write {
            key: key.to_string(),
            message: e.to_string(),
        };
        tokio::fs::write(&tmp, &bytes).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Write {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let encoded = encode_key(prefix);
        let list_err = |e: std::io::Error| CacheError::Write {
            key: prefix.to_string(),
            message: e.to_string(),
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(list_err)?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&encoded) && name.ends_with(BLOB_EXT) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(list_err(e)),
                }
            }
        }
        Ok(removed)
    }
}

/// Filename-safe and prefix-preserving: `encode(a + b) == encode(a) + encode(b)`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(payload: &str) -> DurableRecord {
        DurableRecord {
            payload: payload.as_bytes().to_vec(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_encode_key_is_prefix_preserving() {
        let whole = encode_key("discovery:p1:abc");
        assert!(whole.starts_with(&encode_key("discovery:p1:")));
        assert!(!encode_key("discovery:p10:abc").starts_with(&encode_key("discovery:p1:")));
        assert!(!whole.contains(':') && !whole.contains('/'));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();

        let rec = record("{\"multi\":\"line\ncontent\"}");
        store.put("discovery:10.1/abc:ff", rec.clone()).await.unwrap();
        assert_eq!(store.get("discovery:10.1/abc:ff").await.unwrap(), Some(rec));
        assert_eq!(store.get("discovery:missing:ff").await.unwrap(), None);

        store.delete("discovery:10.1/abc:ff").await.unwrap();
        assert_eq!(store.get("discovery:10.1/abc:ff").await.unwrap(), None);
        // Deleting again is fine.
        store.delete("discovery:10.1/abc:ff").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_delete_prefix() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        store.put("discovery:p1:a", record("1")).await.unwrap();
        store.put("discovery:p1:b", record("2")).await.unwrap();
        store.put("discovery:p10:a", record("3")).await.unwrap();

        assert_eq!(store.delete_prefix("discovery:p1:").await.unwrap(), 2);
        assert!(store.get("discovery:p1:a").await.unwrap().is_none());
        assert!(store.get("discovery:p10:a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        std::fs::write(store.path_for("k"), b"no header here").unwrap();
        assert!(store.get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_delete_prefix() {
        let store = MemoryStore::new();
        store.put("discovery:p1:a", record("1")).await.unwrap();
        store.put("discovery:p2:a", record("2")).await.unwrap();
        assert_eq!(store.delete_prefix("discovery:p1:").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
