//! Key-value persistence for snapshot payloads.
//!
//! The engine only needs `get`, `put` and `delete`. Hosts plug in their own
//! store; two implementations ship with the crate: an in-memory map for
//! tests and a directory-backed store with atomic writes.

use crate::core::{Result, TxError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Persistence capability injected by the host.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Map-backed store, mostly for tests.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

const FILE_EXTENSION: &str = "kv";

/// Directory-backed store. One file per key; writes go to a temporary file
/// that is atomically renamed over the target.
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|err| TxError::IoError(format!("create store dir: {}", err)))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", encode_key(key), FILE_EXTENSION))
    }

    /// Keys stored under the root that start with `prefix`, sorted.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|err| TxError::IoError(err.to_string()))?;
        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| TxError::IoError(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Some(key) = decode_key(stem) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(TxError::IoError(err.to_string())),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, value)
            .await
            .map_err(|err| TxError::IoError(err.to_string()))?;

        fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| TxError::IoError(err.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(TxError::IoError(err.to_string())),
        }
    }
}

/// Escapes every byte outside `[A-Za-z0-9_-]` as `%XX` so any key maps to a
/// portable file name.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = encoded.get(index + 1..index + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else {
            decoded.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_key_encoding_round_trips() {
        let key = "snapshot:txn_ab/12.x";
        let encoded = encode_key(key);
        assert!(!encoded.contains(':'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
    }

    #[tokio::test]
    async fn test_file_store_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = FileKeyValueStore::open(dir.path()).await.unwrap();

        store.put("snapshot:a", b"one".to_vec()).await.unwrap();
        store.put("snapshot:b", b"two".to_vec()).await.unwrap();
        store.put("other:c", b"three".to_vec()).await.unwrap();

        assert_eq!(store.get("snapshot:a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(
            store.keys("snapshot:").await.unwrap(),
            vec!["snapshot:a".to_string(), "snapshot:b".to_string()]
        );

        store.delete("snapshot:a").await.unwrap();
        store.delete("snapshot:a").await.unwrap();
        assert_eq!(store.get("snapshot:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_store_prefix_keys() {
        let store = InMemoryKeyValueStore::new();
        store.put("a:1", vec![1]).await.unwrap();
        store.put("b:1", vec![2]).await.unwrap();
        assert_eq!(store.keys("a:").await, vec!["a:1".to_string()]);
        assert_eq!(store.len().await, 2);
    }
}
