//! Durable blob storage
//!
//! A thin wrapper over a sled database. Every value is zstd-compressed on the
//! way in and decompressed on the way out; callers choose the encoding of the
//! payload (JSON, bincode) themselves.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::core::errors::{MaestroError, Result};

const COMPRESSION_LEVEL: i32 = 3;

/// sled-backed store of compressed blobs grouped in named trees
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Opens (or creates) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| MaestroError::database(format!("open {}", path.display()), e))?;
        debug!("Opened sled store at {}", path.display());
        Ok(Self { db })
    }

    /// Opens a database that is deleted when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn put(&self, tree: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let compressed = zstd::encode_all(bytes, COMPRESSION_LEVEL)
            .map_err(|e| MaestroError::io(format!("compress {}/{}", tree, key), e))?;
        self.db.open_tree(tree)?.insert(key.as_bytes(), compressed)?;
        Ok(())
    }

    pub fn get(&self, tree: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match self.db.open_tree(tree)?.get(key.as_bytes())? {
            Some(compressed) => {
                let bytes = zstd::decode_all(&compressed[..])
                    .map_err(|e| MaestroError::io(format!("decompress {}/{}", tree, key), e))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(value)?;
        self.put(tree, key, &serialized)
    }

    pub fn get_json<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        match self.get(tree, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, tree: &str, key: &str) -> Result<bool> {
        Ok(self.db.open_tree(tree)?.remove(key.as_bytes())?.is_some())
    }

    /// Lists the keys of a tree in byte order
    pub fn keys(&self, tree: &str) -> Result<Vec<String>> {
        self.db
            .open_tree(tree)?
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish_non_exhaustive()
    }
}
