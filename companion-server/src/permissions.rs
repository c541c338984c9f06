//! Persisted per-client permission grants.
//!
//! Grants survive restarts in a JSON file mapping client ids to permission
//! lists. Every mutation is written through: the new contents go to a
//! sibling temp file which is then renamed over the target.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use companion_proto::message::ClientId;
use companion_proto::permission::{Permission, PermissionSet};
use parking_lot::RwLock;

/// Errors from loading or saving the grant file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading, writing or renaming the file failed.
    #[error("permission store I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file does not hold a valid grant map.
    #[error("permission store at {path} is corrupt: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
}

type Grants = BTreeMap<ClientId, PermissionSet>;

/// Per-client grants, optionally backed by a JSON file.
pub struct PermissionStore {
    path: Option<PathBuf>,
    grants: RwLock<Grants>,
}

impl PermissionStore {
    /// Creates a store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            grants: RwLock::new(Grants::new()),
        }
    }

    /// Opens the store at `path`. A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let grants = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| StoreError::Json {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Grants::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        tracing::debug!(path = %path.display(), clients = grants.len(), "permission store loaded");
        Ok(Self {
            path: Some(path),
            grants: RwLock::new(grants),
        })
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the persisted grants of a client.
    #[must_use]
    pub fn get(&self, client_id: &ClientId) -> Option<PermissionSet> {
        self.grants.read().get(client_id).cloned()
    }

    /// Returns the client's persisted grants, allocating `defaults` for a
    /// client seen for the first time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a new allocation cannot be persisted.
    pub fn get_or_allocate(
        &self,
        client_id: &ClientId,
        defaults: &PermissionSet,
    ) -> Result<PermissionSet, StoreError> {
        let mut grants = self.grants.write();
        if let Some(existing) = grants.get(client_id) {
            return Ok(existing.clone());
        }
        grants.insert(client_id.clone(), defaults.clone());
        if let Err(e) = self.persist(&grants) {
            grants.remove(client_id);
            return Err(e);
        }
        drop(grants);
        tracing::info!(client_id = %client_id, "allocated default permissions for new client");
        Ok(defaults.clone())
    }

    /// Adds permissions to a client's grants and returns the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be persisted.
    pub fn grant(
        &self,
        client_id: &ClientId,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Result<PermissionSet, StoreError> {
        self.update(client_id, |set| set.extend(permissions))
    }

    /// Removes permissions from a client's grants and returns the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be persisted.
    pub fn revoke(
        &self,
        client_id: &ClientId,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Result<PermissionSet, StoreError> {
        self.update(client_id, |set| {
            for p in permissions {
                set.revoke(p);
            }
        })
    }

    /// Replaces a client's grants.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the change cannot be persisted.
    pub fn set(&self, client_id: &ClientId, permissions: PermissionSet) -> Result<(), StoreError> {
        self.update(client_id, |set| *set = permissions).map(drop)
    }

    fn update(
        &self,
        client_id: &ClientId,
        change: impl FnOnce(&mut PermissionSet),
    ) -> Result<PermissionSet, StoreError> {
        let mut grants = self.grants.write();
        let before = grants.get(client_id).cloned();
        let set = grants.entry(client_id.clone()).or_default();
        change(set);
        let result = set.clone();
        if let Err(e) = self.persist(&grants) {
            match before {
                Some(prev) => grants.insert(client_id.clone(), prev),
                None => grants.remove(client_id),
            };
            return Err(e);
        }
        Ok(result)
    }

    fn persist(&self, grants: &Grants) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let contents = serde_json::to_string_pretty(grants).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}
