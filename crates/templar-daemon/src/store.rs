//! Durable contract storage for `save` and `export`.
//!
//! [`FileContractStore`] lays contracts out as one directory per session and
//! one JSON file per address:
//!
//! ```text
//! <root>/<session-uuid>/<address>.json
//! ```
//!
//! Files are written to a temporary file in the same directory, synced and
//! renamed into place, so a reader never observes a partial contract.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use templar_core::contract::CompiledContract;
use templar_core::types::Address;
use thiserror::Error;

use crate::protocol::session::SessionId;

/// Contracts of one session, by address.
pub type SessionContracts = BTreeMap<Address, Arc<CompiledContract>>;

/// Errors raised by a [`ContractStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A stored contract could not be encoded or decoded.
    #[error("stored contract at {path} is unreadable: {reason}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The in-memory store's lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable storage of compiled contracts, partitioned by session.
pub trait ContractStore: Send + Sync {
    /// Persists `contract` for `session`, replacing any contract saved at the
    /// same address.
    ///
    /// # Errors
    ///
    /// Returns an error if the contract cannot be written.
    fn save(&self, session: &SessionId, contract: &CompiledContract) -> Result<(), StoreError>;

    /// Every contract saved for `session`; empty if none were.
    ///
    /// # Errors
    ///
    /// Returns an error if the session's contracts cannot be read.
    fn load_session(&self, session: &SessionId) -> Result<SessionContracts, StoreError>;
}

// ============================================================================
// File store
// ============================================================================

/// Contract store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FileContractStore {
    root: PathBuf,
}

impl FileContractStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.to_string())
    }
}

impl ContractStore for FileContractStore {
    fn save(&self, session: &SessionId, contract: &CompiledContract) -> Result<(), StoreError> {
        let dir = self.session_dir(session);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let final_path = dir.join(format!("{}.json", contract.address));

        let bytes = serde_json::to_vec(contract).map_err(|e| StoreError::Corrupt {
            path: final_path.clone(),
            reason: e.to_string(),
        })?;

        let mut named_temp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
        named_temp
            .as_file_mut()
            .write_all(&bytes)
            .map_err(|e| StoreError::io(named_temp.path(), e))?;
        named_temp
            .as_file()
            .sync_all()
            .map_err(|e| StoreError::io(named_temp.path(), e))?;
        named_temp
            .persist(&final_path)
            .map_err(|e| StoreError::io(&final_path, e.error))?;

        tracing::debug!(
            session_id = %session,
            address = %contract.address,
            "contract saved"
        );
        Ok(())
    }

    fn load_session(&self, session: &SessionId) -> Result<SessionContracts, StoreError> {
        let dir = self.session_dir(session);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SessionContracts::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut contracts = SessionContracts::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            let contract: CompiledContract =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            let stem = path.file_stem().and_then(|s| s.to_str());
            if stem != Some(contract.address.as_str()) {
                return Err(StoreError::Corrupt {
                    path,
                    reason: format!("file holds the contract at {}", contract.address),
                });
            }
            contracts.insert(contract.address.clone(), Arc::new(contract));
        }
        Ok(contracts)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Contract store held in memory, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemoryContractStore {
    sessions: RwLock<HashMap<SessionId, SessionContracts>>,
}

impl InMemoryContractStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContractStore for InMemoryContractStore {
    fn save(&self, session: &SessionId, contract: &CompiledContract) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        sessions
            .entry(*session)
            .or_default()
            .insert(contract.address.clone(), Arc::new(contract.clone()));
        Ok(())
    }

    fn load_session(&self, session: &SessionId) -> Result<SessionContracts, StoreError> {
        let sessions = self.sessions.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(sessions.get(session).cloned().unwrap_or_default())
    }
}
