//! Per-connection protocol session.
//!
//! A [`ProtocolSession`] is owned by exactly one connection task. It holds
//! the session's [`CompilationCache`], which is never shared with another
//! session and is dropped when the connection closes.
//!
//! # Lifecycle
//!
//! ```text
//! Opened --(menu + session_id sent)--> Active --(close / violation /
//!                                                idle / transport)--> Closed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use templar_core::contract::CompiledContract;
use templar_core::registry::{ConversionContext, ReferencePolicy};
use templar_core::types::Address;
use uuid::Uuid;

/// Unique identifier of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contracts compiled in one session, keyed by their address.
///
/// Every entry is stored under its own address, so `cache[a].address == a`
/// holds for every key.
#[derive(Debug, Default)]
pub struct CompilationCache {
    contracts: HashMap<Address, Arc<CompiledContract>>,
}

impl CompilationCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches a contract under its address, replacing any earlier contract
    /// at the same address. Returns the replaced contract.
    pub fn insert(&mut self, contract: Arc<CompiledContract>) -> Option<Arc<CompiledContract>> {
        self.contracts.insert(contract.address.clone(), contract)
    }

    /// Looks up a contract by address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&Arc<CompiledContract>> {
        self.contracts.get(address)
    }

    /// Number of cached contracts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Iterates the cached contracts in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Arc<CompiledContract>)> {
        self.contracts.iter()
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; the opening frames have not been sent yet.
    Opened,
    /// Serving client messages.
    Active,
    /// Terminated; the cache is about to be dropped.
    Closed,
}

/// State of one client connection.
#[derive(Debug)]
pub struct ProtocolSession {
    id: SessionId,
    cache: CompilationCache,
    reference_policy: ReferencePolicy,
    state: SessionState,
}

impl ProtocolSession {
    /// Opens a session with an empty cache and a fresh id.
    #[must_use]
    pub fn new(reference_policy: ReferencePolicy) -> Self {
        Self {
            id: SessionId::generate(),
            cache: CompilationCache::new(),
            reference_policy,
            state: SessionState::Opened,
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Marks the opening frames as sent.
    pub fn activate(&mut self) {
        if self.state == SessionState::Opened {
            self.state = SessionState::Active;
        }
    }

    /// Terminates the session and drops its cache.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.cache = CompilationCache::new();
    }

    /// Whether the session is terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// The compilation cache.
    #[must_use]
    pub const fn cache(&self) -> &CompilationCache {
        &self.cache
    }

    /// The compilation cache, mutably.
    pub fn cache_mut(&mut self) -> &mut CompilationCache {
        &mut self.cache
    }
}

impl ConversionContext for ProtocolSession {
    fn resolve_contract(&self, address: &str) -> Option<Arc<CompiledContract>> {
        self.cache.get(address).cloned()
    }

    fn reference_policy(&self) -> ReferencePolicy {
        self.reference_policy
    }
}

#[cfg(test)]
mod tests {
    use templar_core::types::Amount;

    use super::*;

    fn contract(address: &str) -> Arc<CompiledContract> {
        Arc::new(CompiledContract::pay_to_address(
            Amount::DUST,
            Address::parse(address).unwrap(),
        ))
    }

    #[test]
    fn test_cache_is_keyed_by_contract_address() {
        let mut cache = CompilationCache::new();
        assert!(cache.insert(contract("bcrt1qa")).is_none());
        assert!(cache.insert(contract("bcrt1qb")).is_none());
        assert!(cache.insert(contract("bcrt1qa")).is_some());
        assert_eq!(cache.len(), 2);
        for (address, contract) in cache.iter() {
            assert_eq!(&contract.address, address);
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = ProtocolSession::new(ReferencePolicy::Fallback);
        assert_eq!(session.state(), SessionState::Opened);
        session.activate();
        assert_eq!(session.state(), SessionState::Active);

        session.cache_mut().insert(contract("bcrt1qa"));
        assert!(session.resolve_contract("bcrt1qa").is_some());

        session.close();
        assert!(session.is_closed());
        assert!(session.cache().is_empty());
        session.activate();
        assert!(session.is_closed());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = ProtocolSession::new(ReferencePolicy::Fallback);
        let b = ProtocolSession::new(ReferencePolicy::Fallback);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string().len(), 36);
    }
}
