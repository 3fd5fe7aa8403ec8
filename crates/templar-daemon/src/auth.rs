//! Signed session exports.
//!
//! `export_auth` hands the client a snapshot of its compilation cache with an
//! HMAC-SHA256 tag; `load_auth` accepts such a snapshot back, in this or a
//! later session, only if the tag verifies under the server key.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::protocol::messages::{SessionExport, SignedExport};

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated key, in bytes.
pub const GENERATED_KEY_LEN: usize = 32;

/// Signs and verifies session exports.
#[derive(Clone)]
pub struct ExportSigner {
    key: Vec<u8>,
}

impl ExportSigner {
    /// Creates a signer with the given key.
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Creates a signer with a random key. Exports signed by it only verify
    /// within this process.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = vec![0u8; GENERATED_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    fn mac(&self, export: &SessionExport) -> Option<HmacSha256> {
        let encoded = serde_json::to_vec(export).ok()?;
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(&encoded);
        Some(mac)
    }

    /// Signs an export. Returns `None` if the export cannot be encoded.
    #[must_use]
    pub fn sign(&self, export: SessionExport) -> Option<SignedExport> {
        let tag = self.mac(&export)?.finalize().into_bytes();
        Some(SignedExport {
            payload: export,
            signature: hex::encode(tag),
        })
    }

    /// Whether the signature of `signed` verifies, compared in constant
    /// time.
    #[must_use]
    pub fn verify(&self, signed: &SignedExport) -> bool {
        let Ok(tag) = hex::decode(&signed.signature) else {
            return false;
        };
        self.mac(&signed.payload)
            .is_some_and(|mac| mac.verify_slice(&tag).is_ok())
    }
}

impl std::fmt::Debug for ExportSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use templar_core::contract::CompiledContract;
    use templar_core::types::{Address, Amount};

    use super::*;

    fn export() -> SessionExport {
        let address = Address::parse("bcrt1qa").unwrap();
        let mut contracts = BTreeMap::new();
        contracts.insert(
            address.clone(),
            Arc::new(CompiledContract::pay_to_address(Amount::DUST, address)),
        );
        SessionExport {
            session_id: "s".into(),
            contracts,
        }
    }

    #[test]
    fn test_signed_export_verifies() {
        let signer = ExportSigner::new(b"0123456789abcdef".to_vec());
        let signed = signer.sign(export()).unwrap();
        assert_eq!(signed.signature.len(), 64);
        assert!(signer.verify(&signed));

        let json = serde_json::to_string(&signed).unwrap();
        let back: SignedExport = serde_json::from_str(&json).unwrap();
        assert!(signer.verify(&back));
    }

    #[test]
    fn test_tampering_and_foreign_keys_fail() {
        let signer = ExportSigner::generate();
        let mut signed = signer.sign(export()).unwrap();
        assert!(!ExportSigner::generate().verify(&signed));

        signed.payload.session_id = "other".into();
        assert!(!signer.verify(&signed));

        let mut garbled = signer.sign(export()).unwrap();
        garbled.signature = "not hex".into();
        assert!(!signer.verify(&garbled));
    }
}
