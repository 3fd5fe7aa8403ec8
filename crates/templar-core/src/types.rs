//! Primitive value types shared by templates, converters and the compiler.
//!
//! These are deliberately thin newtypes: the compiler treats them as opaque
//! inputs, and the converters in [`crate::registry`] are the only place raw
//! JSON is turned into them.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing primitive values from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// Amount above the total money supply.
    #[error("amount {sats} sat exceeds the maximum of {max} sat")]
    AmountTooLarge {
        /// Offending amount.
        sats: u64,
        /// Upper bound.
        max: u64,
    },

    /// Relative lock time with the disable flag set.
    #[error("sequence {0:#010x} has the relative lock-time disable flag set")]
    RelativeLockDisabled(u32),

    /// Public key is not a 33-byte compressed SEC1 encoding.
    #[error("invalid public key: {reason}")]
    InvalidPubKey {
        /// What was wrong with the key.
        reason: String,
    },

    /// Address text is empty, too long, or contains unexpected characters.
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress {
        /// Offending text.
        address: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// Outpoint text is not `<txid>:<vout>`.
    #[error("invalid outpoint: {reason}")]
    InvalidOutPoint {
        /// What was wrong with it.
        reason: String,
    },
}

// ============================================================================
// Amount
// ============================================================================

/// An amount of money, in satoshis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero satoshis.
    pub const ZERO: Self = Self(0);

    /// Total money supply; no single amount may exceed it.
    pub const MAX_MONEY: Self = Self(21_000_000 * 100_000_000);

    /// Smallest output a segwit v0 script-hash output may carry.
    pub const DUST: Self = Self(330);

    /// Creates an amount from satoshis, rejecting values above
    /// [`Amount::MAX_MONEY`].
    pub const fn from_sat(sats: u64) -> Result<Self, ValueError> {
        if sats > Self::MAX_MONEY.0 {
            return Err(ValueError::AmountTooLarge {
                sats,
                max: Self::MAX_MONEY.0,
            });
        }
        Ok(Self(sats))
    }

    /// Returns the amount in satoshis.
    #[must_use]
    pub const fn as_sat(self) -> u64 {
        self.0
    }

    /// Checked addition that also enforces the money supply bound.
    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0
            .checked_add(other.0)
            .and_then(|sum| Self::from_sat(sum).ok())
    }

    /// Checked multiplication that also enforces the money supply bound.
    #[must_use]
    pub fn checked_mul(self, factor: u64) -> Option<Self> {
        self.0
            .checked_mul(factor)
            .and_then(|product| Self::from_sat(product).ok())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

// ============================================================================
// Sequence / relative time
// ============================================================================

/// Raw nSequence value of a transaction input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u32);

impl Sequence {
    /// nSequence of an input with no relative lock.
    pub const FINAL: Self = Self(u32::MAX);

    const DISABLE_FLAG: u32 = 1 << 31;
    const TYPE_FLAG: u32 = 1 << 22;
}

/// A BIP-68 relative lock time, either in blocks or 512-second units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct RelativeTimeSpec(Sequence);

impl RelativeTimeSpec {
    /// Builds a relative lock from a raw sequence, rejecting sequences that
    /// have relative locking disabled.
    pub const fn from_sequence(sequence: Sequence) -> Result<Self, ValueError> {
        if sequence.0 & Sequence::DISABLE_FLAG != 0 {
            return Err(ValueError::RelativeLockDisabled(sequence.0));
        }
        Ok(Self(sequence))
    }

    /// The nSequence an input must carry to satisfy this lock.
    #[must_use]
    pub const fn sequence(self) -> Sequence {
        self.0
    }

    /// Whether the lock is measured in time rather than blocks.
    #[must_use]
    pub const fn is_time_based(self) -> bool {
        self.0.0 & Sequence::TYPE_FLAG != 0
    }
}

impl TryFrom<u32> for RelativeTimeSpec {
    type Error = ValueError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_sequence(Sequence(value))
    }
}

impl From<RelativeTimeSpec> for u32 {
    fn from(value: RelativeTimeSpec) -> Self {
        value.0.0
    }
}

// ============================================================================
// PubKey
// ============================================================================

/// A compressed SEC1 public key (33 bytes, `02`/`03` prefix).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PubKey([u8; 33]);

impl PubKey {
    /// Length of a compressed key in bytes.
    pub const LEN: usize = 33;

    /// Parses a compressed key from its byte encoding.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ValueError> {
        let key: [u8; Self::LEN] = bytes.try_into().map_err(|_| ValueError::InvalidPubKey {
            reason: format!("expected {} bytes, got {}", Self::LEN, bytes.len()),
        })?;
        if !matches!(key[0], 0x02 | 0x03) {
            return Err(ValueError::InvalidPubKey {
                reason: format!("unexpected prefix byte {:#04x}", key[0]),
            });
        }
        Ok(Self(key))
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl FromStr for PubKey {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ValueError::InvalidPubKey {
            reason: e.to_string(),
        })?;
        Self::from_slice(&bytes)
    }
}

impl TryFrom<String> for PubKey {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PubKey> for String {
    fn from(value: PubKey) -> Self {
        hex::encode(value.0)
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({self})")
    }
}

// ============================================================================
// Address
// ============================================================================

/// A deployment address. Compiled contracts carry bech32 addresses; addresses
/// supplied by clients are only checked for shape.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Longest address text accepted from a client.
    pub const MAX_LEN: usize = 90;

    /// Validates the shape of an address: non-empty, bounded, ASCII
    /// alphanumeric. Addresses double as file names in the durable store, so
    /// nothing else is admitted.
    pub fn parse(text: impl Into<String>) -> Result<Self, ValueError> {
        let text = text.into();
        let reason = if text.is_empty() {
            Some("empty")
        } else if text.len() > Self::MAX_LEN {
            Some("too long")
        } else if !text.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Some("must be ASCII alphanumeric")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ValueError::InvalidAddress {
                address: text,
                reason,
            }),
            None => Ok(Self(text)),
        }
    }

    /// Returns the address text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = ValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl Borrow<str> for Address {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Network
// ============================================================================

/// Which chain addresses are encoded for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    /// Main network.
    Bitcoin,
    /// Public test network.
    Testnet,
    /// Signet.
    Signet,
    /// Local regression-test network.
    #[default]
    Regtest,
}

impl Network {
    /// Human-readable part of bech32 addresses on this network.
    #[must_use]
    pub const fn hrp(self) -> &'static str {
        match self {
            Self::Bitcoin => "bc",
            Self::Testnet | Self::Signet => "tb",
            Self::Regtest => "bcrt",
        }
    }
}

// ============================================================================
// OutPoint
// ============================================================================

/// Reference to a transaction output: `<txid>:<vout>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "OutPointRepr")]
pub struct OutPoint {
    /// Hex-encoded transaction id (64 characters).
    pub txid: String,
    /// Output index.
    pub vout: u32,
}

/// Accepted wire shapes for an outpoint.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OutPointRepr {
    /// `"<txid>:<vout>"`.
    Text(String),
    /// `{"txid": ..., "vout": ...}`.
    Object {
        /// Hex transaction id.
        txid: String,
        /// Output index.
        vout: u32,
    },
}

impl OutPoint {
    /// Creates an outpoint after checking the txid is 32 bytes of hex.
    pub fn new(txid: impl Into<String>, vout: u32) -> Result<Self, ValueError> {
        let txid = txid.into().to_ascii_lowercase();
        if txid.len() != 64 || !txid.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ValueError::InvalidOutPoint {
                reason: format!("txid must be 64 hex characters, got '{txid}'"),
            });
        }
        Ok(Self { txid, vout })
    }

    /// The coinbase-style null outpoint used as the input of mock funding
    /// transactions.
    #[must_use]
    pub fn null() -> Self {
        Self {
            txid: "0".repeat(64),
            vout: u32::MAX,
        }
    }
}

impl TryFrom<OutPointRepr> for OutPoint {
    type Error = ValueError;

    fn try_from(value: OutPointRepr) -> Result<Self, Self::Error> {
        match value {
            OutPointRepr::Text(text) => text.parse(),
            OutPointRepr::Object { txid, vout } => Self::new(txid, vout),
        }
    }
}

impl FromStr for OutPoint {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s.split_once(':').ok_or_else(|| ValueError::InvalidOutPoint {
            reason: format!("expected '<txid>:<vout>', got '{s}'"),
        })?;
        let vout = vout.parse().map_err(|_| ValueError::InvalidOutPoint {
            reason: format!("invalid output index '{vout}'"),
        })?;
        Self::new(txid, vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    #[test]
    fn test_amount_rejects_more_than_money_supply() {
        assert!(Amount::from_sat(Amount::MAX_MONEY.as_sat()).is_ok());
        assert!(matches!(
            Amount::from_sat(Amount::MAX_MONEY.as_sat() + 1),
            Err(ValueError::AmountTooLarge { .. })
        ));
        assert_eq!(Amount::MAX_MONEY.checked_add(Amount::DUST), None);
        assert_eq!(Amount::DUST.checked_mul(2).map(Amount::as_sat), Some(660));
    }

    #[test]
    fn test_relative_time_rejects_disable_flag() {
        assert!(RelativeTimeSpec::from_sequence(Sequence(144)).is_ok());
        assert!(RelativeTimeSpec::from_sequence(Sequence(1 << 31)).is_err());
        let timed = RelativeTimeSpec::from_sequence(Sequence((1 << 22) | 10)).unwrap();
        assert!(timed.is_time_based());
    }

    #[test]
    fn test_pubkey_hex_round_trip() {
        let key: PubKey = KEY.parse().unwrap();
        assert_eq!(key.to_string(), KEY);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{KEY}\""));
    }

    #[test]
    fn test_pubkey_rejects_uncompressed_prefix_and_bad_length() {
        let bad_prefix = format!("04{}", &KEY[2..]);
        assert!(bad_prefix.parse::<PubKey>().is_err());
        assert!("02ab".parse::<PubKey>().is_err());
        assert!("zz".parse::<PubKey>().is_err());
    }

    #[test]
    fn test_address_shape_checks() {
        assert!(Address::parse("bcrt1qxyz").is_ok());
        assert!(Address::parse("").is_err());
        assert!(Address::parse("../etc/passwd").is_err());
        assert!(Address::parse("a".repeat(Address::MAX_LEN + 1)).is_err());
    }

    #[test]
    fn test_outpoint_accepts_text_and_object_forms() {
        let txid = "ab".repeat(32);
        let from_text: OutPoint = serde_json::from_value(serde_json::json!(format!("{txid}:1"))).unwrap();
        let from_object: OutPoint =
            serde_json::from_value(serde_json::json!({"txid": txid, "vout": 1})).unwrap();
        assert_eq!(from_text, from_object);
        assert!("nope".parse::<OutPoint>().is_err());
        assert!(format!("{txid}:x").parse::<OutPoint>().is_err());
    }

    #[test]
    fn test_network_hrps() {
        assert_eq!(Network::Bitcoin.hrp(), "bc");
        assert_eq!(Network::Signet.hrp(), "tb");
        assert_eq!(Network::default().hrp(), "bcrt");
    }
}
