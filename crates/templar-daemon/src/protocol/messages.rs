//! Wire messages.
//!
//! Every frame in either direction is a JSON object `{"type": ..., "content": ...}`.
//! Inbound frames are parsed in two steps: the [`Envelope`] first, then the
//! content according to the [`MessageKind`]. Outbound frames are
//! [`ServerMessage`] values, except the menu, which the catalog serializes
//! once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use templar_core::contract::{CompiledContract, Transaction};
use templar_core::types::Address;

use super::error::{ErrorCode, ProtocolError, ProtocolResult};

/// Outer shape of every client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload; `null` when absent.
    #[serde(default)]
    pub content: Value,
}

impl Envelope {
    /// Parses a frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedEnvelope`] if the frame is not a JSON
    /// object with a string `type`.
    pub fn parse(frame: &str) -> ProtocolResult<Self> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedEnvelope {
            reason: e.to_string(),
        })
    }
}

/// Client message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Compile a template instance.
    Create,
    /// End the session.
    Close,
    /// Persist a cached contract.
    Save,
    /// List the session's saved contracts.
    Export,
    /// Sign the session cache.
    ExportAuth,
    /// Merge a signed export into the session cache.
    LoadAuth,
    /// Produce the transactions of a cached contract.
    Bind,
}

impl MessageKind {
    /// Every kind, in protocol order.
    pub const ALL: [Self; 7] = [
        Self::Create,
        Self::Close,
        Self::Save,
        Self::Export,
        Self::ExportAuth,
        Self::LoadAuth,
        Self::Bind,
    ];

    /// Looks up a kind by its wire name.
    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Close => "close",
            Self::Save => "save",
            Self::Export => "export",
            Self::ExportAuth => "export_auth",
            Self::LoadAuth => "load_auth",
            Self::Bind => "bind",
        }
    }
}

/// Content of a `create` message.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    /// Template name.
    #[serde(rename = "type")]
    pub template: String,
    /// Raw arguments keyed by field name.
    pub args: Map<String, Value>,
}

/// Content of a `bind` message: `[outpoint | null, address]`.
#[derive(Debug, Clone, Deserialize)]
pub struct BindRequest(
    /// Funding outpoint; a mock funding transaction is made when `null`.
    pub Option<templar_core::types::OutPoint>,
    /// Address of a contract in the session cache.
    pub String,
);

/// Contracts of one session, keyed by address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExport {
    /// Session the contracts were exported from.
    pub session_id: String,
    /// Contracts by address.
    pub contracts: BTreeMap<Address, Arc<CompiledContract>>,
}

/// A [`SessionExport`] with an HMAC over its canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedExport {
    /// Exported contracts.
    pub payload: SessionExport,
    /// Hex HMAC-SHA256 tag.
    pub signature: String,
}

/// Content of an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl From<&ProtocolError> for ErrorBody {
    fn from(err: &ProtocolError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Frames sent by the server after the menu.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ServerMessage {
    /// `[durable, id]`, sent right after the menu.
    SessionId(bool, String),
    /// `[funding amount, address]` of a compiled contract.
    Created(u64, Address),
    /// Whether a contract was persisted.
    Saved(bool),
    /// Saved contracts of the session.
    Exported(SessionExport),
    /// Signed snapshot of the session cache.
    ExportedAuth(SignedExport),
    /// Whether a signed export was accepted and merged.
    LoadedAuth(bool),
    /// Transactions of a bound contract.
    Bound(Vec<Transaction>),
    /// Request failure or protocol violation.
    Error(ErrorBody),
}

impl ServerMessage {
    /// Serializes the message as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if encoding fails.
    pub fn to_frame(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Error frame for `err`. Falls back to a fixed internal error frame if
    /// the message cannot be encoded.
    #[must_use]
    pub fn error_frame(err: &ProtocolError) -> String {
        Self::Error(ErrorBody::from(err))
            .to_frame()
            .unwrap_or_else(|_| {
                r#"{"type":"error","content":{"code":"internal","message":"failed to encode error"}}"#
                    .to_string()
            })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_content_defaults_to_null() {
        let envelope = Envelope::parse(r#"{"type":"close"}"#).unwrap();
        assert_eq!(envelope.kind, "close");
        assert_eq!(envelope.content, Value::Null);

        for bad in ["", "[]", "{}", r#"{"type":5}"#, "{\"type\":"] {
            assert!(
                matches!(
                    Envelope::parse(bad),
                    Err(ProtocolError::MalformedEnvelope { .. })
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("frobnicate"), None);
        assert_eq!(MessageKind::parse("menu"), None);
    }

    #[test]
    fn test_server_frames_are_type_content_objects() {
        let address = Address::parse("bcrt1qabc").unwrap();
        let created = ServerMessage::Created(330, address).to_frame().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&created).unwrap(),
            json!({"type": "created", "content": [330, "bcrt1qabc"]})
        );

        let session = ServerMessage::SessionId(false, "abc".into()).to_frame().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&session).unwrap(),
            json!({"type": "session_id", "content": [false, "abc"]})
        );

        let frame = ServerMessage::error_frame(&ProtocolError::UnknownKind {
            kind: "x".into(),
        });
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["content"]["code"], "unknown_kind");
    }

    #[test]
    fn test_bind_request_accepts_null_or_outpoint() {
        let unfunded: BindRequest = serde_json::from_value(json!([null, "bcrt1qabc"])).unwrap();
        assert!(unfunded.0.is_none());

        let txid = "ab".repeat(32);
        let funded: BindRequest =
            serde_json::from_value(json!([format!("{txid}:0"), "bcrt1qabc"])).unwrap();
        assert_eq!(funded.0.unwrap().vout, 0);

        assert!(serde_json::from_value::<BindRequest>(json!(["bcrt1qabc"])).is_err());
    }
}
