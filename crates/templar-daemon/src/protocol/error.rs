//! Protocol error types for the websocket front end.
//!
//! Every failure a client can cause maps to a [`ProtocolError`] with a stable
//! wire [`ErrorCode`]. Errors are split in two classes:
//!
//! - **Protocol violations** ([`ProtocolError::is_protocol_violation`]): the
//!   client sent something the protocol does not allow. The server answers
//!   with an error frame and closes the connection.
//! - **Request failures**: the request was well-formed but could not be
//!   carried out (compiler rejection, unknown contract, store failure). The
//!   server answers with an error frame and keeps the connection open.

use serde::Serialize;
use templar_core::compiler::CompileError;
use templar_core::registry::ConvertError;
use templar_core::template::TemplateError;
use thiserror::Error;

use crate::store::StoreError;

/// Stable error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame is not a `{type, content}` JSON object.
    MalformedEnvelope,
    /// Message `type` is not part of the protocol.
    UnknownKind,
    /// Message content has the wrong shape for its kind.
    InvalidContent,
    /// `create` named a template that is not in the catalog.
    UnknownTemplate,
    /// `create` arguments do not match the template's fields.
    ArgumentMismatch,
    /// An argument failed conversion.
    ConversionFailed,
    /// The template constructor or the compiler rejected the request.
    CompileFailed,
    /// The address names no contract in this session.
    UnknownContract,
    /// The durable store failed.
    StoreFailed,
    /// The frame is larger than the configured limit.
    FrameTooLarge,
    /// The frame is not a text frame.
    UnsupportedFrame,
    /// The server failed to produce a reply.
    Internal,
}

impl ErrorCode {
    /// Wire spelling of the code, also used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedEnvelope => "malformed_envelope",
            Self::UnknownKind => "unknown_kind",
            Self::InvalidContent => "invalid_content",
            Self::UnknownTemplate => "unknown_template",
            Self::ArgumentMismatch => "argument_mismatch",
            Self::ConversionFailed => "conversion_failed",
            Self::CompileFailed => "compile_failed",
            Self::UnknownContract => "unknown_contract",
            Self::StoreFailed => "store_failed",
            Self::FrameTooLarge => "frame_too_large",
            Self::UnsupportedFrame => "unsupported_frame",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON or lacks a string `type`.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Parser message.
        reason: String,
    },

    /// Message kind is not part of the protocol.
    #[error("unknown message type '{kind}'")]
    UnknownKind {
        /// Kind the client sent.
        kind: String,
    },

    /// Content does not have the shape its kind requires.
    #[error("invalid {kind} content: {reason}")]
    InvalidContent {
        /// Message kind.
        kind: &'static str,
        /// Parser message.
        reason: String,
    },

    /// Template is not registered.
    #[error("unknown template '{template}'")]
    UnknownTemplate {
        /// Name the client sent.
        template: String,
    },

    /// Argument names differ from the template's fields.
    #[error("arguments for '{template}' do not match its fields (missing: {missing:?}, unexpected: {unexpected:?})")]
    ArgumentMismatch {
        /// Template name.
        template: String,
        /// Fields with no argument.
        missing: Vec<String>,
        /// Arguments that are not fields.
        unexpected: Vec<String>,
    },

    /// An argument failed conversion.
    #[error("argument '{field}' of '{template}': {source}")]
    ConversionFailed {
        /// Template name.
        template: String,
        /// Field name.
        field: String,
        /// Converter error.
        #[source]
        source: ConvertError,
    },

    /// The template constructor rejected the converted arguments.
    #[error("template '{template}' rejected its arguments: {source}")]
    Construction {
        /// Template name.
        template: String,
        /// Constructor error.
        #[source]
        source: TemplateError,
    },

    /// The compiler failed.
    #[error("compiling '{template}' failed: {source}")]
    Compilation {
        /// Template name, or the bound contract's template.
        template: String,
        /// Compiler error.
        #[source]
        source: CompileError,
    },

    /// No contract at the address in this session.
    #[error("no contract at {address} in this session")]
    UnknownContract {
        /// Address the client sent.
        address: String,
    },

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Frame exceeds the configured size limit.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Frame size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// Binary frames are not part of the protocol.
    #[error("only text frames are accepted")]
    UnsupportedFrame,

    /// A reply could not be serialized.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Encoder message.
        reason: String,
    },
}

impl ProtocolError {
    /// Create an invalid content error.
    #[must_use]
    pub fn invalid_content(kind: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidContent {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Create a compilation error.
    #[must_use]
    pub fn compilation(template: impl Into<String>, source: CompileError) -> Self {
        Self::Compilation {
            template: template.into(),
            source,
        }
    }

    /// Wire code of the error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedEnvelope { .. } => ErrorCode::MalformedEnvelope,
            Self::UnknownKind { .. } => ErrorCode::UnknownKind,
            Self::InvalidContent { .. } => ErrorCode::InvalidContent,
            Self::UnknownTemplate { .. } => ErrorCode::UnknownTemplate,
            Self::ArgumentMismatch { .. } => ErrorCode::ArgumentMismatch,
            Self::ConversionFailed { .. } => ErrorCode::ConversionFailed,
            Self::Construction { .. } | Self::Compilation { .. } => ErrorCode::CompileFailed,
            Self::UnknownContract { .. } => ErrorCode::UnknownContract,
            Self::Store(_) => ErrorCode::StoreFailed,
            Self::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Self::UnsupportedFrame => ErrorCode::UnsupportedFrame,
            Self::Serialization { .. } => ErrorCode::Internal,
        }
    }

    /// Whether the error is a protocol violation that terminates the
    /// connection.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope { .. }
                | Self::UnknownKind { .. }
                | Self::InvalidContent { .. }
                | Self::UnknownTemplate { .. }
                | Self::ArgumentMismatch { .. }
                | Self::ConversionFailed { .. }
                | Self::FrameTooLarge { .. }
                | Self::UnsupportedFrame
        )
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
