//! Message dispatcher.
//!
//! The [`Dispatcher`] handles one client frame at a time for one session:
//! parse the envelope, route by kind, validate, call the compiler, reply.
//! It holds only shared, read-only collaborators; all per-connection state
//! lives in the [`ProtocolSession`] the caller passes in.
//!
//! # `create`
//!
//! 1. Unknown template: error, close.
//! 2. Argument names must equal the template's fields exactly; otherwise
//!    error, close. The compiler is not called.
//! 3. Every field's converter runs; the first failure is an error and closes.
//! 4. The template constructor and the compiler run on the blocking pool.
//!    Their failures are answered with `compile_failed` and the connection
//!    stays open.
//! 5. The contract is cached under its address and `created` is sent.
//!
//! Nothing reaches the cache unless every step succeeds.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use templar_core::catalog::Catalog;
use templar_core::compiler::{CompileError, ContractCompiler};
use templar_core::contract::CompiledContract;
use templar_core::template::TemplateArgs;
use tracing::{debug, info, warn};

use super::error::{ProtocolError, ProtocolResult};
use super::messages::{
    BindRequest, CreateRequest, Envelope, MessageKind, ServerMessage, SessionExport, SignedExport,
};
use super::session::ProtocolSession;
use crate::auth::ExportSigner;
use crate::metrics::SharedMetricsRegistry;
use crate::store::{ContractStore, SessionContracts};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `close`.
    ClientClose,
    /// The client violated the protocol.
    ProtocolViolation,
    /// The client sent nothing for the idle timeout.
    IdleTimeout,
    /// The transport closed.
    TransportClosed,
    /// The transport failed.
    TransportError,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Metrics label for the reason.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClose => "client_close",
            Self::ProtocolViolation => "protocol_violation",
            Self::IdleTimeout => "idle_timeout",
            Self::TransportClosed => "transport_closed",
            Self::TransportError => "transport_error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// What the connection should do after a frame was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Send the frame and keep serving.
    Reply(String),
    /// Send the notice, if any, then close.
    Close {
        /// Why the session ends.
        reason: CloseReason,
        /// Final frame to send before closing.
        notice: Option<String>,
    },
}

/// Routes client frames to their handlers.
pub struct Dispatcher {
    catalog: Arc<Catalog>,
    compiler: Arc<dyn ContractCompiler>,
    store: Option<Arc<dyn ContractStore>>,
    signer: ExportSigner,
    metrics: Option<SharedMetricsRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher with no durable store and no metrics.
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        compiler: Arc<dyn ContractCompiler>,
        signer: ExportSigner,
    ) -> Self {
        Self {
            catalog,
            compiler,
            store: None,
            signer,
            metrics: None,
        }
    }

    /// Enables `save` and `export` against `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ContractStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Records message and compiler metrics into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The catalog served by this dispatcher.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Whether saves are persisted.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    /// The `session_id` frame announcing `session`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded.
    pub fn session_frame(&self, session: &ProtocolSession) -> ProtocolResult<String> {
        ServerMessage::SessionId(self.is_durable(), session.id().to_string()).to_frame()
    }

    /// Handles one client frame.
    pub async fn dispatch(&self, session: &mut ProtocolSession, frame: &str) -> DispatchOutcome {
        if session.is_closed() {
            return DispatchOutcome::Close {
                reason: CloseReason::ProtocolViolation,
                notice: None,
            };
        }

        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(err) => return self.fail(session, "unknown", &err),
        };
        let Some(kind) = MessageKind::parse(&envelope.kind) else {
            let err = ProtocolError::UnknownKind {
                kind: envelope.kind,
            };
            return self.fail(session, "unknown", &err);
        };

        let reply = match kind {
            MessageKind::Close => {
                self.record(kind.as_str(), "ok");
                debug!(session_id = %session.id(), "client closed session");
                return DispatchOutcome::Close {
                    reason: CloseReason::ClientClose,
                    notice: None,
                };
            },
            MessageKind::Create => self.handle_create(session, envelope.content).await,
            MessageKind::Save => self.handle_save(session, envelope.content).await,
            MessageKind::Export => self.handle_export(session).await,
            MessageKind::ExportAuth => self.handle_export_auth(session),
            MessageKind::LoadAuth => Ok(self.handle_load_auth(session, envelope.content)),
            MessageKind::Bind => self.handle_bind(session, envelope.content).await,
        };

        match reply.and_then(|message| message.to_frame()) {
            Ok(frame) => {
                self.record(kind.as_str(), "ok");
                DispatchOutcome::Reply(frame)
            },
            Err(err) => self.fail(session, kind.as_str(), &err),
        }
    }

    /// Turns an error into the matching outcome: violations close the
    /// session, request failures keep it open.
    pub fn fail(
        &self,
        session: &ProtocolSession,
        kind: &str,
        err: &ProtocolError,
    ) -> DispatchOutcome {
        self.record(kind, err.code().as_str());
        let notice = ServerMessage::error_frame(err);
        if err.is_protocol_violation() {
            warn!(session_id = %session.id(), error = %err, "protocol violation");
            DispatchOutcome::Close {
                reason: CloseReason::ProtocolViolation,
                notice: Some(notice),
            }
        } else {
            info!(session_id = %session.id(), error = %err, "request failed");
            DispatchOutcome::Reply(notice)
        }
    }

    fn record(&self, kind: &str, status: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.daemon_metrics().message_handled(kind, status);
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    async fn handle_create(
        &self,
        session: &mut ProtocolSession,
        content: Value,
    ) -> ProtocolResult<ServerMessage> {
        let request: CreateRequest = serde_json::from_value(content)
            .map_err(|e| ProtocolError::invalid_content("create", e))?;
        let entry =
            self.catalog
                .get(&request.template)
                .ok_or_else(|| ProtocolError::UnknownTemplate {
                    template: request.template.clone(),
                })?;

        let missing: Vec<String> = entry
            .schema()
            .keys()
            .filter(|field| !request.args.contains_key(*field))
            .map(str::to_string)
            .collect();
        let unexpected: Vec<String> = request
            .args
            .keys()
            .filter(|arg| !entry.schema().contains(arg))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ProtocolError::ArgumentMismatch {
                template: request.template,
                missing,
                unexpected,
            });
        }

        let mut args = TemplateArgs::new();
        for (field, convert) in entry.converters() {
            let value = convert(&request.args[field], &*session).map_err(|source| {
                ProtocolError::ConversionFailed {
                    template: request.template.clone(),
                    field: field.to_string(),
                    source,
                }
            })?;
            args.insert(field, value);
        }

        let template = entry.name().to_string();
        let constructor = entry.constructor();
        let compiler = Arc::clone(&self.compiler);
        let started = Instant::now();
        let task_template = template.clone();
        let compiled = tokio::task::spawn_blocking(move || {
            let plan = constructor(&task_template, args).map_err(|source| {
                ProtocolError::Construction {
                    template: task_template.clone(),
                    source,
                }
            })?;
            compiler
                .compile(plan)
                .map_err(|source| ProtocolError::compilation(task_template, source))
        })
        .await
        .map_err(|e| {
            ProtocolError::compilation(
                template.clone(),
                CompileError::Aborted {
                    reason: e.to_string(),
                },
            )
        })?;
        if let Some(metrics) = &self.metrics {
            metrics
                .daemon_metrics()
                .record_compile_latency(&template, started.elapsed().as_secs_f64());
        }

        let contract = Arc::new(compiled?);
        let reply = ServerMessage::Created(contract.min_funding.as_sat(), contract.address.clone());
        info!(
            session_id = %session.id(),
            template = %template,
            address = %contract.address,
            "contract created"
        );
        session.cache_mut().insert(contract);
        Ok(reply)
    }

    async fn handle_save(
        &self,
        session: &ProtocolSession,
        content: Value,
    ) -> ProtocolResult<ServerMessage> {
        let address: String =
            serde_json::from_value(content).map_err(|e| ProtocolError::invalid_content("save", e))?;
        let Some(contract) = session.cache().get(&address).cloned() else {
            debug!(session_id = %session.id(), %address, "save of uncached address");
            return Ok(ServerMessage::Saved(false));
        };
        let Some(store) = self.store.clone() else {
            return Ok(ServerMessage::Saved(false));
        };

        let id = session.id();
        let saved = tokio::task::spawn_blocking(move || store.save(&id, &contract)).await;
        Ok(ServerMessage::Saved(match saved {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(session_id = %id, %address, error = %err, "save failed");
                false
            },
            Err(err) => {
                warn!(session_id = %id, %address, error = %err, "save task failed");
                false
            },
        }))
    }

    async fn handle_export(&self, session: &ProtocolSession) -> ProtocolResult<ServerMessage> {
        let contracts = match self.store.clone() {
            None => SessionContracts::new(),
            Some(store) => {
                let id = session.id();
                tokio::task::spawn_blocking(move || store.load_session(&id))
                    .await
                    .map_err(|e| ProtocolError::Serialization {
                        reason: e.to_string(),
                    })??
            },
        };
        Ok(ServerMessage::Exported(SessionExport {
            session_id: session.id().to_string(),
            contracts,
        }))
    }

    fn handle_export_auth(&self, session: &ProtocolSession) -> ProtocolResult<ServerMessage> {
        let export = SessionExport {
            session_id: session.id().to_string(),
            contracts: session
                .cache()
                .iter()
                .map(|(address, contract)| (address.clone(), Arc::clone(contract)))
                .collect(),
        };
        let signed = self
            .signer
            .sign(export)
            .ok_or_else(|| ProtocolError::Serialization {
                reason: "export could not be encoded".to_string(),
            })?;
        Ok(ServerMessage::ExportedAuth(signed))
    }

    fn handle_load_auth(&self, session: &mut ProtocolSession, content: Value) -> ServerMessage {
        let Ok(signed) = serde_json::from_value::<SignedExport>(content) else {
            debug!(session_id = %session.id(), "malformed signed export");
            return ServerMessage::LoadedAuth(false);
        };
        if !self.signer.verify(&signed) {
            warn!(session_id = %session.id(), "signed export failed verification");
            return ServerMessage::LoadedAuth(false);
        }
        if signed
            .payload
            .contracts
            .iter()
            .any(|(address, contract)| *address != contract.address)
        {
            warn!(session_id = %session.id(), "signed export files a contract under a foreign address");
            return ServerMessage::LoadedAuth(false);
        }

        let loaded = signed.payload.contracts.len();
        for contract in signed.payload.contracts.into_values() {
            session.cache_mut().insert(contract);
        }
        info!(
            session_id = %session.id(),
            origin = %signed.payload.session_id,
            loaded,
            "signed export loaded"
        );
        ServerMessage::LoadedAuth(true)
    }

    async fn handle_bind(
        &self,
        session: &ProtocolSession,
        content: Value,
    ) -> ProtocolResult<ServerMessage> {
        let BindRequest(outpoint, address) =
            serde_json::from_value(content).map_err(|e| ProtocolError::invalid_content("bind", e))?;
        let contract: Arc<CompiledContract> = session
            .cache()
            .get(&address)
            .cloned()
            .ok_or(ProtocolError::UnknownContract { address })?;

        let compiler = Arc::clone(&self.compiler);
        let template = contract.template.clone();
        let task_contract = Arc::clone(&contract);
        let transactions =
            tokio::task::spawn_blocking(move || compiler.bind(&task_contract, outpoint))
                .await
                .map_err(|e| {
                    ProtocolError::compilation(
                        template.clone(),
                        CompileError::Aborted {
                            reason: e.to_string(),
                        },
                    )
                })?
                .map_err(|source| ProtocolError::compilation(template, source))?;
        debug!(
            session_id = %session.id(),
            address = %contract.address,
            transactions = transactions.len(),
            "contract bound"
        );
        Ok(ServerMessage::Bound(transactions))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("templates", &self.catalog.len())
            .field("durable", &self.is_durable())
            .finish_non_exhaustive()
    }
}
