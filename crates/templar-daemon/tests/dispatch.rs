//! Dispatcher behavior over in-process sessions: key-set validation, cache
//! population, reference resolution, session isolation and the auxiliary
//! message kinds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use templar_core::compiler::{CompileError, ContractCompiler, DigestCompiler};
use templar_core::contract::{CompiledContract, ContractPlan, Transaction};
use templar_core::registry::ReferencePolicy;
use templar_core::types::{Network, OutPoint};
use templar_core::default_catalog;
use templar_daemon::auth::ExportSigner;
use templar_daemon::metrics::new_shared_registry;
use templar_daemon::protocol::{CloseReason, DispatchOutcome, Dispatcher, ProtocolSession};
use templar_daemon::store::InMemoryContractStore;

const KEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

/// Digest compiler that counts `compile` calls.
struct CountingCompiler {
    inner: DigestCompiler,
    compiles: AtomicUsize,
}

impl CountingCompiler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DigestCompiler::new(Network::Regtest),
            compiles: AtomicUsize::new(0),
        })
    }

    fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl ContractCompiler for CountingCompiler {
    fn compile(&self, plan: ContractPlan) -> Result<CompiledContract, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(plan)
    }

    fn bind(
        &self,
        contract: &CompiledContract,
        funding: Option<OutPoint>,
    ) -> Result<Vec<Transaction>, CompileError> {
        self.inner.bind(contract, funding)
    }

    fn network(&self) -> Network {
        self.inner.network()
    }
}

fn dispatcher(compiler: &Arc<CountingCompiler>) -> Dispatcher {
    let compiler: Arc<dyn ContractCompiler> = Arc::<CountingCompiler>::clone(compiler);
    Dispatcher::new(
        Arc::new(default_catalog().unwrap()),
        compiler,
        ExportSigner::new(b"a test key, long enough".to_vec()),
    )
}

fn new_session() -> ProtocolSession {
    let mut session = ProtocolSession::new(ReferencePolicy::Fallback);
    session.activate();
    session
}

fn reply(outcome: DispatchOutcome) -> Value {
    match outcome {
        DispatchOutcome::Reply(frame) => serde_json::from_str(&frame).unwrap(),
        DispatchOutcome::Close { reason, notice } => {
            panic!("session closed ({reason:?}), notice: {notice:?}")
        },
    }
}

fn closed_with(outcome: DispatchOutcome, code: &str) {
    match outcome {
        DispatchOutcome::Close {
            reason: CloseReason::ProtocolViolation,
            notice: Some(frame),
        } => {
            let value: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["type"], "error");
            assert_eq!(value["content"]["code"], code);
        },
        other => panic!("expected a protocol violation, got {other:?}"),
    }
}

fn create_frame(template: &str, args: &Value) -> String {
    json!({"type": "create", "content": {"type": template, "args": args}}).to_string()
}

async fn create(
    dispatcher: &Dispatcher,
    session: &mut ProtocolSession,
    template: &str,
    args: &Value,
) -> (u64, String) {
    let value = reply(dispatcher.dispatch(session, &create_frame(template, args)).await);
    assert_eq!(value["type"], "created", "{value}");
    (
        value["content"][0].as_u64().unwrap(),
        value["content"][1].as_str().unwrap().to_string(),
    )
}

// ============================================================================
// create
// ============================================================================

#[tokio::test]
async fn test_p2pk_create_replies_with_funding_and_address() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    let (funding, address) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    assert!(funding > 0);
    assert!(address.starts_with("bcrt1q"), "{address}");
    assert_eq!(compiler.compiles(), 1);
    assert_eq!(session.cache().len(), 1);
    assert_eq!(session.cache().get(&address).unwrap().template, "p2pk");
}

#[tokio::test]
async fn test_key_set_mismatch_closes_without_compiling() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);

    let cases = [
        json!({}),
        json!({"pubkey": KEY, "extra": 1}),
        json!({"key": KEY}),
    ];
    for args in cases {
        let mut session = new_session();
        let outcome = dispatcher.dispatch(&mut session, &create_frame("p2pk", &args)).await;
        closed_with(outcome, "argument_mismatch");
        assert!(session.cache().is_empty());
    }
    assert_eq!(compiler.compiles(), 0);
}

#[tokio::test]
async fn test_unknown_kind_and_template_close() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);

    let mut session = new_session();
    closed_with(
        dispatcher.dispatch(&mut session, r#"{"type":"frobnicate"}"#).await,
        "unknown_kind",
    );

    let mut session = new_session();
    closed_with(
        dispatcher
            .dispatch(&mut session, &create_frame("escrow", &json!({})))
            .await,
        "unknown_template",
    );

    let mut session = new_session();
    closed_with(dispatcher.dispatch(&mut session, "not json").await, "malformed_envelope");
    assert_eq!(compiler.compiles(), 0);
}

#[tokio::test]
async fn test_conversion_failure_closes_and_caches_nothing() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    let outcome = dispatcher
        .dispatch(&mut session, &create_frame("p2pk", &json!({"pubkey": "zz"})))
        .await;
    closed_with(outcome, "conversion_failed");
    assert!(session.cache().is_empty());
    assert_eq!(compiler.compiles(), 0);
}

#[tokio::test]
async fn test_construction_failure_keeps_session_open() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    let (_, target) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    // Less than the target's minimum funding.
    let value = reply(
        dispatcher
            .dispatch(
                &mut session,
                &create_frame(
                    "delayed_send",
                    &json!({"to": [0, target], "amount": 1, "delay": 10}),
                ),
            )
            .await,
    );
    assert_eq!(value["type"], "error");
    assert_eq!(value["content"]["code"], "compile_failed");
    assert_eq!(session.cache().len(), 1);

    let (_, again) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    assert_eq!(again, target);
}

#[tokio::test]
async fn test_second_create_does_not_evict_first() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    let (_, key) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    let (_, send) = create(
        &dispatcher,
        &mut session,
        "delayed_send",
        &json!({"to": [0, key], "amount": 5_000, "delay": 10}),
    )
    .await;
    assert_ne!(key, send);
    assert_eq!(session.cache().len(), 2);
    assert!(session.cache().get(&key).is_some());
    assert!(session.cache().get(&send).is_some());
}

#[tokio::test]
async fn test_reference_resolves_to_cached_contract() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    let (_, key) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    let (funding, send) = create(
        &dispatcher,
        &mut session,
        "delayed_send",
        &json!({"to": [0, key], "amount": 5_000, "delay": 10}),
    )
    .await;
    assert_eq!(funding, 5_000);
    // The referenced contract was not rebuilt.
    assert_eq!(compiler.compiles(), 2);

    let cached_key = session.cache().get(&key).unwrap();
    let send = session.cache().get(&send).unwrap();
    assert!(Arc::ptr_eq(&send.branches[0].outputs[0].contract, cached_key));
}

#[tokio::test]
async fn test_sessions_do_not_share_references() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);

    let mut first = new_session();
    let (_, key) = create(&dispatcher, &mut first, "p2pk", &json!({"pubkey": KEY})).await;

    // Fallback: the address is treated as an opaque recipient.
    let mut second = new_session();
    let (_, send) = create(
        &dispatcher,
        &mut second,
        "delayed_send",
        &json!({"to": [0, key.clone()], "amount": 5_000, "delay": 10}),
    )
    .await;
    assert!(second.cache().get(&key).is_none());
    let target = &second.cache().get(&send).unwrap().branches[0].outputs[0].contract;
    assert_eq!(target.template, "pay_to_address");
    assert!(!Arc::ptr_eq(target, first.cache().get(&key).unwrap()));

    // Strict: an address from another session is rejected.
    let mut strict = ProtocolSession::new(ReferencePolicy::Strict);
    strict.activate();
    let outcome = dispatcher
        .dispatch(
            &mut strict,
            &create_frame(
                "delayed_send",
                &json!({"to": [0, key], "amount": 5_000, "delay": 10}),
            ),
        )
        .await;
    closed_with(outcome, "conversion_failed");
}

// ============================================================================
// close / lifecycle
// ============================================================================

#[tokio::test]
async fn test_close_ends_session_without_reply() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    assert_eq!(
        dispatcher.dispatch(&mut session, r#"{"type":"close"}"#).await,
        DispatchOutcome::Close {
            reason: CloseReason::ClientClose,
            notice: None,
        }
    );

    session.close();
    let outcome = dispatcher
        .dispatch(&mut session, &create_frame("p2pk", &json!({"pubkey": KEY})))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Close { .. }));
    assert_eq!(compiler.compiles(), 0);
}

// ============================================================================
// save / export
// ============================================================================

#[tokio::test]
async fn test_save_without_store_is_refused() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();
    assert!(!dispatcher.is_durable());

    let (_, key) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    let saved = reply(
        dispatcher
            .dispatch(&mut session, &json!({"type": "save", "content": key}).to_string())
            .await,
    );
    assert_eq!(saved, json!({"type": "saved", "content": false}));

    let exported = reply(dispatcher.dispatch(&mut session, r#"{"type":"export"}"#).await);
    assert_eq!(exported["type"], "exported");
    assert_eq!(exported["content"]["contracts"], json!({}));
}

#[tokio::test]
async fn test_save_then_export_with_store() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler).with_store(Arc::new(InMemoryContractStore::new()));
    let mut session = new_session();

    let frame: Value = serde_json::from_str(&dispatcher.session_frame(&session).unwrap()).unwrap();
    assert_eq!(frame["content"][0], true);
    assert_eq!(frame["content"][1], session.id().to_string());

    let (_, key) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    let saved = reply(
        dispatcher
            .dispatch(&mut session, &json!({"type": "save", "content": key}).to_string())
            .await,
    );
    assert_eq!(saved["content"], true);

    let unknown = reply(
        dispatcher
            .dispatch(&mut session, r#"{"type":"save","content":"bcrt1qnothere"}"#)
            .await,
    );
    assert_eq!(unknown["content"], false);

    let exported = reply(dispatcher.dispatch(&mut session, r#"{"type":"export"}"#).await);
    let contracts = exported["content"]["contracts"].as_object().unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[&key]["template"], "p2pk");
    assert_eq!(exported["content"]["session_id"], session.id().to_string());

    // Other sessions see nothing.
    let mut other = new_session();
    let exported = reply(dispatcher.dispatch(&mut other, r#"{"type":"export"}"#).await);
    assert_eq!(exported["content"]["contracts"], json!({}));
}

#[tokio::test]
async fn test_save_with_bad_content_closes() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();
    closed_with(
        dispatcher
            .dispatch(&mut session, r#"{"type":"save","content":[1]}"#)
            .await,
        "invalid_content",
    );
}

// ============================================================================
// export_auth / load_auth
// ============================================================================

#[tokio::test]
async fn test_signed_export_loads_into_another_session() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);

    let mut first = new_session();
    let (_, key) = create(&dispatcher, &mut first, "p2pk", &json!({"pubkey": KEY})).await;
    let exported = reply(dispatcher.dispatch(&mut first, r#"{"type":"export_auth"}"#).await);
    assert_eq!(exported["type"], "exported_auth");
    let blob = exported["content"].clone();

    let mut second = new_session();
    let load = json!({"type": "load_auth", "content": blob}).to_string();
    let loaded = reply(dispatcher.dispatch(&mut second, &load).await);
    assert_eq!(loaded, json!({"type": "loaded_auth", "content": true}));
    assert!(second.cache().get(&key).is_some());

    // The loaded contract is referenceable and bindable.
    create(
        &dispatcher,
        &mut second,
        "delayed_send",
        &json!({"to": [0, key.clone()], "amount": 5_000, "delay": 10}),
    )
    .await;
    let bound = reply(
        dispatcher
            .dispatch(&mut second, &json!({"type": "bind", "content": [null, key]}).to_string())
            .await,
    );
    assert_eq!(bound["type"], "bound");
}

#[tokio::test]
async fn test_tampered_or_foreign_exports_are_refused() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);

    let mut first = new_session();
    create(&dispatcher, &mut first, "p2pk", &json!({"pubkey": KEY})).await;
    let exported = reply(dispatcher.dispatch(&mut first, r#"{"type":"export_auth"}"#).await);

    let mut tampered = exported["content"].clone();
    tampered["payload"]["session_id"] = json!("someone else");

    let foreign_dispatcher = Dispatcher::new(
        Arc::new(default_catalog().unwrap()),
        Arc::new(DigestCompiler::new(Network::Regtest)),
        ExportSigner::new(b"a different key, also long".to_vec()),
    );

    let mut second = new_session();
    for (dispatcher, blob) in [
        (&dispatcher, tampered),
        (&dispatcher, json!("garbage")),
        (&foreign_dispatcher, exported["content"].clone()),
    ] {
        let load = json!({"type": "load_auth", "content": blob}).to_string();
        let loaded = reply(dispatcher.dispatch(&mut second, &load).await);
        assert_eq!(loaded["content"], false);
    }
    assert!(second.cache().is_empty());
}

// ============================================================================
// bind
// ============================================================================

#[tokio::test]
async fn test_bind_produces_transactions() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    let (_, key) = create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    let (_, send) = create(
        &dispatcher,
        &mut session,
        "delayed_send",
        &json!({"to": [0, key], "amount": 5_000, "delay": 10}),
    )
    .await;

    let unfunded = reply(
        dispatcher
            .dispatch(&mut session, &json!({"type": "bind", "content": [null, send]}).to_string())
            .await,
    );
    let txs = unfunded["content"].as_array().unwrap();
    assert_eq!(txs.len(), 2);
    assert_eq!(txs[0]["label"], "funding");

    let txid = "cd".repeat(32);
    let outpoint = format!("{txid}:1");
    let funded = reply(
        dispatcher
            .dispatch(&mut session, &json!({"type": "bind", "content": [outpoint, send]}).to_string())
            .await,
    );
    let txs = funded["content"].as_array().unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(
        txs[0]["inputs"][0]["previous_output"],
        json!({"txid": txid, "vout": 1})
    );
}

#[tokio::test]
async fn test_bind_unknown_address_keeps_session_open() {
    let compiler = CountingCompiler::new();
    let dispatcher = dispatcher(&compiler);
    let mut session = new_session();

    let value = reply(
        dispatcher
            .dispatch(&mut session, r#"{"type":"bind","content":[null,"bcrt1qnothere"]}"#)
            .await,
    );
    assert_eq!(value["type"], "error");
    assert_eq!(value["content"]["code"], "unknown_contract");
    assert!(!session.is_closed());
}

// ============================================================================
// metrics
// ============================================================================

#[tokio::test]
async fn test_dispatch_records_message_metrics() {
    let compiler = CountingCompiler::new();
    let registry = new_shared_registry().unwrap();
    let dispatcher = dispatcher(&compiler).with_metrics(Arc::clone(&registry));
    let metrics = registry.daemon_metrics();

    let mut session = new_session();
    create(&dispatcher, &mut session, "p2pk", &json!({"pubkey": KEY})).await;
    dispatcher.dispatch(&mut session, r#"{"type":"frobnicate"}"#).await;

    assert!((metrics.message_count("create", "ok") - 1.0).abs() < f64::EPSILON);
    assert!((metrics.message_count("unknown", "unknown_kind") - 1.0).abs() < f64::EPSILON);
    assert_eq!(metrics.compile_count("p2pk"), 1);
}
