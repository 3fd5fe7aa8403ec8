//! Fuzz harness for client frame handling.
//!
//! Feeds arbitrary text through envelope parsing, message routing and every
//! field converter of the built-in catalog, checking that nothing panics.

#![no_main]
use std::sync::{Arc, OnceLock};

use libfuzzer_sys::fuzz_target;
use serde_json::Value;
use templar_core::contract::CompiledContract;
use templar_core::registry::{ConversionContext, ReferencePolicy};
use templar_core::{default_catalog, Catalog};
use templar_daemon::protocol::messages::{CreateRequest, Envelope, MessageKind};

struct NoCache;

impl ConversionContext for NoCache {
    fn resolve_contract(&self, _address: &str) -> Option<Arc<CompiledContract>> {
        None
    }

    fn reference_policy(&self) -> ReferencePolicy {
        ReferencePolicy::Fallback
    }
}

fn catalog() -> &'static Catalog {
    static CATALOG: OnceLock<Catalog> = OnceLock::new();
    CATALOG.get_or_init(|| default_catalog().expect("built-in catalog"))
}

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(envelope) = Envelope::parse(frame) else {
        return;
    };
    if MessageKind::parse(&envelope.kind) != Some(MessageKind::Create) {
        return;
    }
    let Ok(request) = serde_json::from_value::<CreateRequest>(envelope.content) else {
        return;
    };
    let Some(entry) = catalog().get(&request.template) else {
        return;
    };
    for (field, convert) in entry.converters() {
        let raw = request.args.get(field).unwrap_or(&Value::Null);
        let _ = convert(raw, &NoCache);
    }
});
