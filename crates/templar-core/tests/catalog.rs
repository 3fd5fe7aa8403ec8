//! Integration tests for the built-in catalog: menu contents, schema and
//! converter agreement, and conversion through to compilation.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use templar_core::compiler::{ContractCompiler, DigestCompiler};
use templar_core::contract::CompiledContract;
use templar_core::registry::{ConversionContext, ReferencePolicy};
use templar_core::template::TemplateArgs;
use templar_core::types::Network;
use templar_core::{default_catalog, Catalog};

const KEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

#[derive(Default)]
struct Cache(HashMap<String, Arc<CompiledContract>>);

impl ConversionContext for Cache {
    fn resolve_contract(&self, address: &str) -> Option<Arc<CompiledContract>> {
        self.0.get(address).cloned()
    }

    fn reference_policy(&self) -> ReferencePolicy {
        ReferencePolicy::Fallback
    }
}

fn create(
    catalog: &Catalog,
    cache: &mut Cache,
    template: &str,
    args: &Value,
) -> Arc<CompiledContract> {
    let entry = catalog.get(template).expect("template registered");
    let raw = args.as_object().expect("object args");
    let mut converted = TemplateArgs::new();
    for (field, convert) in entry.converters() {
        converted.insert(field, convert(&raw[field], &*cache).expect("converts"));
    }
    let plan = (entry.constructor())(template, converted).expect("constructs");
    let contract = Arc::new(
        DigestCompiler::new(Network::Regtest)
            .compile(plan)
            .expect("compiles"),
    );
    cache
        .0
        .insert(contract.address.to_string(), Arc::clone(&contract));
    contract
}

#[test]
fn test_menu_lists_builtin_templates_with_full_schemas() {
    let catalog = default_catalog().unwrap();
    let frame: Value = serde_json::from_str(catalog.menu_frame()).unwrap();
    assert_eq!(
        frame,
        json!({
            "type": "menu",
            "content": {
                "p2pk": {"pubkey": "String"},
                "delayed_send": {"to": [0, "String"], "amount": "int", "delay": "int"},
                "vault": {
                    "amount_step": "int",
                    "n_steps": "int",
                    "timeout": "int",
                    "mature": "int",
                    "hot_storage": [0, "String"],
                    "cold_storage": [0, "String"],
                },
            },
        })
    );
}

#[test]
fn test_schema_and_converter_keys_agree() {
    let catalog = default_catalog().unwrap();
    assert_eq!(catalog.len(), 3);
    for entry in catalog.entries() {
        assert!(entry.keys_consistent(), "{}", entry.name());
    }
}

#[test]
fn test_schema_preserves_declaration_order_on_the_wire() {
    let catalog = default_catalog().unwrap();
    let vault_at = catalog.menu_frame().find("\"vault\"").unwrap();
    let order: Vec<_> = [
        "amount_step",
        "n_steps",
        "timeout",
        "mature",
        "hot_storage",
        "cold_storage",
    ]
    .iter()
    .map(|field| catalog.menu_frame()[vault_at..].find(field).unwrap())
    .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{order:?}");
}

#[test]
fn test_vault_over_cached_p2pk_contracts() {
    let catalog = default_catalog().unwrap();
    let mut cache = Cache::default();

    let hot = create(&catalog, &mut cache, "p2pk", &json!({"pubkey": KEY}));
    let cold = create(&catalog, &mut cache, "p2pk", &json!({"pubkey": KEY}));
    assert_eq!(hot.address, cold.address);

    let vault = create(
        &catalog,
        &mut cache,
        "vault",
        &json!({
            "amount_step": 10_000,
            "n_steps": 4,
            "timeout": 6,
            "mature": 144,
            "hot_storage": [0, hot.address.as_str()],
            "cold_storage": [0, cold.address.as_str()],
        }),
    );
    assert_eq!(vault.min_funding.as_sat(), 40_000);
    assert!(vault.address.as_str().starts_with("bcrt1q"));

    let sweep = &vault.branches[0];
    assert_eq!(sweep.label, "to_cold");
    assert!(Arc::ptr_eq(&sweep.outputs[0].contract, &cold));

    let txs = DigestCompiler::new(Network::Regtest)
        .bind(&vault, None)
        .unwrap();
    // funding, then per level: to_cold, step, delayed_send:send; the last
    // level has no remainder vault.
    assert_eq!(txs.len(), 1 + 4 * 3);
    assert_eq!(txs[0].label, "funding");
}

#[test]
fn test_unresolved_reference_builds_pay_to_address() {
    let catalog = default_catalog().unwrap();
    let mut cache = Cache::default();
    let send = create(
        &catalog,
        &mut cache,
        "delayed_send",
        &json!({"to": [500, "bcrt1qsomewhereelse"], "amount": 1_000, "delay": 10}),
    );
    let target = &send.branches[0].outputs[0].contract;
    assert_eq!(target.template, "pay_to_address");
    assert_eq!(target.address.as_str(), "bcrt1qsomewhereelse");
}
