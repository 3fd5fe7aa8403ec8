//! Contract plans and compiled contracts.
//!
//! A template constructor lowers its typed arguments into a [`ContractPlan`]:
//! the funding it needs and the spending branches it offers. Child contracts
//! referenced by a plan are either already compiled (a contract reference
//! resolved from the session cache) or nested plans the compiler compiles
//! first. [`CompiledContract`] is the compiler's output and the value stored in
//! a session's compilation cache.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{Address, Amount, OutPoint, PubKey, RelativeTimeSpec};

/// Name of the minimal template built for contract references that do not
/// resolve to a cached contract.
pub const PAY_TO_ADDRESS: &str = "pay_to_address";

/// A condition that must hold for a branch to be spendable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// A signature by the given key.
    Signature(PubKey),
    /// The funding output must have aged by the given relative lock.
    After(RelativeTimeSpec),
}

/// Where a planned output sends its funds.
#[derive(Debug, Clone)]
pub enum OutputTarget {
    /// A contract that is already compiled.
    Compiled(Arc<CompiledContract>),
    /// A nested plan the compiler must compile before this one.
    Plan(Box<ContractPlan>),
}

/// An output of a planned branch.
#[derive(Debug, Clone)]
pub struct PlannedOutput {
    /// Value sent to the target.
    pub amount: Amount,
    /// Recipient contract.
    pub target: OutputTarget,
}

/// A spending branch of a plan.
#[derive(Debug, Clone)]
pub struct PlannedBranch {
    /// Human-readable branch name, unique within the plan.
    pub label: String,
    /// Conditions guarding the branch.
    pub conditions: Vec<Condition>,
    /// Outputs the spending transaction must create. Empty for branches that
    /// only release funds to a signer.
    pub outputs: Vec<PlannedOutput>,
}

impl PlannedBranch {
    /// Starts a branch with no conditions and no outputs.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            conditions: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Adds a guarding condition.
    #[must_use]
    pub fn require(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Adds an output paying an already compiled contract.
    #[must_use]
    pub fn pay(mut self, amount: Amount, contract: Arc<CompiledContract>) -> Self {
        self.outputs.push(PlannedOutput {
            amount,
            target: OutputTarget::Compiled(contract),
        });
        self
    }

    /// Adds an output paying a nested plan.
    #[must_use]
    pub fn pay_plan(mut self, amount: Amount, plan: ContractPlan) -> Self {
        self.outputs.push(PlannedOutput {
            amount,
            target: OutputTarget::Plan(Box::new(plan)),
        });
        self
    }
}

/// The compiler-ready description of a template instance.
#[derive(Debug, Clone)]
pub struct ContractPlan {
    /// Template the plan was produced by.
    pub template: String,
    /// Funds the contract must be created with.
    pub funding: Amount,
    /// Spending branches.
    pub branches: Vec<PlannedBranch>,
}

impl ContractPlan {
    /// Starts an empty plan.
    #[must_use]
    pub fn new(template: impl Into<String>, funding: Amount) -> Self {
        Self {
            template: template.into(),
            funding,
            branches: Vec::new(),
        }
    }

    /// Appends a spending branch.
    #[must_use]
    pub fn branch(mut self, branch: PlannedBranch) -> Self {
        self.branches.push(branch);
        self
    }
}

/// An output of a compiled branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Value sent to the contract.
    pub amount: Amount,
    /// Recipient.
    pub contract: Arc<CompiledContract>,
}

/// A spending branch of a compiled contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch name.
    pub label: String,
    /// Conditions guarding the branch.
    pub conditions: Vec<Condition>,
    /// Outputs of the spending transaction.
    pub outputs: Vec<Output>,
}

/// A compiled, deployable contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledContract {
    /// Template that produced the contract.
    pub template: String,
    /// Deployment address; unique key of the contract in a session cache.
    pub address: Address,
    /// Smallest amount the deployment output must carry.
    pub min_funding: Amount,
    /// Spending branches.
    pub branches: Vec<Branch>,
}

impl CompiledContract {
    /// The minimal contract used when a contract reference names an address
    /// this session never compiled: it simply pays `amount` to `address`.
    #[must_use]
    pub fn pay_to_address(amount: Amount, address: Address) -> Self {
        Self {
            template: PAY_TO_ADDRESS.to_string(),
            address,
            min_funding: amount,
            branches: Vec::new(),
        }
    }
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    /// Output being spent.
    pub previous_output: OutPoint,
    /// nSequence of the input.
    pub sequence: u32,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Value of the output.
    pub amount: Amount,
    /// Address paid.
    pub address: Address,
}

/// A transaction produced by binding a contract to a funding outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hex transaction id.
    pub txid: String,
    /// `<template>:<branch>` the transaction spends through, or `funding`.
    pub label: String,
    /// Inputs.
    pub inputs: Vec<TxIn>,
    /// Outputs.
    pub outputs: Vec<TxOut>,
    /// Keys that must sign before the transaction is valid.
    pub required_signatures: Vec<PubKey>,
}
