//! Contract compilation.
//!
//! [`ContractCompiler`] is the seam between the protocol front end and
//! whatever turns plans into deployable contracts. [`DigestCompiler`] is the
//! shipped implementation: it checks the plan's funding arithmetic, commits
//! to the plan with SHA-256 and encodes the digest as a segwit v0 address.
//!
//! # Binding
//!
//! Binding a contract to the outpoint that funds it yields one transaction
//! per spending branch that creates outputs, followed by the transactions of
//! every child contract those outputs fund. Branches that only release funds
//! to a signer produce no transaction.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bech32;
use crate::contract::{
    Branch, CompiledContract, Condition, ContractPlan, Output, OutputTarget, Transaction, TxIn,
    TxOut,
};
use crate::types::{Address, Amount, Network, OutPoint, Sequence};

/// Deepest contract nesting the compiler produces.
///
/// Compiled contracts travel as nested JSON, and JSON decoders bound
/// recursion; at this depth an export still decodes.
pub const MAX_CONTRACT_DEPTH: usize = 20;

/// Most transactions a single bind may produce.
pub const MAX_BIND_TRANSACTIONS: usize = 4096;

/// Label of the mock funding transaction.
pub const FUNDING_LABEL: &str = "funding";

/// Errors raised by a [`ContractCompiler`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A branch pays out more than the contract holds.
    #[error("branch '{branch}' of {template} pays {spent}, contract holds {funding}")]
    Overspend {
        /// Template being compiled.
        template: String,
        /// Offending branch.
        branch: String,
        /// Sum of the branch outputs.
        spent: Amount,
        /// Funding of the contract.
        funding: Amount,
    },

    /// An output carries less than its recipient requires.
    #[error("branch '{branch}' of {template} pays {available} to {recipient}, which needs {required}")]
    Underfunded {
        /// Template being compiled.
        template: String,
        /// Offending branch.
        branch: String,
        /// Recipient address.
        recipient: Address,
        /// Recipient's minimum funding.
        required: Amount,
        /// Output amount.
        available: Amount,
    },

    /// Contract nesting exceeds [`MAX_CONTRACT_DEPTH`].
    #[error("contract nesting exceeds {max} levels")]
    DepthExceeded {
        /// The limit.
        max: usize,
    },

    /// Binding would produce more than [`MAX_BIND_TRANSACTIONS`].
    #[error("binding produces more than {max} transactions")]
    TooManyTransactions {
        /// The limit.
        max: usize,
    },

    /// Output amounts overflow.
    #[error("output amounts of branch '{branch}' overflow")]
    AmountOverflow {
        /// Offending branch.
        branch: String,
    },

    /// The canonical encoding could not be produced.
    #[error("canonical encoding failed: {0}")]
    Encoding(String),

    /// The compilation task did not complete.
    #[error("compilation aborted: {reason}")]
    Aborted {
        /// What happened to the task.
        reason: String,
    },
}

impl From<serde_json::Error> for CompileError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

/// Turns plans into deployable contracts.
pub trait ContractCompiler: Send + Sync {
    /// Compiles a plan, compiling nested plans first.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan's funding does not add up or its nesting
    /// is too deep.
    fn compile(&self, plan: ContractPlan) -> Result<CompiledContract, CompileError>;

    /// Produces the transactions that spend `contract` once it is funded at
    /// `funding`. Without an outpoint, a mock funding transaction is created
    /// and returned first.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind is too large or cannot be encoded.
    fn bind(
        &self,
        contract: &CompiledContract,
        funding: Option<OutPoint>,
    ) -> Result<Vec<Transaction>, CompileError>;

    /// Network addresses are encoded for.
    fn network(&self) -> Network;
}

/// Compiler that derives addresses from a digest of the plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestCompiler {
    network: Network,
}

impl DigestCompiler {
    /// Creates a compiler for `network`.
    #[must_use]
    pub const fn new(network: Network) -> Self {
        Self { network }
    }

    fn compile_at(
        &self,
        plan: ContractPlan,
        depth: usize,
        depths: &mut HashMap<Address, usize>,
    ) -> Result<(CompiledContract, usize), CompileError> {
        if depth > MAX_CONTRACT_DEPTH {
            return Err(CompileError::DepthExceeded {
                max: MAX_CONTRACT_DEPTH,
            });
        }

        let mut branches = Vec::with_capacity(plan.branches.len());
        let mut deepest_child = 0;
        for planned in plan.branches {
            let mut spent = Amount::ZERO;
            let mut outputs = Vec::with_capacity(planned.outputs.len());
            for output in planned.outputs {
                let (child, child_depth) = match output.target {
                    OutputTarget::Compiled(contract) => {
                        let child_depth = nesting_depth(&contract, depths);
                        (contract, child_depth)
                    },
                    OutputTarget::Plan(nested) => {
                        let (contract, child_depth) = self.compile_at(*nested, depth + 1, depths)?;
                        (Arc::new(contract), child_depth)
                    },
                };
                if child_depth + depth > MAX_CONTRACT_DEPTH {
                    return Err(CompileError::DepthExceeded {
                        max: MAX_CONTRACT_DEPTH,
                    });
                }
                if output.amount < child.min_funding {
                    return Err(CompileError::Underfunded {
                        template: plan.template,
                        branch: planned.label,
                        recipient: child.address.clone(),
                        required: child.min_funding,
                        available: output.amount,
                    });
                }
                spent = spent.checked_add(output.amount).ok_or_else(|| {
                    CompileError::AmountOverflow {
                        branch: planned.label.clone(),
                    }
                })?;
                deepest_child = deepest_child.max(child_depth);
                outputs.push(Output {
                    amount: output.amount,
                    contract: child,
                });
            }
            if spent > plan.funding {
                return Err(CompileError::Overspend {
                    template: plan.template,
                    branch: planned.label,
                    spent,
                    funding: plan.funding,
                });
            }
            branches.push(Branch {
                label: planned.label,
                conditions: planned.conditions,
                outputs,
            });
        }

        let commitment = serde_json::to_vec(&json!({
            "template": plan.template,
            "funding": plan.funding,
            "branches": branches
                .iter()
                .map(|branch| json!({
                    "label": branch.label,
                    "conditions": branch.conditions,
                    "outputs": branch
                        .outputs
                        .iter()
                        .map(|o| json!({"amount": o.amount, "address": o.contract.address}))
                        .collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>(),
        }))?;
        let program = Sha256::digest(&commitment);
        let address = Address::parse(bech32::encode_segwit_v0(self.network.hrp(), &program))
            .map_err(|e| CompileError::Encoding(e.to_string()))?;

        let contract = CompiledContract {
            template: plan.template,
            address,
            min_funding: plan.funding.max(Amount::DUST),
            branches,
        };
        let own_depth = deepest_child + 1;
        depths.insert(contract.address.clone(), own_depth);
        Ok((contract, own_depth))
    }

    fn bind_into(
        &self,
        contract: &CompiledContract,
        funding: &OutPoint,
        transactions: &mut Vec<Transaction>,
    ) -> Result<(), CompileError> {
        for branch in contract.branches.iter().filter(|b| !b.outputs.is_empty()) {
            if transactions.len() >= MAX_BIND_TRANSACTIONS {
                return Err(CompileError::TooManyTransactions {
                    max: MAX_BIND_TRANSACTIONS,
                });
            }
            let sequence = branch
                .conditions
                .iter()
                .filter_map(|c| match c {
                    Condition::After(lock) => Some(lock.sequence()),
                    Condition::Signature(_) => None,
                })
                .max()
                .unwrap_or(Sequence::FINAL);
            let tx = seal(
                format!("{}:{}", contract.template, branch.label),
                vec![TxIn {
                    previous_output: funding.clone(),
                    sequence: sequence.0,
                }],
                branch
                    .outputs
                    .iter()
                    .map(|o| TxOut {
                        amount: o.amount,
                        address: o.contract.address.clone(),
                    })
                    .collect(),
                branch
                    .conditions
                    .iter()
                    .filter_map(|c| match c {
                        Condition::Signature(key) => Some(*key),
                        Condition::After(_) => None,
                    })
                    .collect(),
            )?;
            let txid = tx.txid.clone();
            transactions.push(tx);

            for (vout, output) in (0u32..).zip(&branch.outputs) {
                let outpoint = OutPoint {
                    txid: txid.clone(),
                    vout,
                };
                self.bind_into(&output.contract, &outpoint, transactions)?;
            }
        }
        Ok(())
    }
}

impl ContractCompiler for DigestCompiler {
    fn compile(&self, plan: ContractPlan) -> Result<CompiledContract, CompileError> {
        let template = plan.template.clone();
        let (contract, depth) = self.compile_at(plan, 1, &mut HashMap::new())?;
        tracing::debug!(
            template = %template,
            address = %contract.address,
            depth,
            "contract compiled"
        );
        Ok(contract)
    }

    fn bind(
        &self,
        contract: &CompiledContract,
        funding: Option<OutPoint>,
    ) -> Result<Vec<Transaction>, CompileError> {
        let mut transactions = Vec::new();
        let funding = match funding {
            Some(outpoint) => outpoint,
            None => {
                let mock = mock_funding_transaction(contract)?;
                let outpoint = OutPoint {
                    txid: mock.txid.clone(),
                    vout: 0,
                };
                transactions.push(mock);
                outpoint
            },
        };
        self.bind_into(contract, &funding, &mut transactions)?;
        Ok(transactions)
    }

    fn network(&self) -> Network {
        self.network
    }
}

/// A transaction that creates the contract's deployment output at its
/// minimum funding, spending the null outpoint.
///
/// # Errors
///
/// Returns an error if the transaction cannot be encoded.
pub fn mock_funding_transaction(contract: &CompiledContract) -> Result<Transaction, CompileError> {
    seal(
        FUNDING_LABEL.to_string(),
        vec![TxIn {
            previous_output: OutPoint::null(),
            sequence: Sequence::FINAL.0,
        }],
        vec![TxOut {
            amount: contract.min_funding,
            address: contract.address.clone(),
        }],
        Vec::new(),
    )
}

#[derive(Serialize)]
struct TxCommitment<'a> {
    label: &'a str,
    inputs: &'a [TxIn],
    outputs: &'a [TxOut],
    required_signatures: &'a [crate::types::PubKey],
}

fn seal(
    label: String,
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
    required_signatures: Vec<crate::types::PubKey>,
) -> Result<Transaction, CompileError> {
    let encoded = serde_json::to_vec(&TxCommitment {
        label: &label,
        inputs: &inputs,
        outputs: &outputs,
        required_signatures: &required_signatures,
    })?;
    let txid = hex::encode(Sha256::digest(Sha256::digest(&encoded)));
    Ok(Transaction {
        txid,
        label,
        inputs,
        outputs,
        required_signatures,
    })
}

/// Nesting depth of an already compiled contract; a leaf has depth 1.
fn nesting_depth(contract: &CompiledContract, memo: &mut HashMap<Address, usize>) -> usize {
    if let Some(depth) = memo.get(&contract.address) {
        return *depth;
    }
    let mut deepest = 0;
    for output in contract.branches.iter().flat_map(|b| &b.outputs) {
        deepest = deepest.max(nesting_depth(&output.contract, memo));
    }
    memo.insert(contract.address.clone(), deepest + 1);
    deepest + 1
}
