//! Built-in contract templates.

use std::sync::Arc;

use crate::catalog::{CatalogBuilder, CatalogError};
use crate::contract::{CompiledContract, Condition, ContractPlan, PlannedBranch};
use crate::registry::FieldType;
use crate::template::{FieldDecl, Template, TemplateArgs, TemplateError};
use crate::types::{Amount, PubKey, RelativeTimeSpec};

/// Catalog name of [`PayToPubKey`].
pub const P2PK: &str = "p2pk";
/// Catalog name of [`Vault`].
pub const VAULT: &str = "vault";
/// Catalog name of [`DelayedSend`].
pub const DELAYED_SEND: &str = "delayed_send";

/// Registers every built-in template under its catalog name.
///
/// # Errors
///
/// Fails if a name is already taken or the builder's registry lacks one of
/// the field types the built-ins declare.
pub fn register_builtin_templates(builder: &mut CatalogBuilder) -> Result<(), CatalogError> {
    builder.register::<PayToPubKey>(P2PK)?;
    builder.register::<Vault>(VAULT)?;
    builder.register::<DelayedSend>(DELAYED_SEND)?;
    Ok(())
}

fn ensure_covers(
    what: &str,
    available: Amount,
    contract: &CompiledContract,
) -> Result<(), TemplateError> {
    if available < contract.min_funding {
        return Err(TemplateError::InsufficientFunding {
            what: what.to_string(),
            required: contract.min_funding,
            available,
        });
    }
    Ok(())
}

// ============================================================================
// p2pk
// ============================================================================

/// Funds spendable by a single key.
#[derive(Debug, Clone)]
pub struct PayToPubKey {
    /// Key that can spend.
    pub pubkey: PubKey,
}

impl Template for PayToPubKey {
    const FIELDS: &'static [FieldDecl] = &[FieldDecl::new("pubkey", FieldType::PubKey)];

    fn from_args(mut args: TemplateArgs) -> Result<Self, TemplateError> {
        Ok(Self {
            pubkey: args.take_pubkey("pubkey")?,
        })
    }

    fn into_plan(self, template: &str) -> Result<ContractPlan, TemplateError> {
        Ok(ContractPlan::new(template, Amount::DUST)
            .branch(PlannedBranch::new("spend").require(Condition::Signature(self.pubkey))))
    }
}

// ============================================================================
// delayed_send
// ============================================================================

/// Pays a contract once a relative lock has elapsed.
#[derive(Debug, Clone)]
pub struct DelayedSend {
    /// Recipient.
    pub to: Arc<CompiledContract>,
    /// Amount paid to the recipient.
    pub amount: Amount,
    /// Lock that must elapse first.
    pub delay: RelativeTimeSpec,
}

impl Template for DelayedSend {
    const FIELDS: &'static [FieldDecl] = &[
        FieldDecl::new("to", FieldType::Contract),
        FieldDecl::new("amount", FieldType::Amount),
        FieldDecl::new("delay", FieldType::TimeSpec),
    ];

    fn from_args(mut args: TemplateArgs) -> Result<Self, TemplateError> {
        Ok(Self {
            to: args.take_contract("to")?,
            amount: args.take_amount("amount")?,
            delay: args.take_relative_time("delay")?,
        })
    }

    fn into_plan(self, template: &str) -> Result<ContractPlan, TemplateError> {
        if self.amount == Amount::ZERO {
            return Err(TemplateError::invalid("amount", "must be positive"));
        }
        ensure_covers("to", self.amount, &self.to)?;
        Ok(ContractPlan::new(template, self.amount).branch(
            PlannedBranch::new("send")
                .require(Condition::After(self.delay))
                .pay(self.amount, self.to),
        ))
    }
}

// ============================================================================
// vault
// ============================================================================

/// Releases `amount_step` to hot storage every `timeout`, over `n_steps`
/// steps, while the remainder can be swept to cold storage at any time.
///
/// Each step pays a [`DelayedSend`] to hot storage that matures after
/// `mature`, plus a vault over the remaining steps.
#[derive(Debug, Clone)]
pub struct Vault {
    /// Amount released per step.
    pub amount_step: Amount,
    /// Number of steps, at most [`Vault::MAX_STEPS`].
    pub n_steps: u32,
    /// Lock between steps.
    pub timeout: RelativeTimeSpec,
    /// Lock before a released step reaches hot storage.
    pub mature: RelativeTimeSpec,
    /// Destination of released steps.
    pub hot_storage: Arc<CompiledContract>,
    /// Destination of a sweep.
    pub cold_storage: Arc<CompiledContract>,
}

impl Vault {
    /// Largest accepted step count.
    pub const MAX_STEPS: u32 = 16;

    fn total(&self) -> Result<Amount, TemplateError> {
        self.amount_step
            .checked_mul(u64::from(self.n_steps))
            .ok_or_else(|| TemplateError::AmountOverflow {
                what: "vault total".to_string(),
            })
    }
}

impl Template for Vault {
    const FIELDS: &'static [FieldDecl] = &[
        FieldDecl::new("amount_step", FieldType::Amount),
        FieldDecl::new("n_steps", FieldType::Int),
        FieldDecl::new("timeout", FieldType::TimeSpec),
        FieldDecl::new("mature", FieldType::TimeSpec),
        FieldDecl::new("hot_storage", FieldType::Contract),
        FieldDecl::new("cold_storage", FieldType::Contract),
    ];

    fn from_args(mut args: TemplateArgs) -> Result<Self, TemplateError> {
        let n_steps = args.take_int("n_steps")?;
        let n_steps = u32::try_from(n_steps)
            .ok()
            .filter(|n| (1..=Self::MAX_STEPS).contains(n))
            .ok_or_else(|| {
                TemplateError::invalid(
                    "n_steps",
                    format!("must be between 1 and {}, got {n_steps}", Self::MAX_STEPS),
                )
            })?;
        Ok(Self {
            amount_step: args.take_amount("amount_step")?,
            n_steps,
            timeout: args.take_relative_time("timeout")?,
            mature: args.take_relative_time("mature")?,
            hot_storage: args.take_contract("hot_storage")?,
            cold_storage: args.take_contract("cold_storage")?,
        })
    }

    fn into_plan(self, template: &str) -> Result<ContractPlan, TemplateError> {
        if self.amount_step == Amount::ZERO {
            return Err(TemplateError::invalid("amount_step", "must be positive"));
        }
        let total = self.total()?;
        ensure_covers("cold_storage", total, &self.cold_storage)?;

        let release = DelayedSend {
            to: Arc::clone(&self.hot_storage),
            amount: self.amount_step,
            delay: self.mature,
        }
        .into_plan(DELAYED_SEND)?;

        let mut step = PlannedBranch::new("step")
            .require(Condition::After(self.timeout))
            .pay_plan(self.amount_step, release);
        if self.n_steps > 1 {
            let remainder = Amount::from_sat(total.as_sat() - self.amount_step.as_sat())
                .map_err(|_| TemplateError::AmountOverflow {
                    what: "vault remainder".to_string(),
                })?;
            let rest = Self {
                n_steps: self.n_steps - 1,
                ..self.clone()
            }
            .into_plan(template)?;
            step = step.pay_plan(remainder, rest);
        }

        Ok(ContractPlan::new(template, total)
            .branch(PlannedBranch::new("to_cold").pay(total, Arc::clone(&self.cold_storage)))
            .branch(step))
    }
}
