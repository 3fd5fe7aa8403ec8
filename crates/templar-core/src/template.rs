//! The contract template abstraction.
//!
//! A template is a named contract family with a statically declared field
//! table. The catalog reads [`Template::FIELDS`] once at registration to
//! derive the template's menu schema and converter table; at request time the
//! dispatcher hands the converted arguments to the template's constructor,
//! which lowers them into a [`ContractPlan`].

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::contract::{CompiledContract, ContractPlan};
use crate::registry::{ArgValue, FieldType};
use crate::types::{Amount, PubKey, RelativeTimeSpec, Sequence};

/// One entry of a template's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDecl {
    /// Argument name as it appears on the wire.
    pub name: &'static str,
    /// Semantic type of the argument.
    pub ty: FieldType,
}

impl FieldDecl {
    /// Declares a field.
    #[must_use]
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty }
    }
}

/// Errors raised by template constructors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The constructor needed an argument that was not supplied.
    #[error("missing argument '{field}'")]
    MissingArgument {
        /// Field name.
        field: String,
    },

    /// The argument was converted to a different type than the constructor
    /// expects.
    #[error("argument '{field}' is not a {expected}")]
    WrongArgumentType {
        /// Field name.
        field: String,
        /// Type the constructor wanted.
        expected: &'static str,
    },

    /// The argument has the right type but an unusable value.
    #[error("invalid argument '{field}': {reason}")]
    InvalidArgument {
        /// Field name.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A child contract needs more than the parent provides for it.
    #[error("{what} needs at least {required}, only {available} available")]
    InsufficientFunding {
        /// What is being funded.
        what: String,
        /// Amount needed.
        required: Amount,
        /// Amount provided.
        available: Amount,
    },

    /// Funding arithmetic left the valid amount range.
    #[error("funding for {what} overflows the money supply")]
    AmountOverflow {
        /// What was being summed.
        what: String,
    },
}

impl TemplateError {
    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Converted arguments of one `create` request, keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct TemplateArgs {
    values: BTreeMap<String, ArgValue>,
}

macro_rules! take_typed {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ty:ty, $label:literal) => {
        $(#[$doc])*
        pub fn $name(&mut self, field: &str) -> Result<$ty, TemplateError> {
            match self.take(field)? {
                ArgValue::$variant(value) => Ok(value),
                _ => Err(TemplateError::WrongArgumentType {
                    field: field.to_string(),
                    expected: $label,
                }),
            }
        }
    };
}

impl TemplateArgs {
    /// Creates an empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an argument.
    pub fn insert(&mut self, field: impl Into<String>, value: ArgValue) {
        self.values.insert(field.into(), value);
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Removes and returns an argument.
    pub fn take(&mut self, field: &str) -> Result<ArgValue, TemplateError> {
        self.values
            .remove(field)
            .ok_or_else(|| TemplateError::MissingArgument {
                field: field.to_string(),
            })
    }

    take_typed!(
        /// Removes an `Int` argument.
        take_int, Int, i64, "integer"
    );
    take_typed!(
        /// Removes an `Amount` argument.
        take_amount, Amount, Amount, "amount"
    );
    take_typed!(
        /// Removes a `Sequence` argument.
        take_sequence, Sequence, Sequence, "sequence"
    );
    take_typed!(
        /// Removes a relative lock time argument.
        take_relative_time, RelativeTime, RelativeTimeSpec, "relative lock time"
    );
    take_typed!(
        /// Removes a `PubKey` argument.
        take_pubkey, PubKey, PubKey, "public key"
    );
    take_typed!(
        /// Removes a contract reference argument.
        take_contract, Contract, Arc<CompiledContract>, "contract"
    );
}

impl FromIterator<(String, ArgValue)> for TemplateArgs {
    fn from_iter<I: IntoIterator<Item = (String, ArgValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Type-erased template constructor stored in the catalog. Receives the
/// registered template name and the converted arguments.
pub type Constructor = fn(&str, TemplateArgs) -> Result<ContractPlan, TemplateError>;

/// A contract template with a static field table.
pub trait Template: Sized {
    /// Declared fields, in menu order.
    const FIELDS: &'static [FieldDecl];

    /// Builds the template from converted arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if an argument is missing, of the wrong type, or has
    /// a value the template cannot use.
    fn from_args(args: TemplateArgs) -> Result<Self, TemplateError>;

    /// Lowers the template into a compiler-ready plan labelled `template`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template's funding does not add up.
    fn into_plan(self, template: &str) -> Result<ContractPlan, TemplateError>;

    /// [`Constructor`] for this template.
    ///
    /// # Errors
    ///
    /// Propagates [`Template::from_args`] and [`Template::into_plan`] errors.
    fn construct(template: &str, args: TemplateArgs) -> Result<ContractPlan, TemplateError> {
        Self::from_args(args)?.into_plan(template)
    }
}
