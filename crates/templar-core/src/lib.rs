#![allow(clippy::doc_markdown)]

//! templar-core - contract templates, argument conversion and compilation
//!
//! This crate holds everything the websocket front end needs that is not
//! transport: the registry mapping semantic field types to wire descriptors
//! and converters, the template catalog and its menu, the built-in templates,
//! and the compiler that turns template plans into deployable contracts.
//!
//! # Lifecycle
//!
//! ```rust,ignore
//! let mut builder = CatalogBuilder::new(TypeRegistry::with_defaults());
//! register_builtin_templates(&mut builder)?;
//! let catalog = builder.build()?; // frozen, shareable behind Arc
//! ```
//!
//! # Modules
//!
//! - [`types`]: amounts, relative locks, keys, addresses, outpoints
//! - [`registry`]: field types, wire descriptors and converters
//! - [`template`]: the [`template::Template`] trait and argument access
//! - [`templates`]: `p2pk`, `vault` and `delayed_send`
//! - [`catalog`]: registration, menu derivation and the frozen catalog
//! - [`contract`]: plans, compiled contracts and transactions
//! - [`compiler`]: the compiler seam and the digest compiler
//! - [`bech32`]: segwit v0 address encoding
//! - [`config`]: daemon configuration file

pub mod bech32;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod contract;
pub mod registry;
pub mod template;
pub mod templates;
pub mod types;

pub use catalog::{Catalog, CatalogBuilder, CatalogError};
pub use compiler::{CompileError, ContractCompiler, DigestCompiler};
pub use contract::{CompiledContract, ContractPlan, Transaction};
pub use registry::{
    ArgValue, ConversionContext, ConvertError, FieldType, ReferencePolicy, TypeRegistry,
    WireType,
};
pub use template::{FieldDecl, Template, TemplateArgs, TemplateError};
pub use types::{Address, Amount, Network, OutPoint, PubKey};

/// Builds the catalog of built-in templates over the default registry.
///
/// # Errors
///
/// Returns an error only if the built-in field tables and the default
/// registry disagree.
pub fn default_catalog() -> Result<Catalog, CatalogError> {
    let mut builder = CatalogBuilder::new(TypeRegistry::with_defaults());
    templates::register_builtin_templates(&mut builder)?;
    builder.build()
}
