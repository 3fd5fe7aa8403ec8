//! Template catalog and menu derivation.
//!
//! [`CatalogBuilder`] accepts registrations at startup. Each registration
//! walks the template's field table against the [`TypeRegistry`] and fails
//! fast on a field type with no descriptor or converter. [`CatalogBuilder::build`]
//! freezes the result into a [`Catalog`], which has no mutating API and
//! carries the menu frame serialized exactly once.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

use crate::registry::{ConverterFn, FieldType, TypeRegistry, WireType};
use crate::template::{Constructor, FieldDecl, Template};

/// Errors raised while building the catalog. All of them are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A template name was registered twice.
    #[error("template '{name}' is already registered")]
    DuplicateTemplate {
        /// Template name.
        name: String,
    },

    /// A declared field type has no descriptor or no converter.
    #[error("template '{template}' field '{field}' has unregistered type {ty}")]
    UnregisteredFieldType {
        /// Template name.
        template: String,
        /// Field name.
        field: &'static str,
        /// The type lacking a registry entry.
        ty: FieldType,
    },

    /// A template declares the same field name twice.
    #[error("template '{template}' declares field '{field}' more than once")]
    DuplicateField {
        /// Template name.
        template: String,
        /// Field name.
        field: &'static str,
    },

    /// The menu could not be serialized.
    #[error("failed to encode menu: {0}")]
    MenuEncoding(#[from] serde_json::Error),
}

/// A template's public schema: field names and wire descriptors, in
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSchema(Vec<(&'static str, WireType)>);

impl FieldSchema {
    /// Iterates the fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, WireType)> + '_ {
        self.0.iter().copied()
    }

    /// Field names in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(name, _)| *name)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the template takes no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `name` is a field of the schema.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(field, _)| *field == name)
    }
}

impl Serialize for FieldSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, descriptor) in &self.0 {
            map.serialize_entry(name, descriptor)?;
        }
        map.end()
    }
}

/// Template name to schema, as sent to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct Menu(BTreeMap<String, FieldSchema>);

impl Menu {
    /// Schema of one template.
    #[must_use]
    pub fn get(&self, template: &str) -> Option<&FieldSchema> {
        self.0.get(template)
    }

    /// Number of templates on the menu.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the menu is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Template names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// A registered template.
#[derive(Clone)]
pub struct TemplateEntry {
    name: String,
    schema: FieldSchema,
    converters: BTreeMap<&'static str, (FieldType, ConverterFn)>,
    constructor: Constructor,
}

impl TemplateEntry {
    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Public schema.
    #[must_use]
    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Converter for a field.
    #[must_use]
    pub fn converter(&self, field: &str) -> Option<ConverterFn> {
        self.converters.get(field).map(|(_, convert)| *convert)
    }

    /// Semantic type of a field.
    #[must_use]
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.converters.get(field).map(|(ty, _)| *ty)
    }

    /// Fields with their converters, sorted by name.
    pub fn converters(&self) -> impl Iterator<Item = (&'static str, ConverterFn)> + '_ {
        self.converters.iter().map(|(name, (_, convert))| (*name, *convert))
    }

    /// Constructor turning converted arguments into a plan.
    #[must_use]
    pub fn constructor(&self) -> Constructor {
        self.constructor
    }

    /// Whether the schema and the converter table name exactly the same
    /// fields.
    #[must_use]
    pub fn keys_consistent(&self) -> bool {
        self.schema.len() == self.converters.len()
            && self.schema.keys().all(|k| self.converters.contains_key(k))
    }
}

impl std::fmt::Debug for TemplateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEntry")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Mutable catalog used during startup.
#[derive(Debug)]
pub struct CatalogBuilder {
    registry: TypeRegistry,
    entries: HashMap<String, TemplateEntry>,
    menu: OnceLock<Menu>,
}

impl CatalogBuilder {
    /// Starts an empty catalog over `registry`.
    #[must_use]
    pub fn new(registry: TypeRegistry) -> Self {
        Self {
            registry,
            entries: HashMap::new(),
            menu: OnceLock::new(),
        }
    }

    /// Registers a template type under `name`.
    ///
    /// # Errors
    ///
    /// See [`CatalogBuilder::register_entry`].
    pub fn register<T: Template>(&mut self, name: &str) -> Result<&mut Self, CatalogError> {
        self.register_entry(name, T::FIELDS, T::construct)
    }

    /// Registers a template from its field table and constructor.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DuplicateTemplate`] if the name is taken,
    /// [`CatalogError::DuplicateField`] if a field name repeats, and
    /// [`CatalogError::UnregisteredFieldType`] if a field's type lacks a
    /// descriptor or a converter. Nothing is registered on error.
    pub fn register_entry(
        &mut self,
        name: &str,
        fields: &[FieldDecl],
        constructor: Constructor,
    ) -> Result<&mut Self, CatalogError> {
        if self.entries.contains_key(name) {
            return Err(CatalogError::DuplicateTemplate {
                name: name.to_string(),
            });
        }

        let mut schema = Vec::with_capacity(fields.len());
        let mut converters = BTreeMap::new();
        for field in fields {
            let unregistered = || CatalogError::UnregisteredFieldType {
                template: name.to_string(),
                field: field.name,
                ty: field.ty,
            };
            let descriptor = self.registry.descriptor_for(field.ty).ok_or_else(unregistered)?;
            let converter = self.registry.converter_for(field.ty).ok_or_else(unregistered)?;
            if converters
                .insert(field.name, (field.ty, converter))
                .is_some()
            {
                return Err(CatalogError::DuplicateField {
                    template: name.to_string(),
                    field: field.name,
                });
            }
            schema.push((field.name, descriptor));
        }

        self.entries.insert(
            name.to_string(),
            TemplateEntry {
                name: name.to_string(),
                schema: FieldSchema(schema),
                converters,
                constructor,
            },
        );
        self.menu.take();
        tracing::debug!(template = name, fields = fields.len(), "template registered");
        Ok(self)
    }

    /// The current menu, rebuilt after any registration since the last call.
    pub fn menu(&self) -> &Menu {
        self.menu.get_or_init(|| {
            Menu(
                self.entries
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry.schema.clone()))
                    .collect(),
            )
        })
    }

    /// Freezes the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::MenuEncoding`] if the menu frame cannot be
    /// serialized.
    pub fn build(self) -> Result<Catalog, CatalogError> {
        let menu = self.menu().clone();
        let menu_frame = serde_json::to_string(&MenuFrame {
            kind: "menu",
            content: &menu,
        })?;
        tracing::info!(templates = menu.len(), "template catalog frozen");
        Ok(Catalog {
            entries: self.entries,
            menu,
            menu_frame,
        })
    }
}

#[derive(serde::Serialize)]
struct MenuFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a Menu,
}

// ============================================================================
// Frozen catalog
// ============================================================================

/// Immutable template catalog shared by every connection.
#[derive(Debug)]
pub struct Catalog {
    entries: HashMap<String, TemplateEntry>,
    menu: Menu,
    menu_frame: String,
}

impl Catalog {
    /// Looks up a template.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TemplateEntry> {
        self.entries.get(name)
    }

    /// The menu.
    #[must_use]
    pub fn menu(&self) -> &Menu {
        &self.menu
    }

    /// The serialized `menu` frame sent to every new connection.
    #[must_use]
    pub fn menu_frame(&self) -> &str {
        &self.menu_frame
    }

    /// Registered template names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates every registered template.
    pub fn entries(&self) -> impl Iterator<Item = &TemplateEntry> {
        self.entries.values()
    }

    /// Number of registered templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no template is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
