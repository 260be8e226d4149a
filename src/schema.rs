//! Static per-type field descriptor tables.
//!
//! The reduction core consumes field introspection from a schema registry
//! resolved once at startup: per field `is_composite` / `is_sequence` /
//! `is_resource` / `is_leaf`, alias target, coupling, and default values;
//! per type its interface memberships. Alias chains are flattened when the
//! registry is built, so field access never walks them at runtime.
//!
//! [`SchemaRegistry::bootstrap`] registers the built-in types:
//!
//! - `ResourceStub`, `Resource` — the two universal interfaces
//! - `Entity` — ownable resource with owner/ownling and ghost bookkeeping
//! - `Relation` — coupled source/target reference pair
//! - `Blob` — immutable-content resource (idempotently re-creatable)

use std::collections::HashMap;

use crate::error::GraphError;
use crate::transient::FieldValue;

// ─────────────────────────────────────────────
// Well-known names
// ─────────────────────────────────────────────

pub const TYPE_RESOURCE_STUB: &str = "ResourceStub";
pub const TYPE_RESOURCE: &str = "Resource";
pub const TYPE_ENTITY: &str = "Entity";
pub const TYPE_RELATION: &str = "Relation";
pub const TYPE_BLOB: &str = "Blob";

pub const FIELD_ID: &str = "id";
pub const FIELD_TYPE_NAME: &str = "typeName";
pub const FIELD_NAME: &str = "name";
pub const FIELD_OWNER: &str = "owner";
pub const FIELD_OWNLINGS: &str = "ownlings";
pub const FIELD_PROTOTYPE: &str = "prototype";
pub const FIELD_INSTANCES: &str = "instances";
pub const FIELD_GHOST_PROTOTYPE: &str = "ghostPrototype";
pub const FIELD_GHOST_OWNER: &str = "ghostOwner";
pub const FIELD_GHOST_OWNLINGS: &str = "ghostOwnlings";
pub const FIELD_MATERIALIZED_GHOSTS: &str = "materializedGhosts";
pub const FIELD_PARTITION_AUTHORITY: &str = "partitionAuthorityURI";
pub const FIELD_CONTENT_HASH: &str = "contentHash";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_TARGET: &str = "target";
pub const FIELD_RELATIONS: &str = "relations";
pub const FIELD_INCOMING_RELATIONS: &str = "incomingRelations";

// ─────────────────────────────────────────────
// Field descriptors
// ─────────────────────────────────────────────

/// Introspection record for one field of one type.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    /// Composite: referenced resources are owned by the referrer.
    pub is_composite: bool,
    pub is_sequence: bool,
    /// The value is a resource reference (or a sequence of them).
    pub is_resource: bool,
    /// Plain data; never a reference.
    pub is_leaf: bool,
    /// Flattened alias target — reads and writes go to this field instead.
    pub alias: Option<String>,
    /// The field on the remote resource that mirrors this reference.
    pub coupled_field: Option<String>,
    /// Coupling used when a reference arrives without explicit coupling
    /// context.
    pub default_coupled_field: Option<String>,
    /// Populated at create time when nothing else set the field. Instances
    /// with a prototype skip defaults entirely (they inherit instead).
    pub default_value: Option<FieldValue>,
}

impl FieldDescriptor {
    fn leaf(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_composite: false,
            is_sequence: false,
            is_resource: false,
            is_leaf: true,
            alias: None,
            coupled_field: None,
            default_coupled_field: None,
            default_value: None,
        }
    }

    fn reference(name: &str, coupled_field: &str) -> Self {
        Self {
            name: name.to_string(),
            is_composite: false,
            is_sequence: false,
            is_resource: true,
            is_leaf: false,
            alias: None,
            coupled_field: Some(coupled_field.to_string()),
            default_coupled_field: Some(coupled_field.to_string()),
            default_value: None,
        }
    }

    fn composite(name: &str, coupled_field: &str) -> Self {
        Self { is_composite: true, ..Self::reference(name, coupled_field) }
    }

    fn sequence_of(mut self) -> Self {
        self.is_sequence = true;
        self.default_value = Some(FieldValue::List(Vec::new()));
        self
    }

    fn with_default(mut self, value: FieldValue) -> Self {
        self.default_value = Some(value);
        self
    }

    fn aliased(name: &str, target: &str) -> Self {
        Self { alias: Some(target.to_string()), ..Self::leaf(name) }
    }
}

// ─────────────────────────────────────────────
// Type descriptors and registry
// ─────────────────────────────────────────────

/// Introspection record for one type.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    /// Interfaces cannot be instantiated directly.
    pub is_interface: bool,
    /// Interface tables this type's ids get registered into.
    pub interfaces: Vec<String>,
    fields: HashMap<String, FieldDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: &str, is_interface: bool, interfaces: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            is_interface,
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    /// The descriptor for `field_name` with alias chains already flattened.
    pub fn field(&self, field_name: &str) -> Option<&FieldDescriptor> {
        let descriptor = self.fields.get(field_name)?;
        match &descriptor.alias {
            Some(target) => self.fields.get(target.as_str()),
            None => Some(descriptor),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }
}

/// The per-session schema registry. Immutable during reduction.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    types: HashMap<String, TypeDescriptor>,
}

impl SchemaRegistry {
    /// An empty registry. Most embedders want [`SchemaRegistry::bootstrap`].
    pub fn new() -> Self {
        Self { types: HashMap::new() }
    }

    /// The built-in type system.
    pub fn bootstrap() -> Self {
        let mut registry = Self::new();

        registry.register(TypeDescriptor::new(TYPE_RESOURCE_STUB, true, &[]));
        registry.register(TypeDescriptor::new(TYPE_RESOURCE, true, &[TYPE_RESOURCE_STUB]));

        registry.register(
            TypeDescriptor::new(TYPE_ENTITY, false, &[TYPE_RESOURCE, TYPE_RESOURCE_STUB])
                .with_field(FieldDescriptor::leaf(FIELD_NAME))
                .with_field(FieldDescriptor::leaf(FIELD_PARTITION_AUTHORITY))
                .with_field(FieldDescriptor::reference(FIELD_OWNER, FIELD_OWNLINGS))
                .with_field(FieldDescriptor::composite(FIELD_OWNLINGS, FIELD_OWNER).sequence_of())
                .with_field(FieldDescriptor::reference(FIELD_PROTOTYPE, FIELD_INSTANCES))
                .with_field(FieldDescriptor::reference(FIELD_INSTANCES, FIELD_PROTOTYPE).sequence_of())
                .with_field(FieldDescriptor::reference(FIELD_GHOST_PROTOTYPE, FIELD_MATERIALIZED_GHOSTS))
                .with_field(
                    FieldDescriptor::reference(FIELD_MATERIALIZED_GHOSTS, FIELD_GHOST_PROTOTYPE)
                        .sequence_of(),
                )
                .with_field(FieldDescriptor::reference(FIELD_GHOST_OWNER, FIELD_GHOST_OWNLINGS))
                .with_field(
                    FieldDescriptor::composite(FIELD_GHOST_OWNLINGS, FIELD_GHOST_OWNER).sequence_of(),
                )
                .with_field(FieldDescriptor::composite(FIELD_RELATIONS, FIELD_SOURCE).sequence_of())
                .with_field(
                    FieldDescriptor::reference(FIELD_INCOMING_RELATIONS, FIELD_TARGET).sequence_of(),
                )
                // "directory" reads as the owner on entities; a flattened alias.
                .with_field(FieldDescriptor::aliased("directory", FIELD_OWNER)),
        );

        registry.register(
            TypeDescriptor::new(TYPE_RELATION, false, &[TYPE_RESOURCE, TYPE_RESOURCE_STUB])
                .with_field(FieldDescriptor::leaf(FIELD_NAME))
                .with_field(FieldDescriptor::reference(FIELD_OWNER, FIELD_OWNLINGS))
                .with_field(FieldDescriptor::reference(FIELD_PROTOTYPE, FIELD_INSTANCES))
                .with_field(FieldDescriptor::reference(FIELD_GHOST_PROTOTYPE, FIELD_MATERIALIZED_GHOSTS))
                .with_field(FieldDescriptor::reference(FIELD_GHOST_OWNER, FIELD_GHOST_OWNLINGS))
                .with_field(FieldDescriptor::reference(FIELD_SOURCE, FIELD_RELATIONS))
                .with_field(FieldDescriptor::reference(FIELD_TARGET, FIELD_INCOMING_RELATIONS)),
        );

        registry.register(
            TypeDescriptor::new(TYPE_BLOB, false, &[TYPE_RESOURCE, TYPE_RESOURCE_STUB])
                .with_field(FieldDescriptor::leaf(FIELD_CONTENT_HASH))
                .with_field(
                    FieldDescriptor::leaf("referenceCount")
                        .with_default(FieldValue::Literal(serde_json::json!(0))),
                ),
        );

        registry
    }

    /// Register or replace a type. Call before the first reduction; the
    /// registry must not change mid-session.
    pub fn register(&mut self, descriptor: TypeDescriptor) {
        self.types.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, type_name: &str) -> Option<&TypeDescriptor> {
        self.types.get(type_name)
    }

    /// The descriptor for a type that must exist and be instantiable.
    pub fn instantiable(&self, type_name: &str) -> Result<&TypeDescriptor, GraphError> {
        let descriptor = self.types.get(type_name).ok_or_else(|| {
            GraphError::InvariantViolation(format!("unknown type '{type_name}'"))
        })?;
        if descriptor.is_interface {
            return Err(GraphError::InvariantViolation(format!(
                "cannot instantiate interface type '{type_name}' directly"
            )));
        }
        Ok(descriptor)
    }

    /// Field descriptor lookup with alias flattening.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDescriptor> {
        self.types.get(type_name)?.field(field_name)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::bootstrap()
    }
}
