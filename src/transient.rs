//! Transients — immutable, denormalized field snapshots.
//!
//! A [`Transient`] is one resource's fields at one state generation. Two
//! kinds exist:
//!
//! - **Materialized** — backed by an explicit entry in
//!   [`State`](crate::state::State).
//! - **Immaterial** — synthesized by the resolver for a ghost that has no
//!   state entry. Carries no fields of its own; field lookups fall through
//!   to a designated prototype via an explicit back-reference, never through
//!   the public field graph. An immaterial transient must never be treated
//!   as an owner of anything real.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::ResourceId;

// ─────────────────────────────────────────────
// FieldValue
// ─────────────────────────────────────────────

/// A single stored field value.
///
/// Sequence fields on prototyped instances are stored as
/// [`FieldValue::PartialList`] deltas against the prototype's base sequence;
/// the full value is reconciled at read time (base minus removals, union
/// additions, then elevated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Literal(serde_json::Value),
    Reference(ResourceId),
    List(Vec<FieldValue>),
    PartialList {
        added: Vec<FieldValue>,
        removed: Vec<FieldValue>,
    },
}

impl FieldValue {
    pub fn reference(&self) -> Option<&ResourceId> {
        match self {
            Self::Reference(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<ResourceId> for FieldValue {
    fn from(id: ResourceId) -> Self {
        Self::Reference(id)
    }
}

// ─────────────────────────────────────────────
// Transient
// ─────────────────────────────────────────────

/// Which kind of snapshot this is. An explicit tagged variant: prototype
/// fallthrough is an owned id, not a live object pointer, so snapshots stay
/// cycle-free and freely clonable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransientKind {
    Materialized,
    Immaterial {
        /// The prototype that answers field lookups for this stand-in.
        prototype: ResourceId,
    },
}

/// An immutable denormalized snapshot of one resource at one state.
///
/// `id` and `type_name` are always present; everything else lives in
/// `fields`. Immaterial transients carry no fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    id: ResourceId,
    type_name: String,
    kind: TransientKind,
    fields: HashMap<String, FieldValue>,
}

impl Transient {
    /// A new materialized transient with no fields set yet.
    pub fn new(id: ResourceId, type_name: impl Into<String>) -> Self {
        Self { id, type_name: type_name.into(), kind: TransientKind::Materialized, fields: HashMap::new() }
    }

    /// An immaterial stand-in forwarding lookups to `prototype`.
    pub fn immaterial(id: ResourceId, type_name: impl Into<String>, prototype: ResourceId) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            kind: TransientKind::Immaterial { prototype },
            fields: HashMap::new(),
        }
    }

    /// An inactive stub: carries only its id (marked inactive).
    pub fn inactive_stub(id: ResourceId, type_name: impl Into<String>) -> Self {
        Self {
            id: id.as_inactive(),
            type_name: type_name.into(),
            kind: TransientKind::Materialized,
            fields: HashMap::new(),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> &TransientKind {
        &self.kind
    }

    pub fn is_immaterial(&self) -> bool {
        matches!(self.kind, TransientKind::Immaterial { .. })
    }

    /// The immaterial back-reference, if any.
    pub fn immaterial_prototype(&self) -> Option<&ResourceId> {
        match &self.kind {
            TransientKind::Immaterial { prototype } => Some(prototype),
            TransientKind::Materialized => None,
        }
    }

    /// A locally stored field. No prototype fallthrough happens here; that
    /// is the resolver's job.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> &HashMap<String, FieldValue> {
        &self.fields
    }

    // ── Construction-time mutation (pre-publication only) ──
    //
    // State hands out transients behind Arc; these are only callable while
    // the reducer still exclusively owns the snapshot being built.

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove_field(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    pub fn set_id(&mut self, id: ResourceId) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn immaterial_carries_no_fields() {
        let proto = ResourceId::random();
        let t = Transient::immaterial(ResourceId::random(), "Entity", proto.clone());
        assert!(t.is_immaterial());
        assert_eq!(t.immaterial_prototype(), Some(&proto));
        assert!(t.fields().is_empty());
    }

    #[test]
    fn inactive_stub_only_has_id() {
        let raw = Uuid::new_v4();
        let id = ResourceId::stub(raw, "valaa-aws:test");
        let t = Transient::inactive_stub(id, "ResourceStub");
        assert!(t.id().is_inactive());
        assert!(t.fields().is_empty());
    }

    #[test]
    fn local_lookup_does_not_fall_through() {
        let mut t = Transient::new(ResourceId::random(), "Entity");
        t.set_field("name", FieldValue::Literal(serde_json::json!("root")));
        assert!(t.get_field("name").is_some());
        assert!(t.get_field("owner").is_none());
    }
}
