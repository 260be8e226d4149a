//! Ghost-aware resource resolution.
//!
//! A [`Resolver`] borrows one immutable [`State`] and maps opaque
//! [`ResourceId`]s to [`Transient`] snapshots against it. Resolution never
//! mutates state: when a ghost has no concrete entry the resolver
//! *synthesizes* an immaterial stand-in whose field lookups fall through to
//! the most-inherited materialized ancestor along the ghost path.
//!
//! ## Resolution order
//!
//! 1. Probe `state[type_hint][raw_id]`, following one interface redirect.
//! 2. Hit → the materialized case, done.
//! 3. Miss + ghost path → walk `previous_step()` toward the root until a
//!    materialized ancestor is found; synthesize an immaterial transient
//!    backed by it.
//! 4. Walk exhausted → hard [`GraphError::GhostPathExhausted`] when
//!    required, soft miss otherwise.
//! 5. No entry anywhere + the id names a disconnected partition → bind an
//!    **inactive stub** instead of failing. The only case where "not found"
//!    is not an error.

use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use crate::elevate::Elevation;
use crate::error::{GraphError, ResultExt};
use crate::id::ResourceId;
use crate::schema::{
    SchemaRegistry, FIELD_GHOST_PROTOTYPE, FIELD_ID, FIELD_PROTOTYPE, FIELD_TYPE_NAME,
    TYPE_RESOURCE, TYPE_RESOURCE_STUB,
};
use crate::state::State;
use crate::transient::{FieldValue, Transient};

// ─────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────

/// Knobs for one [`Resolver::resolve`] call.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Treat "not found" as a hard error instead of `Ok(None)`.
    pub require: bool,
    /// Permit the ghost-path ancestor walk (step 3).
    pub allow_ghost_lookup: bool,
}

impl ResolveOptions {
    pub fn soft() -> Self {
        Self { require: false, allow_ghost_lookup: true }
    }

    pub fn require() -> Self {
        Self { require: true, allow_ghost_lookup: true }
    }

    /// Concrete lookup only: no ghost-path walk, no immaterial synthesis.
    pub fn concrete() -> Self {
        Self { require: false, allow_ghost_lookup: false }
    }
}

// ─────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────

/// Maps ids to transients against one immutable state generation.
///
/// All scratch data is scoped to a single call; a `Resolver` itself is just
/// a pair of borrows and is free to construct per reduction step.
pub struct Resolver<'a> {
    state: &'a State,
    schema: &'a SchemaRegistry,
}

impl<'a> Resolver<'a> {
    pub fn new(state: &'a State, schema: &'a SchemaRegistry) -> Self {
        Self { state, schema }
    }

    pub fn state(&self) -> &'a State {
        self.state
    }

    pub fn schema(&self) -> &'a SchemaRegistry {
        self.schema
    }

    /// Resolve `id` to a transient. See the module doc for the algorithm.
    pub fn resolve(
        &self,
        id: &ResourceId,
        type_hint: &str,
        options: ResolveOptions,
    ) -> Result<Option<Arc<Transient>>, GraphError> {
        // Step 1–2: materialized case (probe the hint table, then the
        // universal stub table for ids living outside the hinted type).
        if let Some(found) = self.lookup_concrete(type_hint, id.raw_id()) {
            return Ok(Some(Arc::clone(found)));
        }

        // Step 3–4: ghost-path ancestor walk.
        if options.allow_ghost_lookup {
            if let Some(path) = id.ghost_path().filter(|p| p.is_ghost()) {
                let mut cursor = path.previous_step();
                while let Some(ancestor) = cursor {
                    if let Some(found) =
                        self.lookup_concrete(TYPE_RESOURCE_STUB, ancestor.head_raw_id())
                    {
                        return Ok(Some(Arc::new(self.synthesize_immaterial(id, path, found))));
                    }
                    cursor = ancestor.previous_step();
                }
                if options.require {
                    return Err(GraphError::GhostPathExhausted { raw_id: id.raw_id() });
                }
            }
        }

        // Step 5: inactive stub binding for disconnected partitions.
        if id.partition_uri().is_some() {
            let stub = Transient::inactive_stub(id.clone(), TYPE_RESOURCE_STUB);
            return Ok(Some(Arc::new(stub)));
        }

        if options.require {
            return Err(GraphError::UnresolvedReference {
                raw_id: id.raw_id(),
                type_hint: type_hint.to_string(),
            });
        }
        Ok(None)
    }

    /// [`Resolver::resolve`] in require mode, with the `Option` layer
    /// flattened away (require-mode resolution never misses softly).
    pub fn require(
        &self,
        id: &ResourceId,
        type_hint: &str,
    ) -> Result<Arc<Transient>, GraphError> {
        match self.resolve(id, type_hint, ResolveOptions::require())? {
            Some(transient) => Ok(transient),
            None => Err(GraphError::UnresolvedReference {
                raw_id: id.raw_id(),
                type_hint: type_hint.to_string(),
            }),
        }
    }

    /// Resolve and return the *canonical* id taken from the resolved
    /// transient's own `id` field, so that afterwards strict value equality
    /// can be used for id comparisons within one state generation.
    ///
    /// Required before storing any reference into state: unbound references
    /// risk dangling or duplicate-identity bugs.
    pub fn bind_object_id(
        &self,
        id: &ResourceId,
        type_hint: &str,
    ) -> Result<ResourceId, GraphError> {
        let transient =
            self.require(id, type_hint).within(|| format!("binding object id {id}"))?;
        let mut canonical = transient.id().clone();
        // Coupling context is caller-side; the canonical id never carries it.
        if let Some(coupled) = id.coupled_field() {
            canonical = canonical.with_coupled_field(coupled);
        }
        Ok(canonical)
    }

    /// Concrete-entry lookup by raw id: the ghost-path walk and immaterial
    /// synthesis never happen here.
    pub fn concrete_of(&self, raw_id: Uuid) -> Option<&'a Arc<Transient>> {
        self.lookup_concrete(TYPE_RESOURCE_STUB, raw_id)
    }

    /// Probe one table and follow at most one redirect, then fall back to
    /// the universal stub table (covers inactive stubs installed by the
    /// reducer).
    fn lookup_concrete(&self, type_hint: &str, raw_id: Uuid) -> Option<&'a Arc<Transient>> {
        self.state
            .transient(type_hint, raw_id)
            .or_else(|| self.state.transient(TYPE_RESOURCE_STUB, raw_id))
            .or_else(|| self.state.transient(TYPE_RESOURCE, raw_id))
    }

    /// Step 4 synthesis: an immaterial stand-in for `id` whose prototype
    /// back-reference is the found ancestor, with the ancestor's cached
    /// ghost path rebased onto the caller's canonical path instance.
    fn synthesize_immaterial(
        &self,
        id: &ResourceId,
        path: &Arc<crate::id::GhostPath>,
        ancestor: &Arc<Transient>,
    ) -> Transient {
        let mut prototype = ancestor.id().clone();
        if let Some(ancestor_path) = prototype.ghost_path() {
            let rebased = ancestor_path.canonicalize_within(path);
            if !Arc::ptr_eq(&rebased, ancestor_path) {
                prototype = prototype.clone().with_ghost_path(rebased);
            }
        }
        trace!(ghost = %id, prototype = %prototype, "synthesizing immaterial transient");
        Transient::immaterial(id.clone(), ancestor.type_name(), prototype)
    }

    // ── Prototype-chain field reads ─────────────────────

    /// The next prototype-chain hop above `transient`, if any: the
    /// immaterial back-reference, else `ghostPrototype`, else `prototype`.
    /// Always an explicit owned id, never a live pointer.
    pub fn prototype_of(&self, transient: &Transient) -> Option<ResourceId> {
        if let Some(prototype) = transient.immaterial_prototype() {
            return Some(prototype.clone());
        }
        transient
            .get_field(FIELD_GHOST_PROTOTYPE)
            .and_then(|v| v.reference().cloned())
            .or_else(|| transient.get_field(FIELD_PROTOTYPE).and_then(|v| v.reference().cloned()))
    }

    /// Read one field of `id`, walking the prototype chain and elevating
    /// any inherited reference into `id`'s instance space.
    ///
    /// A value found directly on the resolved transient is returned as-is,
    /// unelevated — elevation only applies to values discovered by walking
    /// *up* the chain.
    pub fn read_field(
        &self,
        id: &ResourceId,
        field_name: &str,
    ) -> Result<Option<FieldValue>, GraphError> {
        let start = self
            .require(id, TYPE_RESOURCE_STUB)
            .within(|| format!("reading field '{field_name}' of {id}"))?;

        // The two always-present keys need no chain walk.
        if field_name == FIELD_ID {
            return Ok(Some(FieldValue::Reference(start.id().clone())));
        }
        if field_name == FIELD_TYPE_NAME {
            return Ok(Some(FieldValue::Literal(serde_json::json!(start.type_name()))));
        }

        let descriptor = self.schema.field(start.type_name(), field_name);
        let resolved_name = descriptor.map_or(field_name, |d| d.name.as_str());
        // Fields outside the schema are still sequences if they are locally
        // stored as one (a delta layer must reconcile, never leak raw).
        let is_sequence = descriptor.is_some_and(|d| d.is_sequence)
            || matches!(
                start.get_field(resolved_name),
                Some(FieldValue::List(_) | FieldValue::PartialList { .. })
            );

        if is_sequence {
            return self.read_sequence_field(id, &start, resolved_name);
        }

        // Chain walk: record each (prototype, instance) hop so elevation
        // knows the instantiation boundaries the read crossed.
        let mut hops: Vec<(ResourceId, ResourceId)> = Vec::new();
        let mut current = start;
        loop {
            if let Some(value) = current.get_field(resolved_name) {
                if hops.is_empty() {
                    // Direct, non-inherited read.
                    return Ok(Some(value.clone()));
                }
                // Hops were collected reader-first; elevation consumes them
                // source-first.
                let mut elevation = Elevation::new(self, hops.into_iter().rev().collect());
                return Ok(Some(elevation.elevate_value(value)?));
            }
            match self.prototype_of(&current) {
                Some(prototype_id) => {
                    let prototype = self
                        .require(&prototype_id, TYPE_RESOURCE_STUB)
                        .within(|| format!("walking prototype chain of {id}"))?;
                    hops.push(chain_hop(&current, &prototype));
                    current = prototype;
                }
                None => break,
            }
        }

        // Nothing anywhere along the chain: schema default.
        Ok(descriptor.and_then(|d| d.default_value.clone()))
    }

    /// Sequence read: reconcile ADDED/REMOVED deltas against the
    /// prototype's base sequence (base minus removals, union additions),
    /// then elevate per entry according to the depth it was found at.
    fn read_sequence_field(
        &self,
        id: &ResourceId,
        start: &Arc<Transient>,
        field_name: &str,
    ) -> Result<Option<FieldValue>, GraphError> {
        // Gather the delta layers top-down until a full base list is found.
        let mut hops: Vec<(ResourceId, ResourceId)> = Vec::new();
        let mut layers: Vec<(FieldValue, usize)> = Vec::new();
        let mut current = Arc::clone(start);
        loop {
            match current.get_field(field_name) {
                Some(full @ FieldValue::List(_)) => {
                    layers.push((full.clone(), hops.len()));
                    break;
                }
                Some(partial @ FieldValue::PartialList { .. }) => {
                    layers.push((partial.clone(), hops.len()));
                }
                Some(other) => {
                    return Err(GraphError::InvariantViolation(format!(
                        "sequence field '{field_name}' of {id} holds a non-sequence value: {other:?}"
                    )));
                }
                None => {}
            }
            match self.prototype_of(&current) {
                Some(prototype_id) => {
                    let prototype = self
                        .require(&prototype_id, TYPE_RESOURCE_STUB)
                        .within(|| format!("walking prototype chain of {id}"))?;
                    hops.push(chain_hop(&current, &prototype));
                    current = prototype;
                }
                None => break,
            }
        }

        if layers.is_empty() {
            return Ok(Some(FieldValue::List(Vec::new())));
        }

        // Fold deepest-first: base, then each shallower delta layer.
        let mut entries: Vec<(FieldValue, usize)> = Vec::new();
        for (layer, depth) in layers.into_iter().rev() {
            match layer {
                FieldValue::List(values) => {
                    entries = values.into_iter().map(|v| (v, depth)).collect();
                }
                FieldValue::PartialList { added, removed } => {
                    entries.retain(|(v, _)| !removed.contains(v));
                    for value in added {
                        if !entries.iter().any(|(v, _)| *v == value) {
                            entries.push((value, depth));
                        }
                    }
                }
                _ => unreachable!("layers only collect list values"),
            }
        }

        // Elevate each surviving entry across the hops it was read through.
        let mut elevated = Vec::with_capacity(entries.len());
        for (value, depth) in entries {
            if depth == 0 {
                elevated.push(value);
            } else {
                let crossed = hops[..depth].iter().rev().cloned().collect();
                let mut elevation = Elevation::new(self, crossed);
                elevated.push(elevation.elevate_value(&value)?);
            }
        }
        Ok(Some(FieldValue::List(elevated)))
    }
}

/// The instantiation boundary one prototype-chain hop crosses.
///
/// A ghost's hop to its prototype crosses the instantiation step recorded
/// in its path, `(host_prototype, host)` — recording the `(prototype,
/// ghost)` pair there instead would make derived ghost identities depend
/// on which route a read took. Ghost identity must be a pure function of
/// `(target, instantiation host)`.
fn chain_hop(current: &Transient, prototype: &Transient) -> (ResourceId, ResourceId) {
    if let Some(path) = current.id().ghost_path().filter(|p| p.is_ghost()) {
        if let (Some(host_prototype), Some(host)) =
            (path.host_prototype_raw_id(), path.host())
        {
            return (ResourceId::new(host_prototype), host.clone());
        }
    }
    (prototype.id().clone(), current.id().clone())
}
