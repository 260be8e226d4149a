//! Field elevation across instantiation boundaries.
//!
//! A field read on resource X may, via the prototype chain, bottom out on a
//! value stored on some ancestor prototype P. A resource reference found
//! there was written relative to P's space and must be rewritten
//! ("elevated") to the space of X's instance before being returned, so that
//! "this ghost's child" resolves to the corresponding ghost-of-child rather
//! than the literal prototype child.
//!
//! An [`Elevation`] captures the instantiation boundaries one read crossed
//! — ordered deepest-first, each hop a `(prototype, instance)` pair — and
//! memoizes the per-target translation, since elevation recursion revisits
//! the same references across sibling fields.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::GraphError;
use crate::id::{GhostPath, ResourceId};
use crate::resolver::{ResolveOptions, Resolver};
use crate::schema::{FIELD_OWNER, TYPE_RESOURCE_STUB};
use crate::transient::FieldValue;

// ─────────────────────────────────────────────
// Elevation
// ─────────────────────────────────────────────

/// A lazy, memoizing translation from references in a prototype's space to
/// the equivalent references in an instance's space.
///
/// Scoped to one resolution call; never outlives the resolver it borrows.
pub struct Elevation<'r, 'a> {
    resolver: &'r Resolver<'a>,
    /// Instantiation boundaries to carry the reference across, ordered
    /// deepest (closest to the source prototype) first. Each hop elevates
    /// out of `prototype`'s space into `instance`'s space.
    hops: Vec<(ResourceId, ResourceId)>,
    /// target raw id → fully elevated id.
    memo: HashMap<Uuid, ResourceId>,
}

impl<'r, 'a> Elevation<'r, 'a> {
    pub fn new(resolver: &'r Resolver<'a>, hops: Vec<(ResourceId, ResourceId)>) -> Self {
        Self { resolver, hops, memo: HashMap::new() }
    }

    /// Build the hop list from a pure ghost-path pair: every instance step
    /// of `instance_path` not shared with `base_path` becomes one hop.
    pub fn from_paths(
        resolver: &'r Resolver<'a>,
        base_path: &std::sync::Arc<GhostPath>,
        instance_path: &std::sync::Arc<GhostPath>,
    ) -> Self {
        let base_nodes = base_path.steps_from_root();
        let instance_nodes = instance_path.steps_from_root();

        let mut shared = 0;
        while shared < base_nodes.len()
            && shared < instance_nodes.len()
            && *base_nodes[shared] == *instance_nodes[shared]
        {
            shared += 1;
        }

        let mut hops = Vec::new();
        for node in &instance_nodes[shared..] {
            if let (Some(host_prototype), Some(host)) =
                (node.host_prototype_raw_id(), node.host())
            {
                hops.push((ResourceId::new(host_prototype), host.clone()));
            }
        }
        Self::new(resolver, hops)
    }

    /// Elevate one field value. Literals pass through; references and list
    /// entries are elevated individually.
    pub fn elevate_value(&mut self, value: &FieldValue) -> Result<FieldValue, GraphError> {
        match value {
            FieldValue::Reference(id) => Ok(FieldValue::Reference(self.elevate_reference(id)?)),
            FieldValue::List(entries) => {
                let mut elevated = Vec::with_capacity(entries.len());
                for entry in entries {
                    elevated.push(self.elevate_value(entry)?);
                }
                Ok(FieldValue::List(elevated))
            }
            FieldValue::PartialList { added, removed } => {
                let mut elevated_added = Vec::with_capacity(added.len());
                for entry in added {
                    elevated_added.push(self.elevate_value(entry)?);
                }
                let mut elevated_removed = Vec::with_capacity(removed.len());
                for entry in removed {
                    elevated_removed.push(self.elevate_value(entry)?);
                }
                Ok(FieldValue::PartialList { added: elevated_added, removed: elevated_removed })
            }
            FieldValue::Null | FieldValue::Literal(_) => Ok(value.clone()),
        }
    }

    /// Elevate one reference, consulting the memo first.
    ///
    /// Inactive references get no elevation: an inactive reference is
    /// assumed external to both base and instance and thus unambiguous.
    pub fn elevate_reference(&mut self, id: &ResourceId) -> Result<ResourceId, GraphError> {
        if let Some(elevated) = self.memo.get(&id.raw_id()) {
            return Ok(elevated.clone());
        }
        if let Some(resolved) =
            self.resolver.resolve(id, TYPE_RESOURCE_STUB, ResolveOptions::soft())?
        {
            if resolved.id().is_inactive() {
                return Ok(id.clone());
            }
        }
        let elevated = self.elevate_object_id(id)?;
        self.memo.insert(id.raw_id(), elevated.clone());
        Ok(elevated)
    }

    /// The core algorithm: carry `id` across each unconsumed instantiation
    /// boundary in turn. Terminates because every iteration consumes
    /// exactly one hop of the remaining elevation distance.
    fn elevate_object_id(&mut self, id: &ResourceId) -> Result<ResourceId, GraphError> {
        let mut target = id.clone();
        for index in 0..self.hops.len() {
            let (prototype, instance) = self.hops[index].clone();
            target = self.elevate_across(target, &prototype, &instance)?;
        }
        Ok(target)
    }

    /// Elevate `target` out of `prototype`'s space into `instance`'s space.
    ///
    /// Walks owners of `target` outward; only if some owner *is* the
    /// instantiated prototype does the reference live inside the
    /// instantiation and need rewriting. Anything else is external and
    /// passes through unchanged.
    fn elevate_across(
        &self,
        target: ResourceId,
        prototype: &ResourceId,
        instance: &ResourceId,
    ) -> Result<ResourceId, GraphError> {
        let mut inside_instantiation = false;
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut cursor = Some(target.clone());
        while let Some(owner) = cursor {
            if owner.raw_id() == prototype.raw_id() {
                inside_instantiation = true;
                break;
            }
            if !seen.insert(owner.raw_id()) {
                return Err(GraphError::InvariantViolation(format!(
                    "ownership cycle while elevating {target} across {prototype}"
                )));
            }
            cursor = self.owner_of(&owner)?;
        }
        if !inside_instantiation {
            return Ok(target);
        }

        // Target and prototype coincide: the elevated form is the host
        // instance itself, not a derived ghost.
        if target.raw_id() == prototype.raw_id() {
            return Ok(instance.clone());
        }

        let base_path = target
            .ghost_path()
            .cloned()
            .unwrap_or_else(|| GhostPath::new_root(target.raw_id()));
        let elevated_path =
            base_path.with_instance_step(prototype.raw_id(), instance.clone());
        Ok(ResourceId::from_ghost_path(elevated_path))
    }

    /// One hop up the ownership tree: the local `owner` field if stored,
    /// else the ghost-path host, else the immaterial prototype's owner.
    fn owner_of(&self, id: &ResourceId) -> Result<Option<ResourceId>, GraphError> {
        let Some(transient) =
            self.resolver.resolve(id, TYPE_RESOURCE_STUB, ResolveOptions::soft())?
        else {
            return Ok(None);
        };
        if let Some(owner) = transient.get_field(FIELD_OWNER).and_then(|v| v.reference()) {
            return Ok(Some(owner.clone()));
        }
        if let Some(host) = id.ghost_path().and_then(|p| p.host()) {
            return Ok(Some(host.clone()));
        }
        if let Some(prototype) = transient.immaterial_prototype() {
            return self.owner_of(&prototype.clone());
        }
        Ok(None)
    }
}
