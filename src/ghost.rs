//! Ghost lifecycle: materialize / immaterialize action synthesis.
//!
//! Ghost states: **virtual** (no materialize ever issued) →
//! **immaterial-synthesized** (the resolver has produced a stand-in but
//! state has no entry) → **materialized** (state has a concrete entry) →
//! **destroyed** (terminal; re-virtualizing is not supported —
//! immaterialization is modeled as destruction).
//!
//! ## Ghostbuster invariant
//!
//! For any valid action log: replaying it with every ghost-instantiation
//! replaced by an equivalent deep-copy-of-prototype, after hoisting all of
//! a prototype's mutations to occur before any of its instantiations, must
//! produce an isomorphic final graph. A prototype mutation observably
//! interleaved *after* one of its instances diverged is undefined behavior,
//! not something to silently fix.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::action::Action;
use crate::error::GraphError;
use crate::id::{GhostPath, ResourceId};
use crate::resolver::{ResolveOptions, Resolver};
use crate::schema::{FIELD_GHOST_OWNER, FIELD_GHOST_OWNLINGS, FIELD_GHOST_PROTOTYPE, FIELD_MATERIALIZED_GHOSTS};
use crate::transient::FieldValue;

// ─────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────

/// Result of a materialization request.
#[derive(Debug)]
pub enum MaterializeOutcome {
    /// Target (or non-ghost) already has a concrete entry; nothing to do.
    AlreadyConcrete(ResourceId),
    /// The ghost's host partition has no materialized stub: the ghost is
    /// bound inactive instead of being speculatively created across a
    /// boundary the caller cannot observe.
    Inactive(ResourceId),
    /// One `CREATED` per unmaterialized ancestor plus the target itself,
    /// ordered ancestor-first (innermost last). Later creates reference
    /// earlier ones as prototype/owner.
    Create { actions: Vec<Action>, id: ResourceId },
}

/// Result of ensuring a ghost's *ancestors* exist, without creating the
/// ghost itself. Used by the creation handler, which issues the target's
/// own `CREATED` as the action being reduced.
#[derive(Debug)]
pub enum AncestorOutcome {
    /// The target already has a concrete entry.
    AlreadyConcrete(ResourceId),
    Inactive(ResourceId),
    Ready {
        /// Creates for unmaterialized ancestors, ancestor-first. May be
        /// empty.
        actions: Vec<Action>,
        /// Canonical id of the immediate ghost prototype.
        ghost_prototype: ResourceId,
        /// Canonical id of the host resource.
        ghost_owner: ResourceId,
        /// Concrete type the ghost inherits from its prototype.
        type_name: String,
    },
}

// ─────────────────────────────────────────────
// Materialization
// ─────────────────────────────────────────────

/// Synthesize the actions that materialize `ghost_path` and every
/// unmaterialized ancestor step, ancestor-first.
pub fn materialize(
    resolver: &Resolver<'_>,
    ghost_path: &Arc<GhostPath>,
) -> Result<MaterializeOutcome, GraphError> {
    let mut actions = Vec::new();
    match ensure(resolver, ghost_path, &mut actions)? {
        Ensured::Inactive(id) => Ok(MaterializeOutcome::Inactive(id)),
        Ensured::Bound { id, .. } => {
            if actions.is_empty() {
                Ok(MaterializeOutcome::AlreadyConcrete(id))
            } else {
                debug!(ghost = %id, creates = actions.len(), "materializing ghost path");
                Ok(MaterializeOutcome::Create { actions, id })
            }
        }
    }
}

/// Ensure every ancestor of `ghost_path` is materialized, leaving the head
/// itself to the caller.
pub fn materialize_ancestors(
    resolver: &Resolver<'_>,
    ghost_path: &Arc<GhostPath>,
) -> Result<AncestorOutcome, GraphError> {
    if let Some(existing) = resolver.concrete_of(ghost_path.head_raw_id()) {
        return Ok(AncestorOutcome::AlreadyConcrete(existing.id().clone()));
    }
    let Some(prototype_path) = ghost_path.previous_step() else {
        return Err(GraphError::InvariantViolation(format!(
            "cannot materialize ancestors of non-ghost path {ghost_path}"
        )));
    };

    let mut actions = Vec::new();
    let (ghost_prototype, type_name) = match ensure(resolver, prototype_path, &mut actions)? {
        Ensured::Inactive(id) => return Ok(AncestorOutcome::Inactive(id)),
        Ensured::Bound { id, type_name } => (id, type_name),
    };
    let ghost_owner = match ensure_host(resolver, ghost_path, &mut actions)? {
        Ensured::Inactive(id) => return Ok(AncestorOutcome::Inactive(id)),
        Ensured::Bound { id, .. } => id,
    };
    Ok(AncestorOutcome::Ready { actions, ghost_prototype, ghost_owner, type_name })
}

/// Look up the *concrete* resource (never the ghost-path lookup) and issue
/// a destroy if present. Idempotent: an already-immaterial or unknown
/// target is a no-op.
pub fn immaterialize(
    resolver: &Resolver<'_>,
    id: &ResourceId,
) -> Result<Option<Action>, GraphError> {
    match resolver.concrete_of(id.raw_id()) {
        Some(existing) => {
            debug!(ghost = %id, "immaterializing via destroy");
            Ok(Some(Action::Destroyed { id: existing.id().clone() }))
        }
        None => Ok(None),
    }
}

// ─────────────────────────────────────────────
// Internal recursion
// ─────────────────────────────────────────────

enum Ensured {
    Bound { id: ResourceId, type_name: String },
    Inactive(ResourceId),
}

/// Recursively ensure the resource addressed by `path` has (or will have,
/// via an action already queued in `actions`) a concrete entry, ancestors
/// first.
fn ensure(
    resolver: &Resolver<'_>,
    path: &Arc<GhostPath>,
    actions: &mut Vec<Action>,
) -> Result<Ensured, GraphError> {
    if let Some(existing) = resolver.concrete_of(path.head_raw_id()) {
        return Ok(Ensured::Bound {
            id: existing.id().clone(),
            type_name: existing.type_name().to_string(),
        });
    }

    let Some(prototype_path) = path.previous_step() else {
        // A base step with no concrete entry: the root prototype itself is
        // missing from this state.
        return Err(GraphError::UnresolvedReference {
            raw_id: path.head_raw_id(),
            type_hint: "ghost path root".to_string(),
        });
    };

    let (prototype_id, type_name) = match ensure(resolver, prototype_path, actions)? {
        inactive @ Ensured::Inactive(_) => return Ok(inactive),
        Ensured::Bound { id, type_name } => (id, type_name),
    };
    let host_id = match ensure_host(resolver, path, actions)? {
        inactive @ Ensured::Inactive(_) => return Ok(inactive),
        Ensured::Bound { id, .. } => id,
    };

    let ghost_id = ResourceId::from_ghost_path(Arc::clone(path));
    let mut initial_state = HashMap::new();
    initial_state.insert(
        FIELD_GHOST_PROTOTYPE.to_string(),
        FieldValue::Reference(prototype_id.with_coupled_field(FIELD_MATERIALIZED_GHOSTS)),
    );
    initial_state.insert(
        FIELD_GHOST_OWNER.to_string(),
        FieldValue::Reference(host_id.with_coupled_field(FIELD_GHOST_OWNLINGS)),
    );
    actions.push(Action::Created {
        id: ghost_id.clone(),
        type_name: type_name.clone(),
        pre_overrides: HashMap::new(),
        initial_state,
        // Ancestor creation is already being driven iteratively here; the
        // creation handler must not recurse into sub-materialization.
        no_sub_materialize: true,
    });
    Ok(Ensured::Bound { id: ghost_id, type_name })
}

/// Ensure the head step's host exists: concrete hit, nested-ghost
/// recursion, or inactive binding when the host's partition is
/// unobservable.
fn ensure_host(
    resolver: &Resolver<'_>,
    path: &Arc<GhostPath>,
    actions: &mut Vec<Action>,
) -> Result<Ensured, GraphError> {
    let Some(host) = path.host() else {
        return Err(GraphError::InvariantViolation(format!(
            "ghost path {path} has an instance step without a host"
        )));
    };

    if let Some(existing) = resolver.concrete_of(host.raw_id()) {
        return Ok(Ensured::Bound {
            id: existing.id().clone(),
            type_name: existing.type_name().to_string(),
        });
    }
    if let Some(host_path) = host.ghost_path().filter(|p| p.is_ghost()) {
        return ensure(resolver, host_path, actions);
    }

    match resolver.resolve(host, crate::schema::TYPE_RESOURCE_STUB, ResolveOptions::soft())? {
        Some(resolved) if !resolved.id().is_inactive() => Ok(Ensured::Bound {
            id: resolved.id().clone(),
            type_name: resolved.type_name().to_string(),
        }),
        // Host partition not connected: bind the whole ghost inactive.
        _ => Ok(Ensured::Inactive(ResourceId::from_ghost_path(Arc::clone(path)).as_inactive())),
    }
}
