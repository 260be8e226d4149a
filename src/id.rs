//! Resource identity and ghost paths.
//!
//! A [`ResourceId`] is the opaque handle everything else operates on. A
//! [`GhostPath`] encodes a ghost's full instantiation lineage back to a root
//! prototype as a structurally shared chain of steps:
//!
//! ```text
//! Root(a)  ──step──▶  (host_prototype = R, host = R#1, ghost = derive(a, R#1))
//! ```
//!
//! read as: "this step's resource is the ghost, inside host `R#1`, of the
//! prototype sub-resource `a`, reached by rebasing onto `R`". Ghost raw ids
//! are deterministic, so any two replicas derive identical identities for
//! the same instantiation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────
// Ghost id derivation
// ─────────────────────────────────────────────

/// Fixed UUIDv5 namespace for ghost raw-id derivation.
pub const GHOST_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6e, 0x1f, 0x42, 0x9a, 0x7d, 0x30, 0x45, 0xc2,
    0x91, 0x5b, 0x08, 0xaf, 0x3d, 0x6b, 0xe7, 0x14,
]);

/// Derive the raw id of the ghost of `ghost_prototype` inside `host`.
///
/// `derive(p, "instance", h)` — deterministic, so independently replaying
/// partitions agree on ghost identities without coordination.
pub fn derive_ghost_raw_id(ghost_prototype: Uuid, host: Uuid) -> Uuid {
    let material = format!("{ghost_prototype} instance {host}");
    Uuid::new_v5(&GHOST_ID_NAMESPACE, material.as_bytes())
}

// ─────────────────────────────────────────────
// GhostPath
// ─────────────────────────────────────────────

/// One step of a ghost path.
///
/// The base step names a root prototype; every subsequent step is an
/// instantiation boundary. The `host` is carried as a full [`ResourceId`]
/// (not just a raw id) so that nested ghosts can reach their host's own
/// lineage without consulting state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GhostStep {
    Root {
        prototype_raw_id: Uuid,
    },
    Instance {
        host_prototype_raw_id: Uuid,
        host: ResourceId,
        ghost_raw_id: Uuid,
    },
}

/// An immutable, structurally shared instantiation lineage.
///
/// Paths form a singly linked chain toward the root; extending a path never
/// copies its ancestry. A path is a *ghost* path iff it has at least one
/// step beyond the base.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GhostPath {
    step: GhostStep,
    previous: Option<Arc<GhostPath>>,
}

impl GhostPath {
    /// A base path naming a root prototype.
    pub fn new_root(prototype_raw_id: Uuid) -> Arc<Self> {
        Arc::new(Self { step: GhostStep::Root { prototype_raw_id }, previous: None })
    }

    /// Extend this path across one instantiation boundary.
    ///
    /// The new head is the ghost, inside `host`, of this path's head;
    /// its raw id is derived deterministically.
    pub fn with_instance_step(
        self: &Arc<Self>,
        host_prototype_raw_id: Uuid,
        host: ResourceId,
    ) -> Arc<Self> {
        let ghost_raw_id = derive_ghost_raw_id(self.head_raw_id(), host.raw_id());
        Arc::new(Self {
            step: GhostStep::Instance { host_prototype_raw_id, host, ghost_raw_id },
            previous: Some(Arc::clone(self)),
        })
    }

    /// The raw id of this path's terminal resource (ghost id for instance
    /// steps, prototype id for the base).
    pub fn head_raw_id(&self) -> Uuid {
        match &self.step {
            GhostStep::Root { prototype_raw_id } => *prototype_raw_id,
            GhostStep::Instance { ghost_raw_id, .. } => *ghost_raw_id,
        }
    }

    /// The step one hop toward the root, if any. For an instance step the
    /// previous path names the head's *ghost prototype*.
    pub fn previous_step(&self) -> Option<&Arc<GhostPath>> {
        self.previous.as_ref()
    }

    /// True iff this path has at least one instantiation step.
    pub fn is_ghost(&self) -> bool {
        matches!(self.step, GhostStep::Instance { .. })
    }

    /// Number of instantiation steps between head and root.
    pub fn ghost_depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self;
        while let GhostStep::Instance { .. } = cursor.step {
            depth += 1;
            match &cursor.previous {
                Some(prev) => cursor = prev,
                None => break,
            }
        }
        depth
    }

    /// The root prototype raw id at the base of the chain.
    pub fn root_raw_id(&self) -> Uuid {
        let mut cursor = self;
        while let Some(prev) = &cursor.previous {
            cursor = prev;
        }
        match cursor.step {
            GhostStep::Root { prototype_raw_id } => prototype_raw_id,
            // The base step of a well-formed chain is always Root; an
            // Instance base can only be built by deserializing a truncated
            // chain, in which case its ghost id is the closest root we have.
            GhostStep::Instance { ghost_raw_id, .. } => ghost_raw_id,
        }
    }

    /// The host of the head step (`None` for the base step).
    pub fn host(&self) -> Option<&ResourceId> {
        match &self.step {
            GhostStep::Instance { host, .. } => Some(host),
            GhostStep::Root { .. } => None,
        }
    }

    /// The host prototype raw id of the head step (`None` for the base step).
    pub fn host_prototype_raw_id(&self) -> Option<Uuid> {
        match &self.step {
            GhostStep::Instance { host_prototype_raw_id, .. } => Some(*host_prototype_raw_id),
            GhostStep::Root { .. } => None,
        }
    }

    /// All path nodes ordered root → head.
    pub fn steps_from_root(self: &Arc<Self>) -> Vec<Arc<GhostPath>> {
        let mut steps = Vec::with_capacity(self.ghost_depth() + 1);
        let mut cursor = Some(Arc::clone(self));
        while let Some(node) = cursor {
            cursor = node.previous.clone();
            steps.push(node);
        }
        steps.reverse();
        steps
    }

    /// Canonicalize this path against `canonical`: if a structurally equal
    /// node exists anywhere along `canonical`'s chain, return that shared
    /// node so cached sub-paths keep pointing at one canonical instance.
    pub fn canonicalize_within(self: &Arc<Self>, canonical: &Arc<GhostPath>) -> Arc<GhostPath> {
        let mut cursor = Some(canonical);
        while let Some(node) = cursor {
            if Arc::ptr_eq(node, self) || **node == **self {
                return Arc::clone(node);
            }
            cursor = node.previous.as_ref();
        }
        Arc::clone(self)
    }
}

impl fmt::Display for GhostPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prev) = &self.previous {
            write!(f, "{prev}/")?;
        }
        match &self.step {
            GhostStep::Root { prototype_raw_id } => write!(f, "{prototype_raw_id}"),
            GhostStep::Instance { host, ghost_raw_id, .. } => {
                write!(f, "@{}:{}", host.raw_id(), ghost_raw_id)
            }
        }
    }
}

// ─────────────────────────────────────────────
// ResourceId
// ─────────────────────────────────────────────

/// An opaque, immutable resource reference.
///
/// Two ids with the same `raw_id` but different `coupled_field` / ghost-path
/// context are **not** interchangeable for field aliasing purposes but **are**
/// the same underlying resource — compare with [`ResourceId::is_same_resource`]
/// when identity of the referent is what matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    raw_id: Uuid,
    /// Names the remote end of a bidirectional reference, for coupling
    /// bookkeeping. Not part of resource identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coupled_field: Option<String>,
    /// URI of the top-level event log that owns this resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ghost_path: Option<Arc<GhostPath>>,
    /// The resource is known to exist but its owning partition is not
    /// connected.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    inactive: bool,
}

impl ResourceId {
    /// A plain (non-ghost, active) id.
    pub fn new(raw_id: Uuid) -> Self {
        Self { raw_id, coupled_field: None, partition_uri: None, ghost_path: None, inactive: false }
    }

    /// A fresh random id.
    pub fn random() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// An inactive stub for a resource whose partition is not connected.
    pub fn stub(raw_id: Uuid, partition_uri: impl Into<String>) -> Self {
        Self {
            raw_id,
            coupled_field: None,
            partition_uri: Some(partition_uri.into()),
            ghost_path: None,
            inactive: true,
        }
    }

    pub fn raw_id(&self) -> Uuid {
        self.raw_id
    }

    pub fn coupled_field(&self) -> Option<&str> {
        self.coupled_field.as_deref()
    }

    pub fn partition_uri(&self) -> Option<&str> {
        self.partition_uri.as_deref()
    }

    pub fn ghost_path(&self) -> Option<&Arc<GhostPath>> {
        self.ghost_path.as_ref()
    }

    pub fn is_inactive(&self) -> bool {
        self.inactive
    }

    /// True iff this id addresses a ghost (its path has an instance step).
    pub fn is_ghost(&self) -> bool {
        self.ghost_path.as_ref().is_some_and(|p| p.is_ghost())
    }

    /// Same underlying resource, regardless of coupling / path context.
    pub fn is_same_resource(&self, other: &ResourceId) -> bool {
        self.raw_id == other.raw_id
    }

    // ── Builders (ids are immutable values; these return copies) ──

    pub fn with_coupled_field(mut self, coupled_field: impl Into<String>) -> Self {
        self.coupled_field = Some(coupled_field.into());
        self
    }

    pub fn with_partition_uri(mut self, partition_uri: impl Into<String>) -> Self {
        self.partition_uri = Some(partition_uri.into());
        self
    }

    pub fn with_ghost_path(mut self, ghost_path: Arc<GhostPath>) -> Self {
        debug_assert_eq!(ghost_path.head_raw_id(), self.raw_id, "path head must match raw id");
        self.ghost_path = Some(ghost_path);
        self
    }

    pub fn as_inactive(mut self) -> Self {
        self.inactive = true;
        self
    }

    pub fn as_active(mut self) -> Self {
        self.inactive = false;
        self
    }

    /// The id addressed by a ghost path, carrying the path.
    pub fn from_ghost_path(ghost_path: Arc<GhostPath>) -> Self {
        Self {
            raw_id: ghost_path.head_raw_id(),
            coupled_field: None,
            partition_uri: None,
            ghost_path: Some(ghost_path),
            inactive: false,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw_id)?;
        if self.inactive {
            write!(f, "(inactive)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let proto = Uuid::new_v4();
        let host = Uuid::new_v4();
        assert_eq!(derive_ghost_raw_id(proto, host), derive_ghost_raw_id(proto, host));
        assert_ne!(derive_ghost_raw_id(proto, host), derive_ghost_raw_id(host, proto));
        assert_ne!(derive_ghost_raw_id(proto, host), proto);
    }

    #[test]
    fn root_path_is_not_a_ghost() {
        let path = GhostPath::new_root(Uuid::new_v4());
        assert!(!path.is_ghost());
        assert_eq!(path.ghost_depth(), 0);
        assert!(path.previous_step().is_none());
    }

    #[test]
    fn instance_step_derives_head() {
        let proto = Uuid::new_v4();
        let host_proto = Uuid::new_v4();
        let host = ResourceId::random();

        let base = GhostPath::new_root(proto);
        let path = base.with_instance_step(host_proto, host.clone());

        assert!(path.is_ghost());
        assert_eq!(path.ghost_depth(), 1);
        assert_eq!(path.head_raw_id(), derive_ghost_raw_id(proto, host.raw_id()));
        assert_eq!(path.root_raw_id(), proto);
        assert!(Arc::ptr_eq(path.previous_step().unwrap(), &base));
    }

    #[test]
    fn steps_from_root_is_ordered() {
        let proto = Uuid::new_v4();
        let base = GhostPath::new_root(proto);
        let mid = base.with_instance_step(Uuid::new_v4(), ResourceId::random());
        let head = mid.with_instance_step(Uuid::new_v4(), ResourceId::random());

        let steps = head.steps_from_root();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].head_raw_id(), proto);
        assert_eq!(steps[2].head_raw_id(), head.head_raw_id());
    }

    #[test]
    fn canonicalize_reuses_shared_nodes() {
        let base = GhostPath::new_root(Uuid::new_v4());
        let host = ResourceId::random();
        let host_proto = Uuid::new_v4();

        // Structurally equal but separately allocated chain.
        let other_base = GhostPath::new_root(base.root_raw_id());
        let canonical = base.with_instance_step(host_proto, host.clone());
        let stray = other_base.with_instance_step(host_proto, host);

        let canonicalized = stray.canonicalize_within(&canonical);
        assert!(Arc::ptr_eq(&canonicalized, &canonical));
    }

    #[test]
    fn ids_with_coupling_context_are_same_resource() {
        let raw = Uuid::new_v4();
        let a = ResourceId::new(raw);
        let b = ResourceId::new(raw).with_coupled_field("ownlings");
        assert_ne!(a, b);
        assert!(a.is_same_resource(&b));
    }

    #[test]
    fn id_serde_round_trip() {
        let base = GhostPath::new_root(Uuid::new_v4());
        let id = ResourceId::from_ghost_path(
            base.with_instance_step(Uuid::new_v4(), ResourceId::random()),
        )
        .with_partition_uri("valaa-memory:");

        let json = serde_json::to_string(&id).unwrap();
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert!(back.is_ghost());
    }
}
