//! The Bard — per-action reducer orchestrator.
//!
//! One inbound [`Command`] is reduced fully synchronously against one
//! immutable [`State`] snapshot:
//!
//! ```text
//! BeginStory → Reduce(root) → [Reduce(subpassage)]* → FinishStory → Commit
//! ```
//!
//! Reduction builds an audit [`Story`] tree: every action (root or nested —
//! a transaction member, a ghost materialization, a coupling side-effect)
//! gets its own [`Passage`] appended as a child of its caller, so outer
//! reductions compose without knowing their sub-structure. The scratch
//! state is private until `Commit`; a failed reduction leaves the committed
//! state untouched.
//!
//! Commands arriving without partition-routing metadata are *being
//! universalized*: certain failures (referential-integrity blocks,
//! incompletable owner chains) are hard errors. The same failures during
//! downstream replay are logged and suppressed — the remote log is
//! authoritative and must still be applied to avoid divergence.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::action::{Action, Command};
use crate::error::{GraphError, ResultExt};
use crate::ghost::{self, AncestorOutcome, MaterializeOutcome};
use crate::id::ResourceId;
use crate::resolver::{ResolveOptions, Resolver};
use crate::schema::{
    SchemaRegistry, FIELD_CONTENT_HASH, FIELD_GHOST_OWNER, FIELD_GHOST_OWNLINGS,
    FIELD_GHOST_PROTOTYPE, FIELD_MATERIALIZED_GHOSTS, FIELD_PARTITION_AUTHORITY, TYPE_BLOB,
    TYPE_RESOURCE, TYPE_RESOURCE_STUB,
};
use crate::state::State;
use crate::transient::{FieldValue, Transient};

// ─────────────────────────────────────────────
// Passage / Story
// ─────────────────────────────────────────────

/// Audit-trail node for one reduced action.
///
/// Created when the bard begins processing the action, frozen once its
/// reduction finishes, discarded after being forwarded downstream — never
/// persisted.
#[derive(Debug, Clone)]
pub struct Passage {
    /// The originating action, by delegation.
    pub action: Action,
    /// Child passages, in reduction order.
    pub passages: Vec<Passage>,
    /// Resources this passage actually touched.
    pub touched: Vec<ResourceId>,
    /// `(remote resource, field)` couplings actually updated, for live-query
    /// subscriptions downstream.
    pub updated_couplings: Vec<(ResourceId, String)>,
}

impl Passage {
    fn new(action: Action) -> Self {
        Self { action, passages: Vec::new(), touched: Vec::new(), updated_couplings: Vec::new() }
    }

    /// Depth-first iteration over this passage and all sub-passages.
    pub fn walk(&self) -> Vec<&Passage> {
        let mut out = vec![self];
        for child in &self.passages {
            out.extend(child.walk());
        }
        out
    }
}

/// The audit tree for one fully reduced command.
#[derive(Debug, Clone)]
pub struct Story {
    pub root: Passage,
    pub is_being_universalized: bool,
    /// The committed state this story was reduced against.
    pub pre_action_state: State,
}

// ─────────────────────────────────────────────
// Options / Bard
// ─────────────────────────────────────────────

/// Explicit reduction capabilities, bound to one embedding session.
#[derive(Debug, Clone)]
pub struct BardOptions {
    /// Emit `warn!` for violations suppressed during downstream replay.
    pub log_suppressed_violations: bool,
}

impl Default for BardOptions {
    fn default() -> Self {
        Self { log_suppressed_violations: true }
    }
}

/// The reducer orchestrator. Owns the schema for the session; borrows the
/// state only for the duration of one reduction.
pub struct Bard {
    schema: SchemaRegistry,
    options: BardOptions,
}

/// By-value reduction context threaded through handlers. One per story;
/// sub-passages ("apprentices") share it by mutable borrow rather than by
/// overwriting fields on a long-lived reducer object.
struct ReductionContext<'b> {
    schema: &'b SchemaRegistry,
    state: State,
    is_being_universalized: bool,
    /// Raw ids created earlier in this story (ghost materialization fan-in
    /// arrives at the same id through several paths).
    created_this_story: HashSet<Uuid>,
    /// Duplication batch: source raw id → duplicate raw id. Cross-references
    /// are remapped in a second pass once the whole batch exists.
    duplicated: HashMap<Uuid, Uuid>,
    /// Raw ids destroyed in this story; checked for orphaned references at
    /// finish.
    destroyed: HashSet<Uuid>,
}

impl<'b> ReductionContext<'b> {
    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.state, self.schema)
    }
}

impl Bard {
    pub fn new(schema: SchemaRegistry, options: BardOptions) -> Self {
        Self { schema, options }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Reduce one command against `state`, returning the new state and the
    /// story tree. On error the input state is untouched — intermediate
    /// states live only in the discarded scratch context.
    pub fn reduce(&self, state: &State, command: &Command) -> Result<(State, Story), GraphError> {
        let pre_action_state = state.clone();
        let mut ctx = ReductionContext {
            schema: &self.schema,
            state: state.clone(),
            is_being_universalized: command.is_being_universalized(),
            created_this_story: HashSet::new(),
            duplicated: HashMap::new(),
            destroyed: HashSet::new(),
        };

        let root = self.reduce_action(&mut ctx, command.action.clone())?;
        let root = self.finish_story(&mut ctx, root)?;

        debug!(
            kind = root.action.kind(),
            passages = root.walk().len(),
            universalized = ctx.is_being_universalized,
            "committed story"
        );
        Ok((
            ctx.state,
            Story { root, is_being_universalized: ctx.is_being_universalized, pre_action_state },
        ))
    }

    // ── Dispatch ──────────────────────────────────────

    fn reduce_action(
        &self,
        ctx: &mut ReductionContext<'_>,
        action: Action,
    ) -> Result<Passage, GraphError> {
        let kind = action.kind();
        let target = action.target().map(|t| t.to_string());
        let mut passage = Passage::new(action.clone());

        let result = match action {
            Action::Created { id, type_name, pre_overrides, initial_state, no_sub_materialize } => {
                self.reduce_created(
                    ctx,
                    &mut passage,
                    id,
                    type_name,
                    pre_overrides,
                    initial_state,
                    no_sub_materialize,
                )
            }
            Action::Duplicated { id, duplicate_of, initial_state } => {
                self.reduce_duplicated(ctx, &mut passage, id, duplicate_of, initial_state)
            }
            Action::Destroyed { id } => self.reduce_destroyed(ctx, &mut passage, id),
            Action::FieldsSet { id, sets, .. } => {
                self.reduce_fields_set(ctx, &mut passage, id, sets)
            }
            Action::AddedToFields { id, adds, .. } => {
                self.reduce_added_to(ctx, &mut passage, id, adds)
            }
            Action::RemovedFromFields { id, removes, .. } => {
                self.reduce_removed_from(ctx, &mut passage, id, removes)
            }
            Action::Transacted { actions } => {
                // Each member reduces with its own passage slot but shares
                // the story context.
                for sub in actions {
                    let child = self.reduce_action(ctx, sub)?;
                    passage.passages.push(child);
                }
                Ok(())
            }
        };

        result.within(|| match &target {
            Some(target) => format!("in {kind} of {target}"),
            None => format!("in {kind}"),
        })?;
        Ok(passage)
    }

    // ── CREATED / DUPLICATED ──────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn reduce_created(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: ResourceId,
        type_name: String,
        pre_overrides: HashMap<String, FieldValue>,
        initial_state: HashMap<String, FieldValue>,
        no_sub_materialize: bool,
    ) -> Result<(), GraphError> {
        let mut initial_state = initial_state;

        // A ghost-addressed create triggers ancestor materialization first,
        // unless this create was itself synthesized by that very process.
        if id.is_ghost() && !no_sub_materialize {
            let outcome = {
                let resolver = ctx.resolver();
                let path = id.ghost_path().cloned();
                match path {
                    Some(path) => Some(ghost::materialize_ancestors(&resolver, &path)?),
                    None => None,
                }
            };
            match outcome {
                Some(AncestorOutcome::Inactive(inactive_id)) => {
                    self.install_stub(ctx, &inactive_id);
                    passage.touched.push(inactive_id);
                    return Ok(());
                }
                Some(AncestorOutcome::Ready { actions, ghost_prototype, ghost_owner, .. }) => {
                    for sub in actions {
                        let child = self.reduce_action(ctx, sub)?;
                        passage.passages.push(child);
                    }
                    initial_state.entry(FIELD_GHOST_PROTOTYPE.to_string()).or_insert(
                        FieldValue::Reference(
                            ghost_prototype.with_coupled_field(FIELD_MATERIALIZED_GHOSTS),
                        ),
                    );
                    initial_state.entry(FIELD_GHOST_OWNER.to_string()).or_insert(
                        FieldValue::Reference(ghost_owner.with_coupled_field(FIELD_GHOST_OWNLINGS)),
                    );
                }
                Some(AncestorOutcome::AlreadyConcrete(_)) | None => {}
            }
        }

        // Collision handling.
        let raw_id = id.raw_id();
        let existing = ctx.resolver().concrete_of(raw_id).cloned();
        if let Some(existing) = existing {
            if existing.type_name() == TYPE_BLOB && type_name == TYPE_BLOB {
                // Immutable-content types re-create idempotently, provided
                // the content actually matches.
                let same_content = existing.get_field(FIELD_CONTENT_HASH)
                    == initial_state.get(FIELD_CONTENT_HASH);
                if same_content {
                    passage.touched.push(existing.id().clone());
                    return Ok(());
                }
                return Err(GraphError::DuplicateCreation { raw_id, type_name });
            }
            if ctx.created_this_story.contains(&raw_id) {
                // Ghost materialization fan-in within one story.
                passage.touched.push(existing.id().clone());
                return Ok(());
            }
            if existing.id().is_inactive() {
                // Inactive stub promoted to active.
                ctx.state.remove(TYPE_RESOURCE_STUB, raw_id);
            } else {
                return Err(GraphError::DuplicateCreation { raw_id, type_name });
            }
        }

        let descriptor = self.schema.instantiable(&type_name)?;

        // Interface table registration precedes field population.
        for interface in &descriptor.interfaces {
            ctx.state.set_redirect(interface, raw_id, &type_name);
        }

        // The transient exists (empty) before field population so coupling
        // updates triggered by its own fields can resolve it. Ghost-path
        // linkage is carried by the id itself.
        let canonical_id = id.clone().as_active();
        ctx.state.set_transient(&type_name, Transient::new(canonical_id.clone(), &type_name));
        ctx.created_this_story.insert(raw_id);

        // Pre-override fields, then initial-state fields.
        for (field, value) in pre_overrides {
            self.set_field_on(ctx, passage, &canonical_id, &type_name, &field, value)?;
        }
        for (field, value) in initial_state {
            self.set_field_on(ctx, passage, &canonical_id, &type_name, &field, value)?;
        }

        // Partition assignment from owner / partitionAuthorityURI.
        let canonical_id = self.assign_partition(ctx, &canonical_id, &type_name)?;

        // Default-value population, skipped entirely for instances with a
        // prototype (defaults are inherited).
        let created = ctx.resolver().concrete_of(raw_id).cloned();
        if let Some(created) = created {
            let has_prototype = ctx.resolver().prototype_of(&created).is_some();
            if !has_prototype {
                let defaults: Vec<(String, FieldValue)> = descriptor
                    .fields()
                    .filter(|f| !created.has_field(&f.name))
                    .filter_map(|f| f.default_value.clone().map(|v| (f.name.clone(), v)))
                    .collect();
                if !defaults.is_empty() {
                    self.mutate_transient(ctx, raw_id, |t| {
                        for (name, value) in defaults {
                            t.set_field(name, value);
                        }
                    })?;
                }
            }
        }

        passage.touched.push(canonical_id);
        Ok(())
    }

    fn reduce_duplicated(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: ResourceId,
        duplicate_of: ResourceId,
        initial_state: HashMap<String, FieldValue>,
    ) -> Result<(), GraphError> {
        let source = ctx.resolver().require(&duplicate_of, TYPE_RESOURCE_STUB)?;
        let type_name = source.type_name().to_string();
        let raw_id = id.raw_id();

        if ctx.resolver().concrete_of(raw_id).is_some() {
            return Err(GraphError::DuplicateCreation { raw_id, type_name });
        }
        let descriptor = self.schema.instantiable(&type_name)?;
        for interface in &descriptor.interfaces {
            ctx.state.set_redirect(interface, raw_id, &type_name);
        }

        let canonical_id = id.clone().as_active();
        ctx.state.set_transient(&type_name, Transient::new(canonical_id.clone(), &type_name));
        ctx.created_this_story.insert(raw_id);
        ctx.duplicated.insert(duplicate_of.raw_id(), raw_id);

        // Duplication-specific field copy. Coupled back-reference sequences
        // (ownlings, instances, materializedGhosts) are rebuilt by
        // couplings, not copied: the source's ownlings belong to the
        // source's children.
        let copied: Vec<(String, FieldValue)> = source
            .fields()
            .iter()
            .filter(|(name, _)| {
                !self
                    .schema
                    .field(&type_name, name)
                    .is_some_and(|d| d.is_sequence && d.coupled_field.is_some())
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for (field, value) in copied {
            self.set_field_on(ctx, passage, &canonical_id, &type_name, &field, value)?;
        }
        for (field, value) in initial_state {
            self.set_field_on(ctx, passage, &canonical_id, &type_name, &field, value)?;
        }

        let canonical_id = self.assign_partition(ctx, &canonical_id, &type_name)?;
        passage.touched.push(canonical_id);
        Ok(())
    }

    // ── DESTROYED ─────────────────────────────────────

    fn reduce_destroyed(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: ResourceId,
    ) -> Result<(), GraphError> {
        let existing = ctx.resolver().concrete_of(id.raw_id()).cloned();
        let Some(existing) = existing else {
            if id.is_ghost() {
                // Immaterialization of an already-virtual ghost: idempotent.
                return Ok(());
            }
            return Err(GraphError::UnresolvedReference {
                raw_id: id.raw_id(),
                type_hint: TYPE_RESOURCE.to_string(),
            });
        };
        let type_name = existing.type_name().to_string();
        let raw_id = existing.id().raw_id();

        // Owned sub-resources are destroyed first, as sub-passages.
        let mut ownlings: Vec<ResourceId> = Vec::new();
        for (field_name, value) in existing.fields() {
            let Some(desc) = self.schema.field(&type_name, field_name) else { continue };
            if !desc.is_composite {
                continue;
            }
            collect_references(value, &mut ownlings);
        }
        for ownling in ownlings {
            if ctx.destroyed.contains(&ownling.raw_id()) {
                continue;
            }
            let child = self.reduce_action(ctx, Action::Destroyed { id: ownling })?;
            passage.passages.push(child);
        }

        // Detach this resource's own couplings.
        for (field_name, value) in existing.fields().clone() {
            let Some(desc) = self.schema.field(&type_name, &field_name) else { continue };
            let Some(coupled) = desc.coupled_field.clone() else { continue };
            let mut remotes = Vec::new();
            collect_references(&value, &mut remotes);
            for remote in remotes {
                if ctx.destroyed.contains(&remote.raw_id()) {
                    continue;
                }
                self.remove_coupling(ctx, passage, &remote, &coupled, existing.id())?;
            }
        }

        ctx.state.remove(&type_name, raw_id);
        ctx.state.remove(TYPE_RESOURCE, raw_id);
        ctx.state.remove(TYPE_RESOURCE_STUB, raw_id);
        if let Some(descriptor) = self.schema.get(&type_name) {
            for interface in &descriptor.interfaces {
                ctx.state.remove(interface, raw_id);
            }
        }
        ctx.destroyed.insert(raw_id);
        passage.touched.push(existing.id().clone());
        Ok(())
    }

    // ── Field modification ────────────────────────────

    fn reduce_fields_set(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: ResourceId,
        sets: HashMap<String, FieldValue>,
    ) -> Result<(), GraphError> {
        let target = self.ensure_materialized(ctx, passage, &id)?;
        let type_name = self.concrete_type(ctx, &target)?;
        for (field, value) in sets {
            self.set_field_on(ctx, passage, &target, &type_name, &field, value)?;
        }
        passage.touched.push(target);
        Ok(())
    }

    fn reduce_added_to(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: ResourceId,
        adds: HashMap<String, Vec<FieldValue>>,
    ) -> Result<(), GraphError> {
        let target = self.ensure_materialized(ctx, passage, &id)?;
        let type_name = self.concrete_type(ctx, &target)?;

        for (field, entries) in adds {
            let descriptor = self.schema.field(&type_name, &field).cloned();
            let field = descriptor.as_ref().map_or(field.as_str(), |d| d.name.as_str()).to_string();
            let mut bound = Vec::with_capacity(entries.len());
            for entry in entries {
                bound.push(self.bind_value(ctx, entry)?);
            }

            let raw_id = target.raw_id();
            let has_prototype = {
                let resolver = ctx.resolver();
                match resolver.concrete_of(raw_id) {
                    Some(t) => resolver.prototype_of(t).is_some(),
                    None => false,
                }
            };
            let additions = bound.clone();
            self.mutate_transient(ctx, raw_id, move |t| match t.fields().get(&field).cloned() {
                Some(FieldValue::List(mut values)) => {
                    for value in additions {
                        if !values.contains(&value) {
                            values.push(value);
                        }
                    }
                    t.set_field(field, FieldValue::List(values));
                }
                Some(FieldValue::PartialList { mut added, mut removed }) => {
                    for value in additions {
                        removed.retain(|v| *v != value);
                        if !added.contains(&value) {
                            added.push(value);
                        }
                    }
                    t.set_field(field, FieldValue::PartialList { added, removed });
                }
                _ => {
                    // First local write: instances layer a delta over the
                    // inherited base sequence, plain resources own the list.
                    if has_prototype {
                        t.set_field(
                            field,
                            FieldValue::PartialList { added: additions, removed: Vec::new() },
                        );
                    } else {
                        t.set_field(field, FieldValue::List(additions));
                    }
                }
            })?;

            // Coupling: adding into a coupled sequence points each added
            // reference's singular side back here.
            if let Some(desc) = &descriptor {
                if let Some(coupled) = desc.coupled_field.clone() {
                    for value in &bound {
                        if let Some(remote) = value.reference() {
                            if !remote.is_inactive() {
                                self.add_coupling(ctx, passage, remote, &coupled, &target, &desc.name)?;
                            }
                        }
                    }
                }
            }
        }
        passage.touched.push(target);
        Ok(())
    }

    fn reduce_removed_from(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: ResourceId,
        removes: HashMap<String, Vec<FieldValue>>,
    ) -> Result<(), GraphError> {
        let target = self.ensure_materialized(ctx, passage, &id)?;
        let type_name = self.concrete_type(ctx, &target)?;

        for (field, entries) in removes {
            let descriptor = self.schema.field(&type_name, &field).cloned();
            let field = descriptor.as_ref().map_or(field.as_str(), |d| d.name.as_str()).to_string();
            let mut bound = Vec::with_capacity(entries.len());
            for entry in entries {
                bound.push(self.bind_value(ctx, entry)?);
            }

            let raw_id = target.raw_id();
            let has_prototype = {
                let resolver = ctx.resolver();
                match resolver.concrete_of(raw_id) {
                    Some(t) => resolver.prototype_of(t).is_some(),
                    None => false,
                }
            };
            let removals = bound.clone();
            self.mutate_transient(ctx, raw_id, move |t| match t.fields().get(&field).cloned() {
                Some(FieldValue::List(mut values)) => {
                    values.retain(|v| !removals.contains(v));
                    t.set_field(field, FieldValue::List(values));
                }
                Some(FieldValue::PartialList { mut added, mut removed }) => {
                    added.retain(|v| !removals.contains(v));
                    for value in removals {
                        if !removed.contains(&value) {
                            removed.push(value);
                        }
                    }
                    t.set_field(field, FieldValue::PartialList { added, removed });
                }
                _ => {
                    if has_prototype {
                        t.set_field(
                            field,
                            FieldValue::PartialList { added: Vec::new(), removed: removals },
                        );
                    }
                    // Removing from an absent sequence on a plain resource
                    // is a no-op.
                }
            })?;

            if let Some(desc) = &descriptor {
                if let Some(coupled) = desc.coupled_field.clone() {
                    for value in &bound {
                        if let Some(remote) = value.reference() {
                            self.remove_coupling(ctx, passage, remote, &coupled, &target)?;
                        }
                    }
                }
            }
        }
        passage.touched.push(target);
        Ok(())
    }

    // ── FinishStory ───────────────────────────────────

    fn finish_story(
        &self,
        ctx: &mut ReductionContext<'_>,
        root: Passage,
    ) -> Result<Passage, GraphError> {
        // Duplication second pass: same-batch cross-references can only
        // resolve once every object in the batch exists.
        if !ctx.duplicated.is_empty() {
            self.remap_duplicates(ctx)?;
        }

        // Destroy blocking tally: anything still referencing a destroyed
        // resource (couplings were already detached) would be orphaned.
        for raw_id in ctx.destroyed.clone() {
            let blockers = count_references_to(&ctx.state, raw_id, &ctx.destroyed);
            if blockers > 0 {
                if ctx.is_being_universalized {
                    return Err(GraphError::ReferentialIntegrityBlocked { raw_id, blockers });
                }
                if self.options.log_suppressed_violations {
                    warn!(
                        %raw_id,
                        blockers,
                        "destroy orphans live references; applying replayed event anyway"
                    );
                }
            }
        }
        Ok(root)
    }

    fn remap_duplicates(&self, ctx: &mut ReductionContext<'_>) -> Result<(), GraphError> {
        let batch = ctx.duplicated.clone();
        for duplicate_raw in batch.values() {
            let Some(existing) = ctx.resolver().concrete_of(*duplicate_raw).cloned() else {
                continue;
            };
            let rewritten: Vec<(String, FieldValue)> = existing
                .fields()
                .iter()
                .filter_map(|(name, value)| {
                    let mapped = remap_value(value, &batch);
                    (mapped != *value).then(|| (name.clone(), mapped))
                })
                .collect();
            if rewritten.is_empty() {
                continue;
            }
            self.mutate_transient(ctx, *duplicate_raw, move |t| {
                for (name, value) in rewritten {
                    t.set_field(name, value);
                }
            })?;
        }
        Ok(())
    }

    // ── Shared helpers ────────────────────────────────

    /// Resolve `id`; if it addresses a virtual ghost, reduce the synthesized
    /// materialization creates as sub-passages first.
    fn ensure_materialized(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: &ResourceId,
    ) -> Result<ResourceId, GraphError> {
        if let Some(existing) = ctx.resolver().concrete_of(id.raw_id()) {
            return Ok(existing.id().clone());
        }
        let Some(path) = id.ghost_path().filter(|p| p.is_ghost()).cloned() else {
            // Not a ghost: binding decides between inactive stub and error.
            return ctx.resolver().bind_object_id(id, TYPE_RESOURCE_STUB);
        };

        let outcome = {
            let resolver = ctx.resolver();
            ghost::materialize(&resolver, &path)?
        };
        match outcome {
            MaterializeOutcome::AlreadyConcrete(concrete) => Ok(concrete),
            MaterializeOutcome::Inactive(inactive_id) => {
                self.install_stub(ctx, &inactive_id);
                Ok(inactive_id)
            }
            MaterializeOutcome::Create { actions, id: ghost_id } => {
                for sub in actions {
                    let child = self.reduce_action(ctx, sub)?;
                    passage.passages.push(child);
                }
                Ok(ghost_id)
            }
        }
    }

    fn concrete_type(
        &self,
        ctx: &ReductionContext<'_>,
        id: &ResourceId,
    ) -> Result<String, GraphError> {
        let transient = ctx.resolver().require(id, TYPE_RESOURCE_STUB)?;
        Ok(transient.type_name().to_string())
    }

    fn install_stub(&self, ctx: &mut ReductionContext<'_>, id: &ResourceId) {
        if ctx.resolver().concrete_of(id.raw_id()).is_none() {
            ctx.state
                .set_transient(TYPE_RESOURCE_STUB, Transient::inactive_stub(id.clone(), TYPE_RESOURCE_STUB));
        }
    }

    /// Bind every reference inside `value` to its canonical id, installing
    /// inactive stubs for references into disconnected partitions.
    fn bind_value(
        &self,
        ctx: &mut ReductionContext<'_>,
        value: FieldValue,
    ) -> Result<FieldValue, GraphError> {
        match value {
            FieldValue::Reference(id) => {
                let bound = ctx.resolver().bind_object_id(&id, TYPE_RESOURCE_STUB)?;
                if bound.is_inactive() {
                    self.install_stub(ctx, &bound);
                }
                Ok(FieldValue::Reference(bound))
            }
            FieldValue::List(entries) => {
                let mut bound = Vec::with_capacity(entries.len());
                for entry in entries {
                    bound.push(self.bind_value(ctx, entry)?);
                }
                Ok(FieldValue::List(bound))
            }
            FieldValue::PartialList { added, removed } => {
                let mut bound_added = Vec::with_capacity(added.len());
                for entry in added {
                    bound_added.push(self.bind_value(ctx, entry)?);
                }
                let mut bound_removed = Vec::with_capacity(removed.len());
                for entry in removed {
                    bound_removed.push(self.bind_value(ctx, entry)?);
                }
                Ok(FieldValue::PartialList { added: bound_added, removed: bound_removed })
            }
            other => Ok(other),
        }
    }

    /// Set one field, updating the remote side of its coupling.
    fn set_field_on(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        id: &ResourceId,
        type_name: &str,
        field_name: &str,
        value: FieldValue,
    ) -> Result<(), GraphError> {
        let descriptor = self.schema.field(type_name, field_name).cloned();
        let resolved_name =
            descriptor.as_ref().map_or(field_name, |d| d.name.as_str()).to_string();
        let value = self.bind_value(ctx, value)?;

        let raw_id = id.raw_id();
        let old = ctx
            .resolver()
            .concrete_of(raw_id)
            .and_then(|t| t.get_field(&resolved_name))
            .cloned();

        {
            let name = resolved_name.clone();
            let stored = value.clone();
            self.mutate_transient(ctx, raw_id, move |t| t.set_field(name, stored))?;
        }

        if let Some(desc) = &descriptor {
            if let Some(coupled) = desc.coupled_field.clone() {
                if let Some(FieldValue::Reference(old_remote)) = old {
                    if !old_remote.is_same_resource(id) {
                        self.remove_coupling(ctx, passage, &old_remote, &coupled, id)?;
                    }
                }
                if let FieldValue::Reference(remote) = &value {
                    if !remote.is_inactive() {
                        self.add_coupling(ctx, passage, remote, &coupled, id, &resolved_name)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Install the back-reference of a coupling on `remote.coupled_field`.
    fn add_coupling(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        remote: &ResourceId,
        coupled_field: &str,
        local: &ResourceId,
        local_field: &str,
    ) -> Result<(), GraphError> {
        let remote = self.ensure_materialized(ctx, passage, remote)?;
        if remote.is_inactive() {
            return Ok(());
        }
        let remote_type = self.concrete_type(ctx, &remote)?;
        let is_sequence =
            self.schema.field(&remote_type, coupled_field).map_or(true, |d| d.is_sequence);
        let back = FieldValue::Reference(local.clone().with_coupled_field(local_field));

        let remote_raw = remote.raw_id();
        let has_prototype = {
            let resolver = ctx.resolver();
            match resolver.concrete_of(remote_raw) {
                Some(t) => resolver.prototype_of(t).is_some(),
                None => false,
            }
        };
        let field = coupled_field.to_string();
        self.mutate_transient(ctx, remote_raw, move |t| {
            if !is_sequence {
                t.set_field(field, back);
                return;
            }
            match t.fields().get(&field).cloned() {
                Some(FieldValue::List(mut values)) => {
                    if !values.contains(&back) {
                        values.push(back);
                    }
                    t.set_field(field, FieldValue::List(values));
                }
                Some(FieldValue::PartialList { mut added, mut removed }) => {
                    removed.retain(|v| *v != back);
                    if !added.contains(&back) {
                        added.push(back);
                    }
                    t.set_field(field, FieldValue::PartialList { added, removed });
                }
                _ => {
                    if has_prototype {
                        t.set_field(
                            field,
                            FieldValue::PartialList { added: vec![back], removed: Vec::new() },
                        );
                    } else {
                        t.set_field(field, FieldValue::List(vec![back]));
                    }
                }
            }
        })?;
        passage.updated_couplings.push((remote, coupled_field.to_string()));
        Ok(())
    }

    /// Drop the back-reference of a coupling from `remote.coupled_field`.
    fn remove_coupling(
        &self,
        ctx: &mut ReductionContext<'_>,
        passage: &mut Passage,
        remote: &ResourceId,
        coupled_field: &str,
        local: &ResourceId,
    ) -> Result<(), GraphError> {
        if ctx.resolver().concrete_of(remote.raw_id()).is_none() {
            // Virtual or foreign remote: nothing stored to detach.
            return Ok(());
        }
        let local_raw = local.raw_id();
        let field = coupled_field.to_string();
        self.mutate_transient(ctx, remote.raw_id(), move |t| {
            match t.fields().get(&field).cloned() {
                Some(FieldValue::Reference(stored)) if stored.raw_id() == local_raw => {
                    t.set_field(field, FieldValue::Null);
                }
                Some(FieldValue::List(mut values)) => {
                    values.retain(|v| v.reference().map_or(true, |r| r.raw_id() != local_raw));
                    t.set_field(field, FieldValue::List(values));
                }
                Some(FieldValue::PartialList { mut added, removed }) => {
                    added.retain(|v| v.reference().map_or(true, |r| r.raw_id() != local_raw));
                    t.set_field(field, FieldValue::PartialList { added, removed });
                }
                _ => {}
            }
        })?;
        passage.updated_couplings.push((remote.clone(), coupled_field.to_string()));
        Ok(())
    }

    /// Clone-mutate-store one concrete transient (copy-on-write at the
    /// entry level; the table copy happens inside [`State`]).
    fn mutate_transient(
        &self,
        ctx: &mut ReductionContext<'_>,
        raw_id: Uuid,
        mutate: impl FnOnce(&mut Transient),
    ) -> Result<(), GraphError> {
        let existing = ctx.resolver().concrete_of(raw_id).cloned().ok_or_else(|| {
            GraphError::UnresolvedReference {
                raw_id,
                type_hint: TYPE_RESOURCE.to_string(),
            }
        })?;
        let mut transient = (*existing).clone();
        mutate(&mut transient);
        let type_name = transient.type_name().to_string();
        ctx.state.set_transient(&type_name, transient);
        Ok(())
    }

    /// Resolve the owning partition from the resource's own
    /// `partitionAuthorityURI` or its owner chain, and stamp it on the
    /// stored id. During universalization an incompletable owner chain is a
    /// hard error; during replay it is logged and skipped.
    fn assign_partition(
        &self,
        ctx: &mut ReductionContext<'_>,
        id: &ResourceId,
        type_name: &str,
    ) -> Result<ResourceId, GraphError> {
        if id.partition_uri().is_some() {
            return Ok(id.clone());
        }
        let raw_id = id.raw_id();
        let transient = ctx.resolver().concrete_of(raw_id).cloned().ok_or_else(|| {
            GraphError::UnresolvedReference { raw_id, type_hint: type_name.to_string() }
        })?;

        let partition_uri = match authority_of(&transient) {
            Some(uri) => Some(uri),
            None => self.partition_from_owner_chain(ctx, &transient)?,
        };
        let Some(partition_uri) = partition_uri else {
            return Ok(id.clone());
        };

        let stamped = id.clone().with_partition_uri(partition_uri);
        let with_id = stamped.clone();
        self.mutate_transient(ctx, raw_id, move |t| t.set_id(with_id))?;
        Ok(stamped)
    }

    fn partition_from_owner_chain(
        &self,
        ctx: &ReductionContext<'_>,
        transient: &Transient,
    ) -> Result<Option<String>, GraphError> {
        let resolver = ctx.resolver();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut cursor = owner_reference(transient);
        while let Some(owner_id) = cursor {
            if let Some(uri) = owner_id.partition_uri() {
                return Ok(Some(uri.to_string()));
            }
            if !seen.insert(owner_id.raw_id()) {
                return Err(GraphError::InvariantViolation(format!(
                    "ownership cycle while assigning partition of {}",
                    transient.id()
                )));
            }
            match resolver.resolve(&owner_id, TYPE_RESOURCE_STUB, ResolveOptions::soft())? {
                Some(owner) => {
                    if let Some(uri) = owner.id().partition_uri() {
                        return Ok(Some(uri.to_string()));
                    }
                    if let Some(uri) = authority_of(&owner) {
                        return Ok(Some(uri));
                    }
                    cursor = owner_reference(&owner);
                }
                None if ctx.is_being_universalized => {
                    // Universalization must complete the owner chain so the
                    // command replays in any connectivity configuration.
                    return Err(GraphError::InvariantViolation(format!(
                        "cannot universalize: owner chain of {} crosses an unresolvable boundary at {owner_id}",
                        transient.id()
                    )));
                }
                None => {
                    if self.options.log_suppressed_violations {
                        warn!(
                            owner = %owner_id,
                            "owner chain unresolvable during replay; partition left unassigned"
                        );
                    }
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }
}

// ─────────────────────────────────────────────
// Free helpers
// ─────────────────────────────────────────────

fn owner_reference(transient: &Transient) -> Option<ResourceId> {
    transient
        .get_field(crate::schema::FIELD_OWNER)
        .and_then(|v| v.reference().cloned())
        .or_else(|| transient.get_field(FIELD_GHOST_OWNER).and_then(|v| v.reference().cloned()))
}

fn authority_of(transient: &Transient) -> Option<String> {
    match transient.get_field(FIELD_PARTITION_AUTHORITY)? {
        FieldValue::Literal(value) => value.as_str().map(|s| s.to_string()),
        _ => None,
    }
}

fn collect_references(value: &FieldValue, out: &mut Vec<ResourceId>) {
    match value {
        FieldValue::Reference(id) => out.push(id.clone()),
        FieldValue::List(entries) => {
            for entry in entries {
                collect_references(entry, out);
            }
        }
        FieldValue::PartialList { added, .. } => {
            for entry in added {
                collect_references(entry, out);
            }
        }
        FieldValue::Null | FieldValue::Literal(_) => {}
    }
}

fn references_raw(value: &FieldValue, raw_id: Uuid) -> bool {
    match value {
        FieldValue::Reference(id) => id.raw_id() == raw_id,
        FieldValue::List(entries) => entries.iter().any(|e| references_raw(e, raw_id)),
        FieldValue::PartialList { added, .. } => added.iter().any(|e| references_raw(e, raw_id)),
        FieldValue::Null | FieldValue::Literal(_) => false,
    }
}

/// How many live (not themselves destroyed) transients still reference
/// `raw_id`.
fn count_references_to(state: &State, raw_id: Uuid, destroyed: &HashSet<Uuid>) -> usize {
    state
        .iter_transients()
        .filter(|(_, t)| !destroyed.contains(&t.id().raw_id()))
        .flat_map(|(_, t)| t.fields().values())
        .filter(|value| references_raw(value, raw_id))
        .count()
}

fn remap_value(value: &FieldValue, batch: &HashMap<Uuid, Uuid>) -> FieldValue {
    match value {
        FieldValue::Reference(id) => match batch.get(&id.raw_id()) {
            Some(duplicate_raw) => {
                let mut mapped = ResourceId::new(*duplicate_raw);
                if let Some(coupled) = id.coupled_field() {
                    mapped = mapped.with_coupled_field(coupled);
                }
                FieldValue::Reference(mapped)
            }
            None => value.clone(),
        },
        FieldValue::List(entries) => {
            FieldValue::List(entries.iter().map(|e| remap_value(e, batch)).collect())
        }
        FieldValue::PartialList { added, removed } => FieldValue::PartialList {
            added: added.iter().map(|e| remap_value(e, batch)).collect(),
            removed: removed.iter().map(|e| remap_value(e, batch)).collect(),
        },
        FieldValue::Null | FieldValue::Literal(_) => value.clone(),
    }
}
