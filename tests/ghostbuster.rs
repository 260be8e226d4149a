// ────────────────────────────────────────────────────────────────
//  doppel-graph — end-to-end reduction tests
//
//  Strategy:
//    • Drive everything through the public Bard/Resolver API, never by
//      poking State tables directly: each scenario is a command log
//      reduced in order, mirroring how an embedder uses the crate.
//    • The recurring fixture is a prototype tree `R owns a` (with `a`
//      carrying plain data fields) plus instances `R#1`, `R#2` created
//      with `prototype: R`. Ghost identities are derived, never minted,
//      so assertions can recompute them with derive_ghost_raw_id.
//    • Covers: inherited reads with elevation, lazy ghost
//      materialization (incl. deeply owned ghosts), override divergence
//      between sibling instances, cascade destruction, inactive stub
//      binding, sequence delta reconciliation across instances, the
//      ghost/deep-copy log equivalence, and replayed-event suppression.
// ────────────────────────────────────────────────────────────────

use std::collections::HashMap;

use doppel_graph::schema::{
    FIELD_GHOST_OWNER, FIELD_GHOST_OWNLINGS, FIELD_MATERIALIZED_GHOSTS, FIELD_OWNER,
    FIELD_PROTOTYPE, TYPE_ENTITY, TYPE_RESOURCE, TYPE_RESOURCE_STUB,
};
use doppel_graph::{
    derive_ghost_raw_id, Action, Bard, BardOptions, Command, FieldValue, GraphError, ResourceId,
    Resolver, SchemaRegistry, State,
};

/// Route reduction logs through a real subscriber so suppressed-violation
/// warnings surface in test output. Idempotent across tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("doppel_graph=warn")),
        )
        .with_test_writer()
        .try_init();
}

// ═══════════════════════════════════════════════════════════════
// Fixture
// ═══════════════════════════════════════════════════════════════

struct Fixture {
    bard: Bard,
    state: State,
    r: ResourceId,
    a: ResourceId,
    i1: ResourceId,
    i2: ResourceId,
}

fn entity(id: &ResourceId, fields: &[(&str, FieldValue)]) -> Action {
    Action::Created {
        id: id.clone(),
        type_name: TYPE_ENTITY.to_string(),
        pre_overrides: HashMap::new(),
        initial_state: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        no_sub_materialize: false,
    }
}

fn set(id: &ResourceId, fields: &[(&str, FieldValue)]) -> Action {
    Action::FieldsSet {
        id: id.clone(),
        type_name: TYPE_ENTITY.to_string(),
        sets: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
    }
}

fn text(value: &str) -> FieldValue {
    FieldValue::Literal(serde_json::json!(value))
}

/// `R` owns `a` (with `hue: "red"`); `R#1` and `R#2` instantiate `R`.
fn fixture() -> Fixture {
    init_tracing();
    let bard = Bard::new(SchemaRegistry::bootstrap(), BardOptions::default());
    let r = ResourceId::random();
    let a = ResourceId::random();
    let i1 = ResourceId::random();
    let i2 = ResourceId::random();

    let (state, _) = bard
        .reduce(
            &State::new(),
            &Command::local(Action::Transacted {
                actions: vec![
                    entity(&r, &[]),
                    entity(
                        &a,
                        &[
                            (FIELD_OWNER, FieldValue::Reference(r.clone())),
                            ("hue", text("red")),
                        ],
                    ),
                    set(&r, &[("a", FieldValue::Reference(a.clone()))]),
                    entity(&i1, &[(FIELD_PROTOTYPE, FieldValue::Reference(r.clone()))]),
                    entity(&i2, &[(FIELD_PROTOTYPE, FieldValue::Reference(r.clone()))]),
                ],
            }),
        )
        .expect("fixture log must reduce");

    Fixture { bard, state, r, a, i1, i2 }
}

impl Fixture {
    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.state, self.bard.schema())
    }

    fn read(&self, id: &ResourceId, field: &str) -> FieldValue {
        self.resolver().read_field(id, field).expect("read must succeed").expect("field present")
    }

    fn apply(&mut self, action: Action) {
        let (state, _) = self.bard.reduce(&self.state, &Command::local(action)).expect("reduce");
        self.state = state;
    }
}

// ═══════════════════════════════════════════════════════════════
// 1. Inherited reads and elevation
// ═══════════════════════════════════════════════════════════════

#[test]
fn inherited_read_elevates_into_instance_space() {
    let f = fixture();

    let ghost = f.read(&f.i1, "a");
    let ghost = ghost.reference().expect("reference");

    assert_eq!(ghost.raw_id(), derive_ghost_raw_id(f.a.raw_id(), f.i1.raw_id()));
    assert!(ghost.is_ghost());
    // Distinct instances see distinct ghosts of the same prototype child.
    let other = f.read(&f.i2, "a");
    assert_ne!(other.reference().unwrap().raw_id(), ghost.raw_id());
}

#[test]
fn virtual_ghost_reads_fall_through_to_prototype() {
    let f = fixture();
    let ghost = f.read(&f.i1, "a").reference().unwrap().clone();

    // Nothing materialized; the resolver synthesizes the stand-in.
    assert!(!f.state.contains(TYPE_RESOURCE, ghost.raw_id()));
    assert_eq!(f.read(&ghost, "hue"), text("red"));
}

#[test]
fn external_references_are_not_elevated() {
    let mut f = fixture();
    // An outside resource referenced from R: not part of R's subtree, so an
    // instance reads the reference verbatim.
    let outside = ResourceId::random();
    f.apply(entity(&outside, &[]));
    f.apply(set(&f.r.clone(), &[("landmark", FieldValue::Reference(outside.clone()))]));

    let seen = f.read(&f.i1, "landmark");
    assert_eq!(seen.reference().unwrap().raw_id(), outside.raw_id());
    assert!(!seen.reference().unwrap().is_ghost());
}

// ═══════════════════════════════════════════════════════════════
// 2. Lazy materialization
// ═══════════════════════════════════════════════════════════════

#[test]
fn writing_to_a_virtual_ghost_materializes_it() {
    let mut f = fixture();
    let ghost = f.read(&f.i1, "a").reference().unwrap().clone();

    f.apply(set(&ghost, &[("hue", text("blue"))]));

    // Concrete now, with both ghost bookkeeping references in place.
    assert!(f.state.contains(TYPE_RESOURCE, ghost.raw_id()));
    let owner = f.read(&ghost, FIELD_GHOST_OWNER);
    assert_eq!(owner.reference().unwrap().raw_id(), f.i1.raw_id());
    let hosted = f.read(&f.i1, FIELD_GHOST_OWNLINGS);
    let FieldValue::List(hosted) = hosted else { panic!("expected list") };
    assert_eq!(hosted.len(), 1);
    assert_eq!(hosted[0].reference().unwrap().raw_id(), ghost.raw_id());
    let tracked = f.read(&f.a.clone(), FIELD_MATERIALIZED_GHOSTS);
    let FieldValue::List(tracked) = tracked else { panic!("expected list") };
    assert_eq!(tracked[0].reference().unwrap().raw_id(), ghost.raw_id());
}

#[test]
fn materialization_does_not_change_observable_reads() {
    let mut f = fixture();
    let ghost = f.read(&f.i1, "a").reference().unwrap().clone();
    let before = f.read(&ghost, "hue");

    // Materialize via an unrelated write; `hue` itself is untouched.
    f.apply(set(&ghost, &[("note", text("materialized"))]));

    assert_eq!(f.read(&ghost, "hue"), before);
}

#[test]
fn overrides_diverge_per_instance() {
    let mut f = fixture();
    let ghost_1 = f.read(&f.i1, "a").reference().unwrap().clone();
    let ghost_2 = f.read(&f.i2, "a").reference().unwrap().clone();

    f.apply(set(&ghost_1, &[("hue", text("blue"))]));

    assert_eq!(f.read(&ghost_1, "hue"), text("blue"));
    assert_eq!(f.read(&ghost_2, "hue"), text("red"));
    assert_eq!(f.read(&f.a.clone(), "hue"), text("red"));
}

#[test]
fn deep_ghost_identity_is_independent_of_read_route() {
    let mut f = fixture();
    // Extend the prototype tree: a owns b, reachable both straight from R
    // and through a.
    let b = ResourceId::random();
    f.apply(entity(
        &b,
        &[(FIELD_OWNER, FieldValue::Reference(f.a.clone())), ("depth", text("two"))],
    ));
    f.apply(set(&f.a.clone(), &[("child", FieldValue::Reference(b.clone()))]));
    f.apply(set(&f.r.clone(), &[("grandchild", FieldValue::Reference(b.clone()))]));

    let direct = f.read(&f.i1, "grandchild").reference().unwrap().clone();
    let ghost_a = f.read(&f.i1, "a").reference().unwrap().clone();
    let via_ghost = f.read(&ghost_a, "child").reference().unwrap().clone();

    // One logical resource, one identity: derived from the instantiation
    // host, however deep the ownership nesting the read traversed.
    assert_eq!(direct.raw_id(), via_ghost.raw_id());
    assert_eq!(direct.raw_id(), derive_ghost_raw_id(b.raw_id(), f.i1.raw_id()));
}

#[test]
fn deep_ghost_materializes_hosted_by_the_instance() {
    let mut f = fixture();
    let b = ResourceId::random();
    f.apply(entity(
        &b,
        &[(FIELD_OWNER, FieldValue::Reference(f.a.clone())), ("depth", text("two"))],
    ));
    f.apply(set(&f.a.clone(), &[("child", FieldValue::Reference(b.clone()))]));

    let ghost_a = f.read(&f.i1, "a").reference().unwrap().clone();
    let ghost_b = f.read(&ghost_a, "child").reference().unwrap().clone();

    f.apply(set(&ghost_b, &[("depth", text("overridden"))]));

    // Only the written ghost materializes; its sibling ghost up the
    // ownership tree stays virtual, and the host is the instance itself.
    assert!(f.state.contains(TYPE_RESOURCE, ghost_b.raw_id()));
    assert!(!f.state.contains(TYPE_RESOURCE, ghost_a.raw_id()));
    let owner = f.read(&ghost_b, FIELD_GHOST_OWNER);
    assert_eq!(owner.reference().unwrap().raw_id(), f.i1.raw_id());
    assert_eq!(f.read(&ghost_b, "depth"), text("overridden"));
    assert_eq!(f.read(&ghost_a, "hue"), text("red"));
}

#[test]
fn repeated_ghost_writes_materialize_once() {
    let mut f = fixture();
    let ghost = f.read(&f.i1, "a").reference().unwrap().clone();

    f.apply(set(&ghost, &[("hue", text("blue"))]));
    let (state, story) = f
        .bard
        .reduce(&f.state, &Command::local(set(&ghost, &[("hue", text("green"))])))
        .unwrap();
    f.state = state;

    // No materialization sub-passages the second time around.
    assert!(story.root.passages.is_empty());
    assert_eq!(f.read(&ghost, "hue"), text("green"));
}

// ═══════════════════════════════════════════════════════════════
// 3. Destruction
// ═══════════════════════════════════════════════════════════════

#[test]
fn destroying_an_instance_takes_its_materialized_ghosts_along() {
    let mut f = fixture();
    let ghost = f.read(&f.i1, "a").reference().unwrap().clone();
    f.apply(set(&ghost, &[("hue", text("blue"))]));

    f.apply(Action::Destroyed { id: f.i1.clone() });

    assert!(!f.state.contains(TYPE_RESOURCE, f.i1.raw_id()));
    assert!(!f.state.contains(TYPE_RESOURCE, ghost.raw_id()));
    // Couplings were detached: the prototype no longer tracks the ghost,
    // and R no longer lists the instance.
    let tracked = f.read(&f.a.clone(), FIELD_MATERIALIZED_GHOSTS);
    assert_eq!(tracked, FieldValue::List(Vec::new()));
    let instances = f.read(&f.r.clone(), "instances");
    let FieldValue::List(instances) = instances else { panic!("expected list") };
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].reference().unwrap().raw_id(), f.i2.raw_id());
}

#[test]
fn destroying_a_virtual_ghost_is_a_no_op() {
    let mut f = fixture();
    let ghost = f.read(&f.i1, "a").reference().unwrap().clone();

    let before = f.state.clone();
    f.apply(Action::Destroyed { id: ghost });
    assert_eq!(f.state, before);
}

// ═══════════════════════════════════════════════════════════════
// 4. Inactive stubs
// ═══════════════════════════════════════════════════════════════

#[test]
fn references_into_disconnected_partitions_bind_inactive() {
    let mut f = fixture();
    let remote = ResourceId::random().with_partition_uri("valaa-aws:offline");

    f.apply(set(&f.r.clone(), &[("mirror", FieldValue::Reference(remote.clone()))]));

    let stored = f.read(&f.r.clone(), "mirror");
    let stored = stored.reference().unwrap();
    assert!(stored.is_inactive());
    assert_eq!(stored.raw_id(), remote.raw_id());
    assert!(f.state.contains(TYPE_RESOURCE_STUB, remote.raw_id()));
}

// ═══════════════════════════════════════════════════════════════
// 5. Sequence deltas across instances
// ═══════════════════════════════════════════════════════════════

#[test]
fn instance_sequence_edits_layer_over_the_prototype() {
    let mut f = fixture();
    f.apply(Action::AddedToFields {
        id: f.r.clone(),
        type_name: TYPE_ENTITY.to_string(),
        adds: HashMap::from([("tags".to_string(), vec![text("base"), text("shared")])]),
    });
    f.apply(Action::AddedToFields {
        id: f.i1.clone(),
        type_name: TYPE_ENTITY.to_string(),
        adds: HashMap::from([("tags".to_string(), vec![text("mine")])]),
    });
    f.apply(Action::RemovedFromFields {
        id: f.i1.clone(),
        type_name: TYPE_ENTITY.to_string(),
        removes: HashMap::from([("tags".to_string(), vec![text("base")])]),
    });

    assert_eq!(
        f.read(&f.i1, "tags"),
        FieldValue::List(vec![text("shared"), text("mine")])
    );
    // Sibling and prototype stay untouched.
    assert_eq!(f.read(&f.i2, "tags"), FieldValue::List(vec![text("base"), text("shared")]));
    assert_eq!(f.read(&f.r.clone(), "tags"), FieldValue::List(vec![text("base"), text("shared")]));
}

// ═══════════════════════════════════════════════════════════════
// 6. Ghost / deep-copy equivalence
// ═══════════════════════════════════════════════════════════════

/// Instancing is an optimization, not a semantic. A log that instantiates
/// a prototype and then diverges through a ghost must be observably
/// equivalent — up to id renaming — to the same log with the instantiation
/// replaced by a deep copy of the prototype's subtree and every later
/// prototype mutation hoisted to before the copy.
#[test]
fn instancing_log_is_equivalent_to_a_hoisted_deep_copy_log() {
    init_tracing();
    let bard = Bard::new(SchemaRegistry::bootstrap(), BardOptions::default());

    // World one: instantiate, mutate the prototype afterwards, then
    // diverge the instance through its ghost.
    let r = ResourceId::random();
    let a = ResourceId::random();
    let i = ResourceId::random();
    let (state, _) = bard
        .reduce(
            &State::new(),
            &Command::local(Action::Transacted {
                actions: vec![
                    entity(&r, &[]),
                    entity(
                        &a,
                        &[
                            (FIELD_OWNER, FieldValue::Reference(r.clone())),
                            ("hue", text("red")),
                        ],
                    ),
                    set(&r, &[("a", FieldValue::Reference(a.clone()))]),
                    entity(&i, &[(FIELD_PROTOTYPE, FieldValue::Reference(r.clone()))]),
                    set(&a, &[("hue", text("green"))]),
                ],
            }),
        )
        .expect("instancing log must reduce");
    let ghost = {
        let resolver = Resolver::new(&state, bard.schema());
        let value = resolver.read_field(&i, "a").unwrap().unwrap();
        value.reference().unwrap().clone()
    };
    let (instanced, _) = bard
        .reduce(&state, &Command::local(set(&ghost, &[("hue", text("blue"))])))
        .expect("ghost divergence must reduce");

    // World two: the ghostbusted log. The prototype mutation is hoisted,
    // the instantiation becomes a deep copy of R's subtree, and the
    // divergence lands on the copy.
    let r2 = ResourceId::random();
    let a2 = ResourceId::random();
    let j = ResourceId::random();
    let a_copy = ResourceId::random();
    let (copied, _) = bard
        .reduce(
            &State::new(),
            &Command::local(Action::Transacted {
                actions: vec![
                    entity(&r2, &[]),
                    entity(
                        &a2,
                        &[
                            (FIELD_OWNER, FieldValue::Reference(r2.clone())),
                            ("hue", text("red")),
                        ],
                    ),
                    set(&r2, &[("a", FieldValue::Reference(a2.clone()))]),
                    set(&a2, &[("hue", text("green"))]),
                    entity(&j, &[]),
                    entity(
                        &a_copy,
                        &[
                            (FIELD_OWNER, FieldValue::Reference(j.clone())),
                            ("hue", text("green")),
                        ],
                    ),
                    set(&j, &[("a", FieldValue::Reference(a_copy.clone()))]),
                    set(&a_copy, &[("hue", text("blue"))]),
                ],
            }),
        )
        .expect("deep-copy log must reduce");

    let one = Resolver::new(&instanced, bard.schema());
    let two = Resolver::new(&copied, bard.schema());

    // The instance's child maps to the copy's child under the renaming.
    let seen = one.read_field(&i, "a").unwrap().unwrap();
    assert_eq!(seen.reference().unwrap().raw_id(), ghost.raw_id());
    let seen2 = two.read_field(&j, "a").unwrap().unwrap();
    assert_eq!(seen2.reference().unwrap().raw_id(), a_copy.raw_id());

    // Divergence is visible on the child, the hoisted mutation on the
    // prototype, identically in both worlds.
    assert_eq!(one.read_field(&ghost, "hue").unwrap().unwrap(), text("blue"));
    assert_eq!(two.read_field(&a_copy, "hue").unwrap().unwrap(), text("blue"));
    assert_eq!(one.read_field(&a, "hue").unwrap().unwrap(), text("green"));
    assert_eq!(two.read_field(&a2, "hue").unwrap().unwrap(), text("green"));

    // Ownership topology matches: each child is owned by its instance.
    let owner = one.read_field(&ghost, FIELD_OWNER).unwrap().unwrap();
    assert_eq!(owner.reference().unwrap().raw_id(), i.raw_id());
    let owner2 = two.read_field(&a_copy, FIELD_OWNER).unwrap().unwrap();
    assert_eq!(owner2.reference().unwrap().raw_id(), j.raw_id());
}

// ═══════════════════════════════════════════════════════════════
// 7. Downstream replay
// ═══════════════════════════════════════════════════════════════

#[test]
fn replayed_destroy_of_a_referenced_resource_applies_anyway() {
    let mut f = fixture();
    let target = ResourceId::random();
    f.apply(entity(&target, &[]));
    f.apply(set(&f.r.clone(), &[("beacon", FieldValue::Reference(target.clone()))]));

    // Authoring locally refuses to orphan the live reference...
    let err = f
        .bard
        .reduce(&f.state, &Command::local(Action::Destroyed { id: target.clone() }))
        .unwrap_err();
    assert!(matches!(err.root_cause(), GraphError::ReferentialIntegrityBlocked { .. }));

    // ...but an upstream-confirmed replay warns and applies, because the
    // remote log is authoritative.
    let replayed = Command::replayed(
        Action::Destroyed { id: target.clone() },
        HashMap::from([("valaa-test:".to_string(), 1)]),
    );
    let (state, _) = f.bard.reduce(&f.state, &replayed).expect("replay must apply");
    assert!(!state.contains(TYPE_RESOURCE, target.raw_id()));
}
