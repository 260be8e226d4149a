//! The global immutable store.
//!
//! [`State`] maps type names (including the universal interface tables
//! `ResourceStub` and `Resource`) to per-type id → entry tables. An entry is
//! either an owning [`Transient`] or a redirect naming the concrete type
//! that owns the id — interface ("is-a") lookups land on a redirect and
//! re-probe once.
//!
//! Mutation is copy-on-first-write per table: cloning a `State` shares every
//! table behind `Arc`, and the first write to a table within a reduction
//! clones just that table. A reduction builds its scratch `State` privately
//! and publishes the final value atomically; no in-place mutation is
//! observable outside one reduction step.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transient::Transient;

// ─────────────────────────────────────────────
// Table entries
// ─────────────────────────────────────────────

/// One slot of a per-type table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableEntry {
    /// The owning snapshot — this table's type is the id's concrete type.
    Transient(Arc<Transient>),
    /// The id's concrete type differs from the probed table; re-probe there.
    TypeRedirect(String),
}

/// id → entry table for one type name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeTable {
    entries: HashMap<Uuid, TableEntry>,
}

impl TypeTable {
    pub fn get(&self, raw_id: Uuid) -> Option<&TableEntry> {
        self.entries.get(&raw_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &TableEntry)> {
        self.entries.iter()
    }
}

// ─────────────────────────────────────────────
// State
// ─────────────────────────────────────────────

/// The immutable global store. Cheap to clone; structurally shared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    tables: HashMap<String, Arc<TypeTable>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe one table without following redirects.
    pub fn entry(&self, type_name: &str, raw_id: Uuid) -> Option<&TableEntry> {
        self.tables.get(type_name)?.get(raw_id)
    }

    /// Probe a table and follow at most one redirect hop.
    ///
    /// The owning transient knows its concrete type via
    /// [`Transient::type_name`].
    pub fn transient(&self, type_name: &str, raw_id: Uuid) -> Option<&Arc<Transient>> {
        match self.entry(type_name, raw_id)? {
            TableEntry::Transient(t) => Some(t),
            TableEntry::TypeRedirect(concrete) => match self.entry(concrete, raw_id)? {
                TableEntry::Transient(t) => Some(t),
                // Redirect chains are length one by construction.
                TableEntry::TypeRedirect(_) => None,
            },
        }
    }

    /// The concrete type that owns `raw_id`, if the id is known at all.
    /// Probes the universal `Resource` interface table.
    pub fn concrete_type_of(&self, raw_id: Uuid) -> Option<&str> {
        match self.entry(crate::schema::TYPE_RESOURCE, raw_id)? {
            TableEntry::TypeRedirect(concrete) => Some(concrete.as_str()),
            TableEntry::Transient(t) => Some(t.type_name()),
        }
    }

    /// Whether `raw_id` has any entry in the given table (transient or
    /// redirect).
    pub fn contains(&self, type_name: &str, raw_id: Uuid) -> bool {
        self.entry(type_name, raw_id).is_some()
    }

    /// Iterate every owning transient in the store.
    pub fn iter_transients(&self) -> impl Iterator<Item = (&str, &Arc<Transient>)> {
        self.tables.iter().flat_map(|(type_name, table)| {
            table.iter().filter_map(move |(_, entry)| match entry {
                TableEntry::Transient(t) => Some((type_name.as_str(), t)),
                TableEntry::TypeRedirect(_) => None,
            })
        })
    }

    // ── Copy-on-first-write mutation ─────────────────────
    //
    // Only the reducer that exclusively owns this State value during one
    // reduction calls these; everyone else sees a frozen snapshot.

    fn table_mut(&mut self, type_name: &str) -> &mut TypeTable {
        let arc = self
            .tables
            .entry(type_name.to_string())
            .or_insert_with(|| Arc::new(TypeTable::default()));
        Arc::make_mut(arc)
    }

    /// Install an owning transient in its concrete type's table.
    pub fn set_transient(&mut self, type_name: &str, transient: Transient) {
        let raw_id = transient.id().raw_id();
        self.table_mut(type_name).entries.insert(raw_id, TableEntry::Transient(Arc::new(transient)));
    }

    /// Install a redirect from `table` to the id's concrete type.
    pub fn set_redirect(&mut self, table: &str, raw_id: Uuid, concrete_type: &str) {
        self.table_mut(table)
            .entries
            .insert(raw_id, TableEntry::TypeRedirect(concrete_type.to_string()));
    }

    /// Remove one entry. Returns the removed entry, if any.
    pub fn remove(&mut self, type_name: &str, raw_id: Uuid) -> Option<TableEntry> {
        let arc = self.tables.get_mut(type_name)?;
        Arc::make_mut(arc).entries.remove(&raw_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ResourceId;
    use crate::schema::{TYPE_ENTITY, TYPE_RESOURCE};

    fn entity(state: &mut State) -> ResourceId {
        let id = ResourceId::random();
        let t = Transient::new(id.clone(), TYPE_ENTITY);
        state.set_transient(TYPE_ENTITY, t);
        state.set_redirect(TYPE_RESOURCE, id.raw_id(), TYPE_ENTITY);
        id
    }

    #[test]
    fn redirect_resolves_to_concrete_table() {
        let mut state = State::new();
        let id = entity(&mut state);

        let t = state.transient(TYPE_RESOURCE, id.raw_id()).unwrap();
        assert_eq!(t.type_name(), TYPE_ENTITY);
        assert_eq!(t.id(), &id);
        assert_eq!(state.concrete_type_of(id.raw_id()), Some(TYPE_ENTITY));
    }

    #[test]
    fn clone_shares_tables_until_write() {
        let mut state = State::new();
        let id = entity(&mut state);

        let snapshot = state.clone();
        let other = entity(&mut state);

        // The snapshot must not observe the later write.
        assert!(snapshot.transient(TYPE_ENTITY, id.raw_id()).is_some());
        assert!(snapshot.transient(TYPE_ENTITY, other.raw_id()).is_none());
        assert!(state.transient(TYPE_ENTITY, other.raw_id()).is_some());
    }

    #[test]
    fn remove_is_local_to_one_value() {
        let mut state = State::new();
        let id = entity(&mut state);
        let snapshot = state.clone();

        state.remove(TYPE_ENTITY, id.raw_id());
        assert!(state.transient(TYPE_ENTITY, id.raw_id()).is_none());
        assert!(snapshot.transient(TYPE_ENTITY, id.raw_id()).is_some());
    }
}
