//! # doppel-graph
//!
//! Event-sourced, denormalized resource graph store with prototypal
//! instancing.
//!
//! Provides the reduction core and the ghost-aware resolution layer:
//! - [`state::State`]       — immutable global store, copy-on-write tables
//! - [`id::ResourceId`]     — opaque resource reference with ghost lineage
//! - [`resolver::Resolver`] — id → transient resolution and inherited reads
//! - [`bard::Bard`]         — per-command reducer producing audit stories
//! - [`ghost`]              — ghost materialization and immaterialization
//!
//! A [`bard::Bard`] reduces one [`action::Command`] against one
//! [`state::State`] value and returns the next state; readers keep resolving
//! against their snapshot untouched.

pub mod action;
pub mod bard;
pub mod elevate;
pub mod error;
pub mod ghost;
pub mod id;
pub mod resolver;
pub mod schema;
pub mod state;
pub mod transient;

pub use action::{Action, Command, PartitionInfo};
pub use bard::{Bard, BardOptions, Passage, Story};
pub use error::GraphError;
pub use id::{derive_ghost_raw_id, GhostPath, GhostStep, ResourceId};
pub use resolver::{ResolveOptions, Resolver};
pub use schema::{FieldDescriptor, SchemaRegistry, TypeDescriptor};
pub use state::State;
pub use transient::{FieldValue, Transient, TransientKind};
