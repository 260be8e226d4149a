//! Actions and commands.
//!
//! The reduction core treats inbound actions as tagged records: every action
//! names at least `{type, id, typeName}`; the creation family adds
//! `initial_state` / `pre_overrides` / `duplicate_of`; the modification
//! family adds field delta descriptors; the transaction family adds an
//! ordered action list. Everything beyond those fields is opaque here.
//!
//! A [`Command`] is the envelope an action arrives in. When it carries no
//! partition-routing metadata the reduction runs in *universalizing* mode:
//! the command is being authored locally and must be extended so it replays
//! correctly in any partition-connectivity configuration. When routing
//! metadata is present the command was already confirmed upstream and is
//! being replayed downstream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::ResourceId;
use crate::transient::FieldValue;

// ─────────────────────────────────────────────
// Action
// ─────────────────────────────────────────────

/// One reducible action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Created {
        id: ResourceId,
        type_name: String,
        /// Fields applied before `initial_state` (instance pre-overrides).
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        pre_overrides: HashMap<String, FieldValue>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        initial_state: HashMap<String, FieldValue>,
        /// Set by ghost materialization: ancestor creation is already being
        /// driven iteratively, the handler must not recurse into
        /// sub-materialization.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        no_sub_materialize: bool,
    },
    Duplicated {
        id: ResourceId,
        duplicate_of: ResourceId,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        initial_state: HashMap<String, FieldValue>,
    },
    Destroyed {
        id: ResourceId,
    },
    FieldsSet {
        id: ResourceId,
        type_name: String,
        sets: HashMap<String, FieldValue>,
    },
    /// Append entries to sequence fields.
    AddedToFields {
        id: ResourceId,
        type_name: String,
        adds: HashMap<String, Vec<FieldValue>>,
    },
    /// Remove entries from sequence fields.
    RemovedFromFields {
        id: ResourceId,
        type_name: String,
        removes: HashMap<String, Vec<FieldValue>>,
    },
    Transacted {
        actions: Vec<Action>,
    },
}

impl Action {
    /// The primary resource this action acts on (`None` for transactions).
    pub fn target(&self) -> Option<&ResourceId> {
        match self {
            Self::Created { id, .. }
            | Self::Duplicated { id, .. }
            | Self::Destroyed { id }
            | Self::FieldsSet { id, .. }
            | Self::AddedToFields { id, .. }
            | Self::RemovedFromFields { id, .. } => Some(id),
            Self::Transacted { .. } => None,
        }
    }

    /// The action's tag, for logs and error context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "CREATED",
            Self::Duplicated { .. } => "DUPLICATED",
            Self::Destroyed { .. } => "DESTROYED",
            Self::FieldsSet { .. } => "FIELDS_SET",
            Self::AddedToFields { .. } => "ADDED_TO_FIELDS",
            Self::RemovedFromFields { .. } => "REMOVED_FROM_FIELDS",
            Self::Transacted { .. } => "TRANSACTED",
        }
    }
}

// ─────────────────────────────────────────────
// Command envelope
// ─────────────────────────────────────────────

/// Per-partition routing info: the event-log sequence number this command
/// was (or will be) confirmed at.
pub type PartitionInfo = HashMap<String, u64>;

/// An inbound command or replayed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: Action,
    /// Absent ⇒ locally authored, still being universalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<PartitionInfo>,
}

impl Command {
    /// A locally authored command (no routing metadata yet).
    pub fn local(action: Action) -> Self {
        Self { action, partitions: None }
    }

    /// A command already confirmed upstream, replayed downstream.
    pub fn replayed(action: Action, partitions: PartitionInfo) -> Self {
        Self { action, partitions: Some(partitions) }
    }

    /// Whether reducing this command runs in universalizing mode.
    pub fn is_being_universalized(&self) -> bool {
        self.partitions.is_none()
    }
}
