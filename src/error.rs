use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the resolution / instancing / reduction core.
///
/// Every fatal error aborts only the action currently being reduced; the
/// previously committed [`State`](crate::state::State) is never corrupted by
/// a failed reduction (no partial writes escape the scratch state).
#[derive(Debug, Error)]
pub enum GraphError {
    /// An id could not be found and is not legitimately inactive.
    #[error("unresolved reference: {raw_id} (type hint '{type_hint}')")]
    UnresolvedReference { raw_id: Uuid, type_hint: String },

    /// An id is already materialized outside the allowed idempotent /
    /// stub-promotion cases.
    #[error("duplicate creation of {raw_id} as '{type_name}'")]
    DuplicateCreation { raw_id: Uuid, type_name: String },

    /// A ghost path walk found no materialized ancestor and the caller
    /// required one.
    #[error("ghost path exhausted for {raw_id}: no materialized ancestor")]
    GhostPathExhausted { raw_id: Uuid },

    /// Schema or shape assumptions broken (instantiating an interface type
    /// directly, deleting a non-configurable field, ...). Never recovered.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A destroy would orphan live references. Fatal while universalizing;
    /// downgraded to a logged warning during downstream replay.
    #[error("destroy of {raw_id} blocked: {blockers} live reference(s) would be orphaned")]
    ReferentialIntegrityBlocked { raw_id: Uuid, blockers: usize },

    /// An inner error enriched with the enclosing passage / action context.
    /// Accumulates as the error propagates out of nested reductions, so a
    /// deep ghost-elevation failure still names the top-level command.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<GraphError>,
    },
}

impl GraphError {
    /// Wrap this error with one more frame of passage/action context.
    pub fn within(self, context: impl Into<String>) -> Self {
        Self::WithContext { context: context.into(), source: Box::new(self) }
    }

    /// The innermost (root-cause) error, past any context frames.
    pub fn root_cause(&self) -> &GraphError {
        match self {
            Self::WithContext { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Context-enrichment sugar for `Result<T, GraphError>` chains.
pub trait ResultExt<T> {
    /// Wrap the error, if any, with one frame of passage/action context.
    /// The context string is built lazily — the happy path pays nothing.
    fn within(self, context: impl FnOnce() -> String) -> Result<T, GraphError>;
}

impl<T> ResultExt<T> for Result<T, GraphError> {
    fn within(self, context: impl FnOnce() -> String) -> Result<T, GraphError> {
        self.map_err(|e| e.within(context()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_frames_accumulate() {
        let raw_id = Uuid::new_v4();
        let err = GraphError::UnresolvedReference { raw_id, type_hint: "Entity".into() }
            .within("resolving field 'owner'")
            .within("reducing CREATED");

        let msg = err.to_string();
        assert!(msg.starts_with("reducing CREATED"));
        assert!(msg.contains("resolving field 'owner'"));
        assert!(matches!(
            err.root_cause(),
            GraphError::UnresolvedReference { .. }
        ));
    }

    #[test]
    fn result_ext_is_lazy_on_ok() {
        let ok: Result<u32, GraphError> = Ok(7);
        let out = ok.within(|| unreachable!("context must not be built on Ok"));
        assert_eq!(out.unwrap(), 7);
    }
}
