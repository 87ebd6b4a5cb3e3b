use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The record database refused an operation.
    #[error("record store {op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: redb::Error,
    },

    /// A stored record could not be encoded or decoded.
    #[error("deployment record {deployment:?} is unreadable: {source}")]
    Codec {
        deployment: String,
        #[source]
        source: serde_json::Error,
    },

    /// Rejected before it reached the store.
    #[error("invalid record: {0}")]
    Invalid(String),
}

impl StateError {
    pub(crate) fn store(op: &'static str) -> impl FnOnce(redb::Error) -> Self {
        move |source| Self::Store { op, source }
    }

    pub(crate) fn codec(deployment: &str) -> impl FnOnce(serde_json::Error) -> Self + '_ {
        move |source| Self::Codec {
            deployment: deployment.to_string(),
            source,
        }
    }
}
