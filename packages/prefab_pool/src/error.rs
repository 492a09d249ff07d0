use thiserror::Error;

use crate::InstanceId;

/// Errors that can occur when renting, returning or prepooling instances.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required argument was missing or unusable. No state was changed.
    #[error("invalid argument: '{name}' is missing or unusable")]
    InvalidArgument {
        /// Name of the argument that was rejected.
        name: &'static str,
    },

    /// The kind has no template configured, so nothing can be instantiated from it.
    #[error("the kind has no source template configured")]
    SourceMissing,

    /// The operation was cancelled by the caller before it completed.
    #[error("the operation was cancelled")]
    Cancelled,

    /// An instance was handed back to a global pool that does not know where it came from.
    ///
    /// Either it was already returned or it never belonged to this pool. The two cases
    /// cannot be told apart, so the instance is dropped.
    #[error("instance {id} is not registered with this pool or was already returned")]
    UnregisteredInstance {
        /// Identity of the instance that could not be routed.
        id: InstanceId,
    },

    /// A pool with the same token is already registered in a shared pool registry.
    #[error("a pool is already registered under the token '{token}'")]
    DuplicateToken {
        /// The token that was already taken.
        token: String,
    },

    /// The backend failed to produce an instance.
    #[error("the backend failed to instantiate: {source}")]
    Backend {
        /// The failure reported by the backend.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Wraps a backend-specific failure.
    pub fn backend(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend {
            source: source.into(),
        }
    }

    /// Whether the error only signals that the caller cancelled the operation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
