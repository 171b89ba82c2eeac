//! Errors returned by object storage operations.

use std::fmt;
use std::io;

use blobstore_types::StoredObject;
use thiserror::Error;

/// Errors that can occur in object storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation required an object that does not exist.
    #[error("object not found: {path}")]
    NotFound {
        /// Path of the missing object.
        path: String,
    },

    /// The backend could not be reached or refused the request.
    ///
    /// This covers transport and authentication failures, errors reported by the store itself,
    /// and storages that are not started or already shut down.
    #[error("backend unavailable: {context}")]
    BackendUnavailable {
        /// What was being attempted.
        context: String,
        /// The underlying failure, if any.
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The request is not valid for this backend, such as appending to a write-once store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Some members of a batch operation failed.
    ///
    /// Members not listed here succeeded. Nothing is rolled back.
    #[error("{} of {total} objects failed", failures.len())]
    PartialBatchFailure {
        /// Number of objects in the batch.
        total: usize,
        /// Every member that failed, with its error.
        failures: Vec<BatchFailure>,
    },

    /// A stream was released or interrupted before it completed.
    #[error("aborted: {0}")]
    Aborted(String),

    /// I/O errors from local files and payload streams.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Backend settings could not be extracted from the configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl Error {
    /// Creates a [`Error::NotFound`] for the given path.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates a [`Error::BackendUnavailable`] with a cause.
    pub fn unavailable<E>(context: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BackendUnavailable {
            context: context.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Returns `true` if this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// One failed member of a batch operation.
#[derive(Debug)]
pub struct BatchFailure {
    /// The object that could not be processed.
    pub object: StoredObject,
    /// Why it failed.
    pub error: Error,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.object, self.error)
    }
}

/// Result type for object storage operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Collects the outcome of a batch operation into a single result.
///
/// Returns `Ok` when every member succeeded and [`Error::PartialBatchFailure`] otherwise.
pub(crate) fn batch_result(total: usize, failures: Vec<BatchFailure>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }

    tracing::debug!(total, failed = failures.len(), "Batch operation partially failed");
    Err(Error::PartialBatchFailure { total, failures })
}
