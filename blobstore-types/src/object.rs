//! Handles for physical blobs.
//!
//!  - [`StoredObject`] names one blob in a backend, optionally with its known size
//!  - [`StoredObjects`] is the ordered sequence of blobs making up one logical file
//!  - [`WriteMode`] selects between replacing and extending a blob

use std::fmt;

use serde::{Deserialize, Serialize};

/// One physical blob stored in a backend.
///
/// The path is relative to the backend's root and opaque to this layer. It is never empty and
/// cannot be changed once the object has been created.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawStoredObject")]
pub struct StoredObject {
    path: String,
    bytes_size: Option<u64>,
}

#[derive(Deserialize)]
struct RawStoredObject {
    path: String,
    #[serde(default)]
    bytes_size: Option<u64>,
}

impl TryFrom<RawStoredObject> for StoredObject {
    type Error = InvalidObjectError;

    fn try_from(raw: RawStoredObject) -> Result<Self, Self::Error> {
        let object = Self::new(raw.path)?;
        Ok(match raw.bytes_size {
            Some(size) => object.with_size(size),
            None => object,
        })
    }
}

impl StoredObject {
    /// Creates a handle for the blob at `path` with an unknown size.
    ///
    /// # Examples
    ///
    /// ```
    /// use blobstore_types::StoredObject;
    ///
    /// let object = StoredObject::new("store/abc/def").unwrap();
    /// assert_eq!(object.path(), "store/abc/def");
    /// assert_eq!(object.bytes_size(), None);
    ///
    /// assert!(StoredObject::new("").is_err());
    /// ```
    pub fn new(path: impl Into<String>) -> Result<Self, InvalidObjectError> {
        let path = path.into();
        if path.is_empty() {
            return Err(InvalidObjectError::EmptyPath);
        }

        Ok(Self {
            path,
            bytes_size: None,
        })
    }

    /// Attaches a known byte size to this handle.
    ///
    /// Readers trust this size and skip the metadata round-trip that would otherwise be needed.
    pub fn with_size(mut self, bytes_size: u64) -> Self {
        self.bytes_size = Some(bytes_size);
        self
    }

    /// Returns the backend-relative path of the blob.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the size of the blob, if it is known.
    pub fn bytes_size(&self) -> Option<u64> {
        self.bytes_size
    }
}

impl fmt::Display for StoredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// The ordered blobs that make up one logical file.
///
/// The order is the byte-concatenation order. Backends that cannot grow a finalized object store
/// each append as a new blob at the end of this sequence.
pub type StoredObjects = Vec<StoredObject>;

/// How a write treats an existing object at the same path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Replace the object with the written bytes.
    #[default]
    Rewrite,
    /// Extend the object with the written bytes.
    ///
    /// Only valid against backends that support appending.
    Append,
}

/// An error indicating that a [`StoredObject`] could not be created.
#[derive(Debug, thiserror::Error)]
pub enum InvalidObjectError {
    /// The object path is empty.
    #[error("object path must be non-empty")]
    EmptyPath,
}
