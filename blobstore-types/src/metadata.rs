//! Metadata and listing records returned by backends.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Backend-specific user metadata attached to an object.
///
/// Attributes are set when an object is written and may be replaced when it is copied.
pub type ObjectAttributes = BTreeMap<String, String>;

/// Metadata of an existing object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// The size of the object in bytes.
    pub size_bytes: u64,
    /// The time the object was last written, if the backend tracks it.
    pub last_modified: Option<SystemTime>,
    /// User metadata attached to the object, if the backend stores it.
    pub attributes: Option<ObjectAttributes>,
}

/// A listed object path together with its size.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelativePathWithSize {
    /// Path of the object relative to the backend's root.
    pub relative_path: String,
    /// Size of the object in bytes.
    pub bytes_size: u64,
}

impl RelativePathWithSize {
    /// Creates a new listing entry.
    pub fn new(relative_path: impl Into<String>, bytes_size: u64) -> Self {
        Self {
            relative_path: relative_path.into(),
            bytes_size,
        }
    }
}

/// The direct children of a prefix, split into leaf objects and nested prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryContents {
    /// Objects located directly under the prefix.
    pub files: Vec<RelativePathWithSize>,
    /// Prefixes one level below the listed prefix, without a trailing `/`.
    pub directories: Vec<String>,
}

impl DirectoryContents {
    /// Sorts files and directories by path.
    ///
    /// Backends list in arbitrary order; sorting gives callers a stable view.
    pub fn sort(&mut self) {
        self.files.sort();
        self.directories.sort();
    }
}
