//! Value types exchanged across the object storage boundary.
//!
//! These types are shared between the storage contract in `blobstore-service` and the layers
//! built on top of it, such as the path translation layer that maps logical files to
//! [`StoredObjects`](object::StoredObjects).
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod metadata;
pub mod object;

pub use metadata::{DirectoryContents, ObjectAttributes, ObjectMetadata, RelativePathWithSize};
pub use object::{InvalidObjectError, StoredObject, StoredObjects, WriteMode};
