//! The polymorphic object storage contract.
//!
//! [`ObjectStorage`] is implemented by every backend. Each implementation provides a small core of
//! primitives (existence, listing, metadata, read, write, delete, settings), and the trait layers
//! the derived operations on top: batch removal, if-exists variants, directory listing, the generic
//! copy fallback and the per-object settings hooks.
//!
//! Every instance goes through a simple lifecycle tracked by [`StorageCore`]:
//!
//! ```text
//! Created -> (apply_new_settings)* -> startup -> Active -> shutdown -> Terminal
//! ```
//!
//! No I/O operation is valid outside of `Active`.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use blobstore_types::{
    DirectoryContents, ObjectAttributes, ObjectMetadata, RelativePathWithSize, StoredObject,
    WriteMode,
};
use figment::Figment;

use crate::config::StorageContext;
use crate::copy;
use crate::error::{BatchFailure, Error, Result, batch_result};
use crate::settings::{FinalizeCallback, ReadSettings, WriteSettings};
use crate::stream::{self, ObjectReader};
use crate::throttle::RemoteThrottlers;
use crate::writer::ObjectWriter;

/// A type-erased, owned [`ObjectStorage`] instance.
pub type BoxedStorage = Box<dyn ObjectStorage>;

/// A shared [`ObjectStorage`] instance, as held by the storage engine.
pub type ObjectStoragePtr = Arc<dyn ObjectStorage>;

/// Uniform access to a blob backend.
///
/// Every operation is safe to call concurrently with any other operation on the same instance,
/// including [`apply_new_settings`](Self::apply_new_settings).
#[async_trait]
pub trait ObjectStorage: Debug + Send + Sync + 'static {
    /// The backend kind, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns the lifecycle and throttling state shared by all backends.
    fn core(&self) -> &StorageCore;

    /// Returns `self` for downcasting to the concrete backend.
    fn as_any(&self) -> &dyn Any;

    /// Whether objects are stored outside of this host.
    fn is_remote(&self) -> bool;

    /// Describes where this storage keeps its objects.
    ///
    /// Backends compare descriptions to decide whether a copy can stay inside the store.
    fn data_source_description(&self) -> DataSourceDescription;

    /// Whether the backend rejects all mutations.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Whether finalized objects cannot be modified or appended to in place.
    fn is_write_once(&self) -> bool {
        false
    }

    /// Whether reads may be served from a local cache layer.
    fn supports_cache(&self) -> bool {
        false
    }

    /// Whether several writers may upload parts of one logical file in parallel.
    fn support_parallel_write(&self) -> bool {
        false
    }

    /// Whether [`WriteMode::Append`] is supported.
    fn supports_append(&self) -> bool {
        false
    }

    /// Name of the cache layer in front of this backend, if any.
    fn cache_name(&self) -> Option<String> {
        None
    }

    /// Checks whether the object exists in the backend.
    async fn exists(&self, object: &StoredObject) -> Result<bool>;

    /// Lists all objects whose path starts with `prefix`, recursively.
    ///
    /// Returns at most `max_keys` entries, or every entry if `max_keys` is `0`.
    async fn find_all_files(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<RelativePathWithSize>>;

    /// Lists the direct children of `prefix`.
    ///
    /// Directories are the common prefixes one level below `prefix`, without a trailing `/`.
    async fn get_directory_contents(&self, prefix: &str) -> Result<DirectoryContents> {
        let files = self.find_all_files(prefix, 0).await?;
        Ok(directory_contents(prefix, files))
    }

    /// Returns the metadata of the object at `path`.
    ///
    /// Fails with [`Error::NotFound`] if the object does not exist.
    async fn get_object_metadata(&self, path: &str) -> Result<ObjectMetadata>;

    /// Opens an object for sequential reading.
    ///
    /// `read_hint` only sizes buffers. A `file_size` is trusted as the size of the object.
    async fn read_object(
        &self,
        object: &StoredObject,
        settings: &ReadSettings,
        read_hint: Option<usize>,
        file_size: Option<u64>,
    ) -> Result<ObjectReader>;

    /// Opens an ordered sequence of objects as one logical stream.
    ///
    /// The reader yields the exact concatenation of all objects in the given order. By default,
    /// every object is opened before the first byte is returned.
    async fn read_objects(
        &self,
        objects: &[StoredObject],
        settings: &ReadSettings,
        read_hint: Option<usize>,
        file_size: Option<u64>,
    ) -> Result<ObjectReader> {
        let mut streams = Vec::with_capacity(objects.len());
        for object in objects {
            let reader = self
                .read_object(object, settings, read_hint, object.bytes_size())
                .await?;
            streams.push(reader.into_stream());
        }

        let size = file_size.or_else(|| total_size(objects));
        Ok(ObjectReader::new(stream::concat(streams)).with_size(size))
    }

    /// Opens an object for sequential writing.
    ///
    /// The object becomes visible when the writer is finalized. `finalize_callback` runs once with
    /// the total number of bytes written. [`WriteMode::Append`] fails with
    /// [`Error::InvalidArgument`] unless the backend [supports appending](Self::supports_append).
    async fn write_object(
        &self,
        object: &StoredObject,
        mode: WriteMode,
        attributes: Option<ObjectAttributes>,
        finalize_callback: Option<FinalizeCallback>,
        buf_size: usize,
        settings: &WriteSettings,
    ) -> Result<ObjectWriter>;

    /// Removes an object, failing with [`Error::NotFound`] if it does not exist.
    async fn remove_object(&self, object: &StoredObject) -> Result<()>;

    /// Removes an object, succeeding if it does not exist.
    async fn remove_object_if_exists(&self, object: &StoredObject) -> Result<()> {
        match self.remove_object(object).await {
            Err(err) if err.is_not_found() => Ok(()),
            result => result,
        }
    }

    /// Removes all given objects.
    ///
    /// Every object is attempted. If any removal fails, the returned
    /// [`Error::PartialBatchFailure`] lists all failed objects. Nothing is rolled back.
    async fn remove_objects(&self, objects: &[StoredObject]) -> Result<()> {
        let mut failures = vec![];
        for object in objects {
            if let Err(error) = self.remove_object(object).await {
                failures.push(BatchFailure {
                    object: object.clone(),
                    error,
                });
            }
        }
        batch_result(objects.len(), failures)
    }

    /// Removes all given objects, skipping those that do not exist.
    async fn remove_objects_if_exist(&self, objects: &[StoredObject]) -> Result<()> {
        let mut failures = vec![];
        for object in objects {
            if let Err(error) = self.remove_object_if_exists(object).await {
                failures.push(BatchFailure {
                    object: object.clone(),
                    error,
                });
            }
        }
        batch_result(objects.len(), failures)
    }

    /// Copies an object within this backend, optionally replacing its attributes.
    async fn copy_object(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        attributes: Option<ObjectAttributes>,
    ) -> Result<()> {
        copy::copy_object_through_stream(self, from, self, to, attributes).await?;
        Ok(())
    }

    /// Copies an object into another backend.
    ///
    /// By default, bytes are streamed through this process. Backends override this with a native
    /// copy when `destination` shares the same underlying store.
    async fn copy_object_to_another_object_storage(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        destination: &dyn ObjectStorage,
        attributes: Option<ObjectAttributes>,
    ) -> Result<()> {
        copy::copy_object_through_stream(self, from, destination, to, attributes).await?;
        Ok(())
    }

    /// Transitions the storage into the active state.
    async fn startup(&self) -> Result<()> {
        self.core().startup(self.name())
    }

    /// Transitions the storage into the terminal state. Idempotent.
    async fn shutdown(&self) -> Result<()> {
        self.core().shutdown(self.name());
        Ok(())
    }

    /// Re-reads the backend settings at `prefix` and re-derives the throttlers.
    ///
    /// Operations that start after this returns observe the new settings. Operations in flight
    /// finish with the settings they started with.
    async fn apply_new_settings(
        &self,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<()>;

    /// Returns the bucket or container this storage is bound to, or an empty string.
    fn objects_namespace(&self) -> String;

    /// Creates an independent storage of the same kind bound to `new_namespace`.
    async fn clone_object_storage(
        &self,
        new_namespace: &str,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<BoxedStorage>;

    /// Generates the physical blob name for a new object at the logical `path`.
    fn generate_blob_name_for_path(&self, _path: &str) -> String {
        random_blob_name()
    }

    /// Returns an identifier of the object at `path` that is unique across backends.
    fn unique_id(&self, path: &str) -> String {
        path.to_owned()
    }

    /// Drops cached data for the object at `path`.
    async fn remove_cache_if_exists(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Returns read settings adjusted for the object at `path`.
    fn adjusted_read_settings(&self, settings: &ReadSettings, _path: &str) -> ReadSettings {
        settings.clone()
    }

    /// Returns write settings adjusted for the object at `path`.
    fn adjusted_write_settings(&self, settings: &WriteSettings, _path: &str) -> WriteSettings {
        settings.clone()
    }

    /// Returns read settings with this instance's read throttler, unless one was chosen.
    fn patch_read_settings(&self, settings: &ReadSettings) -> ReadSettings {
        let mut settings = settings.clone();
        if settings.throttler.is_none() {
            settings.throttler = self.core().throttlers().read();
        }
        settings
    }

    /// Returns write settings with this instance's write throttler, unless one was chosen.
    fn patch_write_settings(&self, settings: &WriteSettings) -> WriteSettings {
        let mut settings = settings.clone();
        if settings.throttler.is_none() {
            settings.throttler = self.core().throttlers().write();
        }
        settings
    }
}

/// Identifies the store behind a storage instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSourceDescription {
    /// The backend kind, as returned by [`ObjectStorage::name`].
    pub kind: &'static str,
    /// URL scheme of the store, such as `s3` or `file`.
    pub scheme: String,
    /// Service endpoint, empty for the default endpoint of the scheme.
    pub endpoint: String,
    /// Bucket, container or namespace.
    pub namespace: String,
    /// Key prefix or root directory below the namespace.
    pub root: String,
}

impl DataSourceDescription {
    /// Returns `true` if both descriptions point into the same bucket of the same store.
    ///
    /// The root is not compared, so storages on different key prefixes of one bucket share a
    /// source.
    pub fn same_source(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.scheme == other.scheme
            && self.endpoint == other.endpoint
            && self.namespace == other.namespace
    }
}

/// The lifecycle states of a storage instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageState {
    /// Constructed, settings may be applied, no I/O allowed yet.
    Created,
    /// Started, I/O is allowed.
    Active,
    /// Shut down, no further I/O is allowed.
    Terminal,
}

impl StorageState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Active,
            _ => Self::Terminal,
        }
    }
}

/// State shared by all backend implementations.
///
/// Holds the lifecycle state and the read and write throttlers of one storage instance.
#[derive(Debug)]
pub struct StorageCore {
    state: AtomicU8,
    throttlers: RemoteThrottlers,
}

impl StorageCore {
    /// Creates the state of a new storage, with throttlers derived from `context`.
    pub fn new(context: &StorageContext) -> Self {
        let throttlers = RemoteThrottlers::new();
        throttlers.apply(&context.throttling);

        Self {
            state: AtomicU8::new(StorageState::Created as u8),
            throttlers,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> StorageState {
        StorageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the throttlers of this instance.
    pub fn throttlers(&self) -> &RemoteThrottlers {
        &self.throttlers
    }

    /// Transitions from `Created` to `Active`.
    ///
    /// Starting an active storage is a no-op. Starting a terminated storage fails.
    pub fn startup(&self, name: &str) -> Result<()> {
        let result = self.state.compare_exchange(
            StorageState::Created as u8,
            StorageState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        match result.map_err(StorageState::from_u8) {
            Ok(_) => {
                tracing::info!(backend = name, "Storage started");
                Ok(())
            }
            Err(StorageState::Active) => Ok(()),
            Err(_) => Err(Error::InvalidArgument(format!(
                "{name} storage was shut down and cannot be restarted"
            ))),
        }
    }

    /// Transitions into `Terminal` from any state.
    pub fn shutdown(&self, name: &str) {
        let previous = self.state.swap(StorageState::Terminal as u8, Ordering::AcqRel);
        if StorageState::from_u8(previous) != StorageState::Terminal {
            tracing::info!(backend = name, "Storage shut down");
        }
    }

    /// Fails with [`Error::BackendUnavailable`] unless the storage is active.
    pub fn ensure_active(&self) -> Result<()> {
        let context = match self.state() {
            StorageState::Active => return Ok(()),
            StorageState::Created => "storage has not been started",
            StorageState::Terminal => "storage has been shut down",
        };

        Err(Error::BackendUnavailable {
            context: context.to_owned(),
            cause: None,
        })
    }
}

/// Characters used in generated blob names.
const BLOB_NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of the first segment of generated blob names.
const BLOB_NAME_PREFIX_LEN: usize = 3;

/// Total number of random characters in generated blob names.
const BLOB_NAME_LEN: usize = 32;

/// Generates an opaque random blob name of the form `<3 chars>/<29 chars>`.
///
/// The short first segment spreads objects across key prefixes.
pub fn random_blob_name() -> String {
    let mut random = [0u8; BLOB_NAME_LEN];
    random[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    random[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());

    let mut name = String::with_capacity(BLOB_NAME_LEN + 1);
    for (index, byte) in random.iter().enumerate() {
        if index == BLOB_NAME_PREFIX_LEN {
            name.push('/');
        }
        let char_index = *byte as usize % BLOB_NAME_ALPHABET.len();
        name.push(BLOB_NAME_ALPHABET[char_index] as char);
    }
    name
}

/// Splits a recursive listing into the direct children of `prefix`.
pub(crate) fn directory_contents(
    prefix: &str,
    entries: Vec<RelativePathWithSize>,
) -> DirectoryContents {
    let mut files = vec![];
    let mut directories = BTreeSet::new();

    for entry in entries {
        let Some(rest) = entry.relative_path.strip_prefix(prefix) else {
            continue;
        };

        match rest.find('/') {
            Some(index) => {
                directories.insert(format!("{prefix}{}", &rest[..index]));
            }
            None => files.push(entry),
        }
    }

    let mut contents = DirectoryContents {
        files,
        directories: directories.into_iter().collect(),
    };
    contents.sort();
    contents
}

/// Returns the combined size of all objects, if every size is known.
pub(crate) fn total_size(objects: &[StoredObject]) -> Option<u64> {
    objects.iter().map(StoredObject::bytes_size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_names_are_two_segments() {
        let name = random_blob_name();
        let (head, tail) = name.split_once('/').unwrap();

        assert_eq!(head.len(), 3);
        assert_eq!(tail.len(), 29);
        assert!(
            name.chars()
                .all(|c| c == '/' || c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert_ne!(random_blob_name(), name);
    }

    #[test]
    fn lifecycle_transitions() {
        let core = StorageCore::new(&StorageContext::default());
        assert_eq!(core.state(), StorageState::Created);
        assert!(matches!(
            core.ensure_active(),
            Err(Error::BackendUnavailable { .. })
        ));

        core.startup("test").unwrap();
        core.startup("test").unwrap();
        assert_eq!(core.state(), StorageState::Active);
        core.ensure_active().unwrap();

        core.shutdown("test");
        core.shutdown("test");
        assert_eq!(core.state(), StorageState::Terminal);
        assert!(core.ensure_active().is_err());
        assert!(matches!(
            core.startup("test"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn shutdown_from_created() {
        let core = StorageCore::new(&StorageContext::default());
        core.shutdown("test");
        assert_eq!(core.state(), StorageState::Terminal);
    }

    #[test]
    fn splits_direct_children() {
        let entries = vec![
            RelativePathWithSize::new("a/1.bin", 100),
            RelativePathWithSize::new("a/2.bin", 200),
            RelativePathWithSize::new("b/3.bin", 50),
            RelativePathWithSize::new("top.bin", 1),
        ];

        let contents = directory_contents("", entries.clone());
        assert_eq!(contents.files, vec![RelativePathWithSize::new("top.bin", 1)]);
        assert_eq!(contents.directories, vec!["a", "b"]);

        let contents = directory_contents("a/", entries);
        assert_eq!(contents.files.len(), 2);
        assert!(contents.directories.is_empty());
    }

    #[test]
    fn nested_directories_keep_prefix() {
        let entries = vec![
            RelativePathWithSize::new("a/x/1.bin", 1),
            RelativePathWithSize::new("a/x/y/2.bin", 1),
            RelativePathWithSize::new("a/z/3.bin", 1),
        ];

        let contents = directory_contents("a/", entries);
        assert!(contents.files.is_empty());
        assert_eq!(contents.directories, vec!["a/x", "a/z"]);
    }

    #[test]
    fn same_source_ignores_root() {
        let source = DataSourceDescription {
            kind: "remote",
            scheme: "s3".to_owned(),
            endpoint: String::new(),
            namespace: "bucket".to_owned(),
            root: "disk1".to_owned(),
        };
        let other_prefix = DataSourceDescription {
            root: "disk2".to_owned(),
            ..source.clone()
        };
        let other_bucket = DataSourceDescription {
            namespace: "other".to_owned(),
            ..source.clone()
        };

        assert!(source.same_source(&other_prefix));
        assert!(!source.same_source(&other_bucket));
    }

    #[test]
    fn total_size_needs_all_sizes() {
        let known = vec![
            StoredObject::new("a").unwrap().with_size(1),
            StoredObject::new("b").unwrap().with_size(2),
        ];
        assert_eq!(total_size(&known), Some(3));

        let unknown = vec![
            StoredObject::new("a").unwrap().with_size(1),
            StoredObject::new("b").unwrap(),
        ];
        assert_eq!(total_size(&unknown), None);
    }
}
