//! Local filesystem backend.
//!
//! Objects are stored as files under `<path>/<namespace>`. Uploads are written to a staging file
//! under `.staging/` and moved into place on commit, so partially written objects are never
//! visible. Appends are staged the same way and copied onto the end of the target on commit.

use std::any::Any;
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use blobstore_types::{
    ObjectAttributes, ObjectMetadata, RelativePathWithSize, StoredObject, WriteMode,
};
use bytes::Bytes;
use figment::Figment;
use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;

use crate::config::{LocalFsSettings, StorageConfig, StorageContext, type_mismatch};
use crate::error::{Error, Result};
use crate::settings::{FinalizeCallback, ReadSettings, WriteSettings};
use crate::storage::{self, BoxedStorage, DataSourceDescription, ObjectStorage, StorageCore};
use crate::stream::{self, ObjectReader};
use crate::writer::{ObjectSink, ObjectWriter};

/// Directory below the root holding uploads that have not been committed.
const STAGING_DIR: &str = ".staging";

#[derive(Debug)]
struct LocalFsState {
    settings: LocalFsSettings,
    root: PathBuf,
}

impl LocalFsState {
    fn new(settings: LocalFsSettings) -> Self {
        let root = match settings.namespace.as_str() {
            "" => settings.path.clone(),
            namespace => settings.path.join(namespace),
        };
        Self { settings, root }
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn staging_file(&self) -> PathBuf {
        self.staging_dir()
            .join(uuid::Uuid::new_v4().simple().to_string())
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(relative_path(path)?))
    }
}

/// Storage keeping objects as files on the local filesystem.
#[derive(Debug)]
pub struct LocalFsStorage {
    state: ArcSwap<LocalFsState>,
    core: StorageCore,
}

impl LocalFsStorage {
    /// Creates a storage rooted at the configured path.
    ///
    /// Directories are created on the first write.
    pub fn new(settings: LocalFsSettings, context: &StorageContext) -> Self {
        Self {
            state: ArcSwap::from_pointee(LocalFsState::new(settings)),
            core: StorageCore::new(context),
        }
    }

    /// Returns the directory holding the objects.
    pub fn root(&self) -> PathBuf {
        self.state.load().root.clone()
    }
}

#[async_trait]
impl ObjectStorage for LocalFsStorage {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn core(&self) -> &StorageCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn data_source_description(&self) -> DataSourceDescription {
        let state = self.state.load();
        DataSourceDescription {
            kind: self.name(),
            scheme: "file".to_owned(),
            endpoint: String::new(),
            namespace: state.settings.namespace.clone(),
            root: state.settings.path.display().to_string(),
        }
    }

    fn supports_append(&self) -> bool {
        true
    }

    #[tracing::instrument(level = "trace", skip_all, fields(path = object.path()))]
    async fn exists(&self, object: &StoredObject) -> Result<bool> {
        self.core.ensure_active()?;
        let path = self.state.load().resolve(object.path())?;

        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(level = "trace", skip_all, fields(prefix, max_keys))]
    async fn find_all_files(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<RelativePathWithSize>> {
        self.core.ensure_active()?;
        let state = self.state.load_full();

        let start = match prefix.rfind('/') {
            Some(index) => state.resolve(&prefix[..index])?,
            None => state.root.clone(),
        };

        let mut files = walk(&state.root, start, prefix).await?;
        files.sort();
        if max_keys > 0 {
            files.truncate(max_keys);
        }

        tracing::debug!(files = files.len(), "Listed local files");
        Ok(files)
    }

    async fn get_object_metadata(&self, path: &str) -> Result<ObjectMetadata> {
        self.core.ensure_active()?;
        let file_path = self.state.load().resolve(path)?;

        let metadata = match tokio::fs::metadata(&file_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(Error::not_found(path)),
            Err(err) if is_missing(&err) => return Err(Error::not_found(path)),
            Err(err) => return Err(err.into()),
        };

        Ok(ObjectMetadata {
            size_bytes: metadata.len(),
            last_modified: metadata.modified().ok(),
            attributes: None,
        })
    }

    #[tracing::instrument(level = "trace", skip_all, fields(path = object.path()))]
    async fn read_object(
        &self,
        object: &StoredObject,
        settings: &ReadSettings,
        read_hint: Option<usize>,
        file_size: Option<u64>,
    ) -> Result<ObjectReader> {
        self.core.ensure_active()?;
        let settings = self.patch_read_settings(settings);
        let path = self.state.load().resolve(object.path())?;

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if is_missing(&err) => {
                return Err(Error::not_found(object.path()));
            }
            Err(err) => return Err(err.into()),
        };

        let size = match file_size {
            Some(size) => size,
            None => file.metadata().await?.len(),
        };

        let stream = ReaderStream::with_capacity(file, settings.chunk_size(read_hint)).boxed();
        Ok(ObjectReader::new(stream)
            .with_size(Some(size))
            .with_throttler(settings.throttler))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(objects = objects.len()))]
    async fn read_objects(
        &self,
        objects: &[StoredObject],
        settings: &ReadSettings,
        read_hint: Option<usize>,
        file_size: Option<u64>,
    ) -> Result<ObjectReader> {
        self.core.ensure_active()?;
        let settings = self.patch_read_settings(settings);
        let state = self.state.load_full();

        let paths = objects
            .iter()
            .map(|object| state.resolve(object.path()))
            .collect::<Result<Vec<_>>>()?;

        let chunk_size = settings.chunk_size(read_hint);
        let stream = stream::concat_lazy(paths, move |path| async move {
            let file = File::open(path).await?;
            Ok(ReaderStream::with_capacity(file, chunk_size).boxed())
        });

        let size = file_size.or_else(|| storage::total_size(objects));
        Ok(ObjectReader::new(stream)
            .with_size(size)
            .with_throttler(settings.throttler))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(path = object.path(), ?mode))]
    async fn write_object(
        &self,
        object: &StoredObject,
        mode: WriteMode,
        _attributes: Option<ObjectAttributes>,
        finalize_callback: Option<FinalizeCallback>,
        buf_size: usize,
        settings: &WriteSettings,
    ) -> Result<ObjectWriter> {
        self.core.ensure_active()?;
        let settings = self.patch_write_settings(settings);

        let state = self.state.load_full();
        let target = state.resolve(object.path())?;
        let staging = state.staging_file();

        tokio::fs::create_dir_all(state.staging_dir()).await?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .await?;

        let sink = LocalFsSink {
            file: Some(BufWriter::new(file)),
            staging: Some(staging),
            target,
            mode,
        };

        Ok(ObjectWriter::new(
            object.path(),
            Box::new(sink),
            buf_size,
            settings.throttler,
            finalize_callback,
        ))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(path = object.path()))]
    async fn remove_object(&self, object: &StoredObject) -> Result<()> {
        self.core.ensure_active()?;
        let path = self.state.load().resolve(object.path())?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if is_missing(&err) => Err(Error::not_found(object.path())),
            Err(err) => Err(err.into()),
        }
    }

    async fn copy_object(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        attributes: Option<ObjectAttributes>,
    ) -> Result<()> {
        self.copy_object_to_another_object_storage(from, to, self, attributes)
            .await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(from = from.path(), to = to.path()))]
    async fn copy_object_to_another_object_storage(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        destination: &dyn ObjectStorage,
        attributes: Option<ObjectAttributes>,
    ) -> Result<()> {
        let Some(target) = destination.as_any().downcast_ref::<LocalFsStorage>() else {
            crate::copy::copy_object_through_stream(self, from, destination, to, attributes)
                .await?;
            return Ok(());
        };

        self.core.ensure_active()?;
        target.core.ensure_active()?;

        let source = self.state.load().resolve(from.path())?;
        let target_state = target.state.load_full();
        let destination_path = target_state.resolve(to.path())?;
        let staging = target_state.staging_file();

        tokio::fs::create_dir_all(target_state.staging_dir()).await?;
        let copied = match tokio::fs::copy(&source, &staging).await {
            Ok(copied) => copied,
            Err(err) => {
                remove_quietly(&staging).await;
                if is_missing(&err) {
                    return Err(Error::not_found(from.path()));
                }
                return Err(err.into());
            }
        };

        if let Err(err) = move_into_place(&staging, &destination_path).await {
            remove_quietly(&staging).await;
            return Err(err);
        }

        tracing::debug!(copied, "Copied file natively");
        Ok(())
    }

    async fn apply_new_settings(
        &self,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<()> {
        let config = StorageConfig::from_figment(config, prefix)?;
        let StorageConfig::Filesystem(settings) = config else {
            return Err(type_mismatch(self.name(), &config));
        };

        if settings != self.state.load().settings {
            tracing::info!(path = %settings.path.display(), "Applying new filesystem settings");
            self.state.store(Arc::new(LocalFsState::new(settings)));
        }

        self.core.throttlers().apply(&context.throttling);
        Ok(())
    }

    fn objects_namespace(&self) -> String {
        self.state.load().settings.namespace.clone()
    }

    async fn clone_object_storage(
        &self,
        new_namespace: &str,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<BoxedStorage> {
        let config = StorageConfig::from_figment(config, prefix)?;
        let StorageConfig::Filesystem(mut settings) = config else {
            return Err(type_mismatch(self.name(), &config));
        };

        relative_path(new_namespace)?;
        settings.namespace = new_namespace.to_owned();
        Ok(Box::new(LocalFsStorage::new(settings, context)))
    }
}

/// Validates an object path and converts it into a relative filesystem path.
///
/// Only plain path segments are allowed, so objects cannot escape the root or shadow the staging
/// directory.
fn relative_path(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    let mut components = relative.components().peekable();

    let escapes = components.peek().is_none()
        || components.any(|c| !matches!(c, Component::Normal(_)) || c.as_os_str() == STAGING_DIR);

    if escapes && !path.is_empty() {
        return Err(Error::InvalidArgument(format!("invalid object path: {path}")));
    }
    Ok(relative)
}

/// Returns `true` if the error means that there is no file at the path.
///
/// A path below an existing file fails with `NotADirectory` rather than `NotFound`.
fn is_missing(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

/// Converts a path below the root into a `/`-separated object path.
fn object_key(relative: &Path) -> String {
    let segments: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    segments.join("/")
}

/// Recursively lists all files below `start` whose object path starts with `prefix`.
async fn walk(root: &Path, start: PathBuf, prefix: &str) -> Result<Vec<RelativePathWithSize>> {
    let mut files = vec![];
    let mut pending = vec![start];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if is_missing(&err) => continue,
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Uploads in progress, including those of namespaces below this root.
            if entry.file_name() == STAGING_DIR {
                continue;
            }

            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let key = object_key(relative);

            // Entries removed concurrently are skipped.
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(err.into()),
            };

            if metadata.is_dir() {
                let dir_key = format!("{key}/");
                if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                    pending.push(path);
                }
            } else if metadata.is_file() && key.starts_with(prefix) {
                files.push(RelativePathWithSize::new(key, metadata.len()));
            }
        }
    }

    Ok(files)
}

/// Renames a staged file to its final location, creating parent directories.
async fn move_into_place(staging: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(staging, target).await?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = &err as &dyn std::error::Error,
                "Failed to remove staging file"
            );
        }
    }
}

/// Writes an upload into a staging file.
#[derive(Debug)]
struct LocalFsSink {
    file: Option<BufWriter<File>>,
    staging: Option<PathBuf>,
    target: PathBuf,
    mode: WriteMode,
}

impl LocalFsSink {
    fn file(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::Aborted(format!("upload to {} was closed", self.target.display())))
    }
}

#[async_trait]
impl ObjectSink for LocalFsSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.file()?.write_all(&chunk).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let mut writer = this
            .file
            .take()
            .ok_or_else(|| Error::Aborted(format!("upload to {} was closed", this.target.display())))?;
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_data().await?;
        drop(file);

        let Some(staging) = this.staging.clone() else {
            return Err(Error::Aborted(format!(
                "upload to {} was closed",
                this.target.display()
            )));
        };

        match this.mode {
            WriteMode::Rewrite => move_into_place(&staging, &this.target).await?,
            WriteMode::Append => {
                if let Some(parent) = this.target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                let mut source = File::open(&staging).await?;
                let mut target = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&this.target)
                    .await?;
                tokio::io::copy(&mut source, &mut target).await?;
                target.sync_data().await?;
                remove_quietly(&staging).await;
            }
        }

        this.staging = None;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut this = self;
        drop(this.file.take());
        if let Some(staging) = this.staging.take() {
            remove_quietly(&staging).await;
        }
        Ok(())
    }
}

impl Drop for LocalFsSink {
    fn drop(&mut self) {
        drop(self.file.take());
        if let Some(staging) = self.staging.take() {
            if let Err(err) = std::fs::remove_file(&staging) {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(
                        path = %staging.display(),
                        error = &err as &dyn std::error::Error,
                        "Failed to remove staging file"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started(dir: &Path) -> LocalFsStorage {
        let settings = LocalFsSettings {
            path: dir.to_path_buf(),
            namespace: String::new(),
        };
        let storage = LocalFsStorage::new(settings, &StorageContext::default());
        storage.startup().await.unwrap();
        storage
    }

    async fn put(storage: &LocalFsStorage, path: &str, mode: WriteMode, data: &[u8]) {
        let object = StoredObject::new(path).unwrap();
        let mut writer = storage
            .write_object(&object, mode, None, None, 3, &WriteSettings::default())
            .await
            .unwrap();
        writer.write(data).await.unwrap();
        writer.finalize().await.unwrap();
    }

    fn staged_files(root: &Path) -> usize {
        match std::fs::read_dir(root.join(STAGING_DIR)) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn stores_files_under_root() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = started(tempdir.path()).await;

        put(&storage, "store/abc/data.bin", WriteMode::Rewrite, b"oh hai!").await;

        let on_disk = std::fs::read(tempdir.path().join("store/abc/data.bin")).unwrap();
        assert_eq!(on_disk, b"oh hai!");
        assert_eq!(staged_files(tempdir.path()), 0);
    }

    #[tokio::test]
    async fn dropped_writer_leaves_nothing() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = started(tempdir.path()).await;
        let object = StoredObject::new("a/1.bin").unwrap();

        let mut writer = storage
            .write_object(
                &object,
                WriteMode::Rewrite,
                None,
                None,
                2,
                &WriteSettings::default(),
            )
            .await
            .unwrap();
        writer.write(b"partial").await.unwrap();
        assert_eq!(staged_files(tempdir.path()), 1);

        drop(writer);
        assert!(!storage.exists(&object).await.unwrap());
        assert_eq!(staged_files(tempdir.path()), 0);
    }

    #[tokio::test]
    async fn append_extends_file() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = started(tempdir.path()).await;

        put(&storage, "log", WriteMode::Append, b"hello").await;
        put(&storage, "log", WriteMode::Append, b" world").await;

        let object = StoredObject::new("log").unwrap();
        let reader = storage
            .read_object(&object, &ReadSettings::default(), None, None)
            .await
            .unwrap();
        assert_eq!(reader.size(), Some(11));
        assert_eq!(reader.read_to_end().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn listing_skips_staging() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = started(tempdir.path()).await;
        put(&storage, "a/1.bin", WriteMode::Rewrite, b"1").await;

        let object = StoredObject::new("a/2.bin").unwrap();
        let _pending = storage
            .write_object(
                &object,
                WriteMode::Rewrite,
                None,
                None,
                1,
                &WriteSettings::default(),
            )
            .await
            .unwrap();

        let files = storage.find_all_files("", 0).await.unwrap();
        assert_eq!(files, vec![RelativePathWithSize::new("a/1.bin", 1)]);
    }

    #[tokio::test]
    async fn namespaced_uploads_are_hidden_from_parent() {
        let tempdir = tempfile::tempdir().unwrap();
        let parent = started(tempdir.path()).await;

        let settings = LocalFsSettings {
            path: tempdir.path().to_path_buf(),
            namespace: "ns".to_owned(),
        };
        let child = LocalFsStorage::new(settings, &StorageContext::default());
        child.startup().await.unwrap();

        let object = StoredObject::new("pending").unwrap();
        let mut pending = child
            .write_object(
                &object,
                WriteMode::Rewrite,
                None,
                None,
                1,
                &WriteSettings::default(),
            )
            .await
            .unwrap();
        pending.write(b"abc").await.unwrap();
        put(&child, "done", WriteMode::Rewrite, b"x").await;

        let files = parent.find_all_files("", 0).await.unwrap();
        assert_eq!(files, vec![RelativePathWithSize::new("ns/done", 1)]);
    }

    #[tokio::test]
    async fn paths_below_files_are_missing() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = started(tempdir.path()).await;
        put(&storage, "a", WriteMode::Rewrite, b"file").await;

        let below = StoredObject::new("a/x").unwrap();
        assert!(!storage.exists(&below).await.unwrap());
        assert!(storage.find_all_files("a/", 0).await.unwrap().is_empty());
        assert!(storage.get_object_metadata("a/x").await.unwrap_err().is_not_found());
        assert!(storage.remove_object(&below).await.unwrap_err().is_not_found());
        storage.remove_object_if_exists(&below).await.unwrap();

        let err = storage
            .read_object(&below, &ReadSettings::default(), None, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let tempdir = tempfile::tempdir().unwrap();
        let storage = started(tempdir.path()).await;

        for path in ["../outside", "/etc/passwd", "a/../../b", ".staging/x", "a/.staging/x"] {
            let object = StoredObject::new(path).unwrap();
            let result = storage.exists(&object).await;
            assert!(
                matches!(result, Err(Error::InvalidArgument(_))),
                "{path}: {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn copies_natively_between_storages() {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let source = started(source_dir.path()).await;
        let target = started(target_dir.path()).await;

        put(&source, "a/1.bin", WriteMode::Rewrite, b"payload").await;

        let from = StoredObject::new("a/1.bin").unwrap();
        let to = StoredObject::new("b/1.bin").unwrap();
        source
            .copy_object_to_another_object_storage(&from, &to, &target, None)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(target_dir.path().join("b/1.bin")).unwrap(),
            b"payload"
        );
        assert!(source.exists(&from).await.unwrap());
        assert_eq!(staged_files(target_dir.path()), 0);

        let missing = StoredObject::new("missing").unwrap();
        let err = source
            .copy_object_to_another_object_storage(&missing, &to, &target, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn namespace_is_a_subdirectory() {
        let tempdir = tempfile::tempdir().unwrap();
        let settings = LocalFsSettings {
            path: tempdir.path().to_path_buf(),
            namespace: "shard-1".into(),
        };
        let storage = LocalFsStorage::new(settings, &StorageContext::default());
        storage.startup().await.unwrap();

        put(&storage, "x", WriteMode::Rewrite, b"x").await;
        assert!(tempdir.path().join("shard-1/x").is_file());
        assert_eq!(storage.objects_namespace(), "shard-1");
    }
}
