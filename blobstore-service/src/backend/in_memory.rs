//! In-memory backend for tests.
//!
//! This provides an [`ObjectStorage`] backed by an ordered map, removing the need for filesystem
//! tempdir management in tests. The storage is [`Clone`] so tests can hold a handle for direct
//! inspection while the engine owns a boxed copy. Clones share objects and lifecycle.

use std::any::Any;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use blobstore_types::{
    ObjectAttributes, ObjectMetadata, RelativePathWithSize, StoredObject, WriteMode,
};
use bytes::{Bytes, BytesMut};
use figment::Figment;
use futures_util::StreamExt;

use crate::config::{InMemorySettings, StorageConfig, StorageContext, type_mismatch};
use crate::error::{Error, Result};
use crate::settings::{FinalizeCallback, ReadSettings, WriteSettings};
use crate::storage::{BoxedStorage, DataSourceDescription, ObjectStorage, StorageCore};
use crate::stream::ObjectReader;
use crate::writer::{ObjectSink, ObjectWriter};

#[derive(Clone, Debug)]
struct Entry {
    data: Bytes,
    last_modified: SystemTime,
    attributes: ObjectAttributes,
}

type Store = BTreeMap<String, Entry>;

/// Storage keeping all objects in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    namespace: String,
    store: Arc<Mutex<Store>>,
    core: Arc<StorageCore>,
}

impl InMemoryStorage {
    /// Creates an empty storage.
    pub fn new(settings: InMemorySettings, context: &StorageContext) -> Self {
        Self {
            namespace: settings.namespace,
            store: Arc::new(Mutex::new(BTreeMap::new())),
            core: Arc::new(StorageCore::new(context)),
        }
    }

    /// Returns a clone of the stored bytes, if present.
    pub fn get_stored(&self, path: &str) -> Option<Bytes> {
        self.lock().get(path).map(|entry| entry.data.clone())
    }

    /// Returns `true` if the storage contains an object at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    /// Returns `true` if the storage has no stored objects.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // NB: We intentionally use unwrap and crash if the mutex is poisoned.
        self.store.lock().unwrap()
    }

    fn get_entry(&self, path: &str) -> Result<Entry> {
        self.lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(path))
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
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
        DataSourceDescription {
            kind: self.name(),
            scheme: "memory".to_owned(),
            endpoint: String::new(),
            namespace: self.namespace.clone(),
            root: String::new(),
        }
    }

    fn supports_append(&self) -> bool {
        true
    }

    async fn exists(&self, object: &StoredObject) -> Result<bool> {
        self.core.ensure_active()?;
        Ok(self.contains(object.path()))
    }

    async fn find_all_files(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<RelativePathWithSize>> {
        self.core.ensure_active()?;

        let limit = if max_keys == 0 { usize::MAX } else { max_keys };
        let store = self.lock();
        let files = store
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(prefix))
            .take(limit)
            .map(|(path, entry)| RelativePathWithSize::new(path, entry.data.len() as u64))
            .collect();

        Ok(files)
    }

    async fn get_object_metadata(&self, path: &str) -> Result<ObjectMetadata> {
        self.core.ensure_active()?;

        let entry = self.get_entry(path)?;
        Ok(ObjectMetadata {
            size_bytes: entry.data.len() as u64,
            last_modified: Some(entry.last_modified),
            attributes: Some(entry.attributes),
        })
    }

    async fn read_object(
        &self,
        object: &StoredObject,
        settings: &ReadSettings,
        read_hint: Option<usize>,
        file_size: Option<u64>,
    ) -> Result<ObjectReader> {
        self.core.ensure_active()?;
        let settings = self.patch_read_settings(settings);

        let data = self.get_entry(object.path())?.data;
        let size = file_size.unwrap_or(data.len() as u64);
        let stream = futures_util::stream::once(async move { Ok(data) }).boxed();

        Ok(ObjectReader::new(stream)
            .with_size(Some(size))
            .with_chunk_size(settings.chunk_size(read_hint))
            .with_throttler(settings.throttler))
    }

    async fn write_object(
        &self,
        object: &StoredObject,
        mode: WriteMode,
        attributes: Option<ObjectAttributes>,
        finalize_callback: Option<FinalizeCallback>,
        buf_size: usize,
        settings: &WriteSettings,
    ) -> Result<ObjectWriter> {
        self.core.ensure_active()?;
        let settings = self.patch_write_settings(settings);

        let sink = InMemorySink {
            store: Arc::clone(&self.store),
            path: object.path().to_owned(),
            mode,
            attributes,
            buffer: BytesMut::new(),
        };

        Ok(ObjectWriter::new(
            object.path(),
            Box::new(sink),
            buf_size,
            settings.throttler,
            finalize_callback,
        ))
    }

    async fn remove_object(&self, object: &StoredObject) -> Result<()> {
        self.core.ensure_active()?;

        match self.lock().remove(object.path()) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(object.path())),
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

    async fn copy_object_to_another_object_storage(
        &self,
        from: &StoredObject,
        to: &StoredObject,
        destination: &dyn ObjectStorage,
        attributes: Option<ObjectAttributes>,
    ) -> Result<()> {
        let Some(target) = destination.as_any().downcast_ref::<InMemoryStorage>() else {
            crate::copy::copy_object_through_stream(self, from, destination, to, attributes)
                .await?;
            return Ok(());
        };

        self.core.ensure_active()?;
        target.core.ensure_active()?;

        let mut entry = self.get_entry(from.path())?;
        if let Some(attributes) = attributes {
            entry.attributes = attributes;
        }
        entry.last_modified = SystemTime::now();

        tracing::debug!(from = from.path(), to = to.path(), "Copying object in memory");
        target.lock().insert(to.path().to_owned(), entry);
        Ok(())
    }

    async fn apply_new_settings(
        &self,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<()> {
        let config = StorageConfig::from_figment(config, prefix)?;
        if !matches!(config, StorageConfig::Memory(_)) {
            return Err(type_mismatch(self.name(), &config));
        }

        self.core.throttlers().apply(&context.throttling);
        Ok(())
    }

    fn objects_namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn clone_object_storage(
        &self,
        new_namespace: &str,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<BoxedStorage> {
        let config = StorageConfig::from_figment(config, prefix)?;
        let StorageConfig::Memory(mut settings) = config else {
            return Err(type_mismatch(self.name(), &config));
        };

        settings.namespace = new_namespace.to_owned();
        Ok(Box::new(InMemoryStorage::new(settings, context)))
    }
}

/// Buffers an upload until it is committed into the store.
struct InMemorySink {
    store: Arc<Mutex<Store>>,
    path: String,
    mode: WriteMode,
    attributes: Option<ObjectAttributes>,
    buffer: BytesMut,
}

#[async_trait]
impl ObjectSink for InMemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            store,
            path,
            mode,
            attributes,
            buffer,
        } = *self;

        // NB: We intentionally use unwrap and crash if the mutex is poisoned.
        let mut store = store.lock().unwrap();
        let now = SystemTime::now();

        match (mode, store.get_mut(&path)) {
            (WriteMode::Append, Some(entry)) => {
                let mut data = BytesMut::from(entry.data.as_ref());
                data.extend_from_slice(&buffer);
                entry.data = data.freeze();
                entry.last_modified = now;
                if let Some(attributes) = attributes {
                    entry.attributes = attributes;
                }
            }
            _ => {
                let entry = Entry {
                    data: buffer.freeze(),
                    last_modified: now,
                    attributes: attributes.unwrap_or_default(),
                };
                store.insert(path, entry);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started() -> InMemoryStorage {
        let storage = InMemoryStorage::new(InMemorySettings::default(), &StorageContext::default());
        storage.startup().await.unwrap();
        storage
    }

    async fn put(storage: &InMemoryStorage, path: &str, mode: WriteMode, data: &[u8]) {
        let object = StoredObject::new(path).unwrap();
        let mut writer = storage
            .write_object(&object, mode, None, None, 4, &WriteSettings::default())
            .await
            .unwrap();
        writer.write(data).await.unwrap();
        writer.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn visible_only_after_finalize() {
        let storage = started().await;
        let object = StoredObject::new("a/1.bin").unwrap();

        let mut writer = storage
            .write_object(
                &object,
                WriteMode::Rewrite,
                None,
                None,
                4,
                &WriteSettings::default(),
            )
            .await
            .unwrap();
        writer.write(b"0123456789").await.unwrap();
        assert!(!storage.contains("a/1.bin"));

        writer.finalize().await.unwrap();
        assert_eq!(storage.get_stored("a/1.bin").unwrap(), "0123456789");
    }

    #[tokio::test]
    async fn append_extends_object() {
        let storage = started().await;
        put(&storage, "log", WriteMode::Append, b"hello").await;
        put(&storage, "log", WriteMode::Append, b" world").await;

        assert_eq!(storage.get_stored("log").unwrap(), "hello world");

        put(&storage, "log", WriteMode::Rewrite, b"reset").await;
        assert_eq!(storage.get_stored("log").unwrap(), "reset");
    }

    #[tokio::test]
    async fn copy_replaces_attributes() {
        let storage = started().await;
        let from = StoredObject::new("from").unwrap();
        let to = StoredObject::new("to").unwrap();

        let mut writer = storage
            .write_object(
                &from,
                WriteMode::Rewrite,
                Some([("owner".to_owned(), "a".to_owned())].into()),
                None,
                1024,
                &WriteSettings::default(),
            )
            .await
            .unwrap();
        writer.write(b"payload").await.unwrap();
        writer.finalize().await.unwrap();

        let attributes: ObjectAttributes = [("owner".to_owned(), "b".to_owned())].into();
        storage
            .copy_object(&from, &to, Some(attributes.clone()))
            .await
            .unwrap();

        let copied = storage.get_object_metadata("to").await.unwrap();
        assert_eq!(copied.size_bytes, 7);
        assert_eq!(copied.attributes, Some(attributes));

        let original = storage.get_object_metadata("from").await.unwrap();
        assert_eq!(original.attributes.unwrap()["owner"], "a");
    }

    #[tokio::test]
    async fn listing_uses_raw_prefix() {
        let storage = started().await;
        put(&storage, "a/1.bin", WriteMode::Rewrite, b"1").await;
        put(&storage, "a/10.bin", WriteMode::Rewrite, b"10").await;
        put(&storage, "a/2.bin", WriteMode::Rewrite, b"2").await;
        put(&storage, "b/1.bin", WriteMode::Rewrite, b"b").await;

        let files = storage.find_all_files("a/1", 0).await.unwrap();
        assert_eq!(
            files,
            vec![
                RelativePathWithSize::new("a/1.bin", 1),
                RelativePathWithSize::new("a/10.bin", 2),
            ]
        );

        assert_eq!(storage.find_all_files("", 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn clone_has_own_namespace() {
        let storage = started().await;
        put(&storage, "a", WriteMode::Rewrite, b"data").await;

        let config = Figment::from(figment::providers::Serialized::default(
            "disk",
            StorageConfig::Memory(InMemorySettings::default()),
        ));
        let clone = storage
            .clone_object_storage("other", &config, "disk", &StorageContext::default())
            .await
            .unwrap();

        assert_eq!(clone.objects_namespace(), "other");
        clone.startup().await.unwrap();
        let object = StoredObject::new("a").unwrap();
        assert!(!clone.exists(&object).await.unwrap());
    }
}
