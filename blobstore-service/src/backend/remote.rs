//! Remote object store backend.
//!
//! [`RemoteStorage`] adapts any store supported by the `object_store` crate. The configured URL
//! selects the store: its host is the bucket or container and its path is a key prefix prepended to
//! every object path.
//!
//! Remote stores are write-once. Objects are uploaded with a single request when they are smaller
//! than the configured part size, and as a multipart upload otherwise. Parts are uploaded in
//! parallel on the [`WriterPool`], and the upload is only completed on finalize.

use std::any::Any;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use blobstore_types::{
    DirectoryContents, ObjectAttributes, ObjectMetadata, RelativePathWithSize, StoredObject,
    WriteMode,
};
use bytes::{Bytes, BytesMut};
use figment::Figment;
use futures_util::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, MultipartUpload, ObjectStore,
    PutMultipartOptions, PutOptions, PutPayload,
};
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{RemoteSettings, StorageConfig, StorageContext, type_mismatch};
use crate::error::{BatchFailure, Error, Result, batch_result};
use crate::pool::WriterPool;
use crate::settings::{FinalizeCallback, ReadSettings, WriteSettings};
use crate::storage::{self, BoxedStorage, DataSourceDescription, ObjectStorage, StorageCore};
use crate::stream::{self, ObjectReader, PayloadStream};
use crate::writer::{ObjectSink, ObjectWriter};

/// URL schemes whose stores keep data on this host.
const LOCAL_SCHEMES: &[&str] = &["file", "memory"];

/// Scheme of stores that hold their objects inside the client.
const MEMORY_SCHEME: &str = "memory";

/// The client state derived from [`RemoteSettings`].
///
/// Rebuilt and swapped in as a whole when the settings change.
#[derive(Debug)]
struct RemoteClient {
    store: Arc<dyn ObjectStore>,
    root: ObjectPath,
    scheme: String,
    namespace: String,
    remote: bool,
    settings: RemoteSettings,
}

impl RemoteClient {
    fn build(settings: RemoteSettings) -> Result<Self> {
        let url = parse_url(&settings.url)?;
        let options = client_options(&url, &settings);

        let (store, root) = object_store::parse_url_opts(&url, options)
            .map_err(|err| Error::unavailable(format!("failed to build client for {url}"), err))?;

        Ok(Self::with_store(Arc::from(store), root, &url, settings))
    }

    fn with_store(
        store: Arc<dyn ObjectStore>,
        root: ObjectPath,
        url: &Url,
        settings: RemoteSettings,
    ) -> Self {
        Self {
            store,
            root,
            scheme: url.scheme().to_owned(),
            namespace: url.host_str().unwrap_or_default().to_owned(),
            remote: !LOCAL_SCHEMES.contains(&url.scheme()),
            settings,
        }
    }

    /// Derives the client for new settings, keeping the store when the connection is unchanged.
    ///
    /// In-memory stores hold the objects themselves, so they are never replaced.
    fn rebind(&self, settings: RemoteSettings) -> Result<Self> {
        let url = parse_url(&settings.url)?;
        let keep_store = self.settings.same_client(&settings)
            || (self.scheme == MEMORY_SCHEME && url.scheme() == MEMORY_SCHEME);

        if !keep_store {
            return Self::build(settings);
        }

        let root = parse_root(&url)?;
        Ok(Self::with_store(Arc::clone(&self.store), root, &url, settings))
    }

    fn description(&self) -> DataSourceDescription {
        let endpoint = self
            .settings
            .options
            .iter()
            .find(|(key, _)| key.to_ascii_lowercase().contains("endpoint"))
            .map(|(_, value)| value.trim_end_matches('/').to_owned())
            .unwrap_or_default();

        DataSourceDescription {
            kind: "remote",
            scheme: self.scheme.clone(),
            endpoint,
            namespace: self.namespace.clone(),
            root: self.root.to_string(),
        }
    }

    /// Returns the store location of an object path.
    fn location(&self, path: &str) -> Result<ObjectPath> {
        let key = match self.root.as_ref() {
            "" => path.to_owned(),
            root => format!("{root}/{path}"),
        };

        ObjectPath::parse(key)
            .map_err(|err| Error::InvalidArgument(format!("invalid object path {path}: {err}")))
    }

    /// Returns the location to list for a raw prefix: its last complete directory.
    fn list_location(&self, prefix: &str) -> Result<Option<ObjectPath>> {
        let dir = match prefix.rfind('/') {
            Some(index) => &prefix[..index],
            None => "",
        };

        let location = match dir {
            "" => self.root.clone(),
            dir => self.location(dir)?,
        };
        Ok(match location.as_ref() {
            "" => None,
            _ => Some(location),
        })
    }

    /// Strips the root from a store key, returning the object path.
    fn relative<'a>(&self, key: &'a str) -> Option<&'a str> {
        match self.root.as_ref() {
            "" => Some(key),
            root => key.strip_prefix(root)?.strip_prefix('/'),
        }
    }
}

/// Storage backed by a remote object store.
#[derive(Debug)]
pub struct RemoteStorage {
    client: ArcSwap<RemoteClient>,
    pool: ArcSwap<WriterPool>,
    core: StorageCore,
}

impl RemoteStorage {
    /// Creates a storage from settings, building the store client.
    pub fn new(settings: RemoteSettings, context: &StorageContext) -> Result<Self> {
        let client = RemoteClient::build(settings)?;
        tracing::debug!(
            url = client.settings.url,
            namespace = client.namespace,
            "Created remote storage client"
        );
        Ok(Self::from_client(client, context))
    }

    /// Creates a storage using an existing store client.
    ///
    /// The URL in `settings` still determines the namespace and key prefix. Storages sharing a
    /// client copy objects between each other natively.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        settings: RemoteSettings,
        context: &StorageContext,
    ) -> Result<Self> {
        let url = parse_url(&settings.url)?;
        let root = parse_root(&url)?;

        let client = RemoteClient::with_store(store, root, &url, settings);
        Ok(Self::from_client(client, context))
    }

    fn from_client(client: RemoteClient, context: &StorageContext) -> Self {
        Self {
            client: ArcSwap::from_pointee(client),
            pool: ArcSwap::from_pointee(context.writer_pool()),
            core: StorageCore::new(context),
        }
    }

    /// Returns `true` if both storages use the same store client.
    fn shares_store(&self, other: &RemoteStorage) -> bool {
        Arc::ptr_eq(&self.client.load().store, &other.client.load().store)
    }

    /// Returns `true` if objects can be copied into `target` without leaving the store.
    ///
    /// Separate clients qualify when they point into the same bucket. In-memory stores are private
    /// to their client and only qualify when shared.
    fn copies_natively_to(&self, target: &RemoteStorage) -> bool {
        if self.shares_store(target) {
            return true;
        }

        let source = self.data_source_description();
        source.scheme != MEMORY_SCHEME && source.same_source(&target.data_source_description())
    }

    /// Checks existence of every object, recording missing ones as failures.
    async fn existing_objects(
        &self,
        client: &RemoteClient,
        objects: &[StoredObject],
        failures: &mut Vec<BatchFailure>,
    ) -> Vec<(StoredObject, ObjectPath)> {
        let mut existing = Vec::with_capacity(objects.len());
        for object in objects {
            let checked = match client.location(object.path()) {
                Ok(location) => head(client, &location, object.path())
                    .await
                    .map(|_| location),
                Err(err) => Err(err),
            };

            match checked {
                Ok(location) => existing.push((object.clone(), location)),
                Err(error) => failures.push(BatchFailure {
                    object: object.clone(),
                    error,
                }),
            }
        }
        existing
    }

    /// Deletes all objects with one bulk request stream, ignoring missing ones.
    async fn delete_batch(
        &self,
        client: &RemoteClient,
        objects: Vec<(StoredObject, ObjectPath)>,
        failures: &mut Vec<BatchFailure>,
    ) {
        if objects.is_empty() {
            return;
        }

        let locations = objects
            .iter()
            .map(|(_, location)| Ok::<_, object_store::Error>(location.clone()))
            .collect::<Vec<_>>();
        let results: Vec<_> = client
            .store
            .delete_stream(futures_util::stream::iter(locations).boxed())
            .collect()
            .await;

        for ((object, _), result) in objects.into_iter().zip(results) {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(err) => {
                    let error = Error::unavailable(format!("failed to delete {object}"), err);
                    failures.push(BatchFailure { object, error });
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for RemoteStorage {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn core(&self) -> &StorageCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_remote(&self) -> bool {
        self.client.load().remote
    }

    fn data_source_description(&self) -> DataSourceDescription {
        self.client.load().description()
    }

    fn is_write_once(&self) -> bool {
        true
    }

    fn support_parallel_write(&self) -> bool {
        true
    }

    #[tracing::instrument(level = "trace", skip_all, fields(path = object.path()))]
    async fn exists(&self, object: &StoredObject) -> Result<bool> {
        self.core.ensure_active()?;
        let client = self.client.load_full();
        let location = client.location(object.path())?;

        match head(&client, &location, object.path()).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(level = "trace", skip_all, fields(prefix, max_keys))]
    async fn find_all_files(
        &self,
        prefix: &str,
        max_keys: usize,
    ) -> Result<Vec<RelativePathWithSize>> {
        self.core.ensure_active()?;
        let client = self.client.load_full();
        let list_location = client.list_location(prefix)?;

        let mut entries = client.store.list(list_location.as_ref());
        let mut files = vec![];

        while let Some(meta) = entries
            .try_next()
            .await
            .map_err(|err| Error::unavailable(format!("failed to list {prefix}"), err))?
        {
            let Some(relative) = client.relative(meta.location.as_ref()) else {
                continue;
            };
            if !relative.starts_with(prefix) {
                continue;
            }

            files.push(RelativePathWithSize::new(relative, meta.size));
            if max_keys > 0 && files.len() >= max_keys {
                break;
            }
        }

        files.sort();
        tracing::debug!(files = files.len(), "Listed remote objects");
        Ok(files)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(prefix))]
    async fn get_directory_contents(&self, prefix: &str) -> Result<DirectoryContents> {
        // Delimiter listing only works on complete directories.
        if !(prefix.is_empty() || prefix.ends_with('/')) {
            let files = self.find_all_files(prefix, 0).await?;
            return Ok(storage::directory_contents(prefix, files));
        }

        self.core.ensure_active()?;
        let client = self.client.load_full();
        let location = match prefix.trim_end_matches('/') {
            "" => client.root.clone(),
            dir => client.location(dir)?,
        };
        let location = Some(location).filter(|l| !l.as_ref().is_empty());

        let listing = client
            .store
            .list_with_delimiter(location.as_ref())
            .await
            .map_err(|err| Error::unavailable(format!("failed to list {prefix}"), err))?;

        let files = listing
            .objects
            .iter()
            .filter_map(|meta| {
                let relative = client.relative(meta.location.as_ref())?;
                Some(RelativePathWithSize::new(relative, meta.size))
            })
            .collect();
        let directories = listing
            .common_prefixes
            .iter()
            .filter_map(|dir| client.relative(dir.as_ref()).map(str::to_owned))
            .collect();

        let mut contents = DirectoryContents { files, directories };
        contents.sort();
        Ok(contents)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(path))]
    async fn get_object_metadata(&self, path: &str) -> Result<ObjectMetadata> {
        self.core.ensure_active()?;
        let client = self.client.load_full();
        let location = client.location(path)?;

        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = client
            .store
            .get_opts(&location, options)
            .await
            .map_err(|err| store_error(err, path, "failed to get metadata of"))?;

        let attributes = result
            .attributes
            .iter()
            .filter_map(|(key, value)| match key {
                Attribute::Metadata(key) => Some((key.to_string(), value.to_string())),
                _ => None,
            })
            .collect();

        Ok(ObjectMetadata {
            size_bytes: result.meta.size,
            last_modified: Some(SystemTime::from(result.meta.last_modified)),
            attributes: Some(attributes),
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
        let client = self.client.load_full();
        let location = client.location(object.path())?;

        let result = client
            .store
            .get(&location)
            .await
            .map_err(|err| store_error(err, object.path(), "failed to read"))?;

        let size = file_size.unwrap_or(result.meta.size);
        let stream = result.into_stream().map_err(io_error).boxed();

        Ok(ObjectReader::new(stream)
            .with_size(Some(size))
            .with_chunk_size(settings.chunk_size(read_hint))
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
        let client = self.client.load_full();

        let locations = objects
            .iter()
            .map(|object| client.location(object.path()))
            .collect::<Result<Vec<_>>>()?;

        let store = Arc::clone(&client.store);
        let stream = stream::concat_lazy(locations, move |location| {
            let store = Arc::clone(&store);
            async move {
                let result = store.get(&location).await.map_err(io_error)?;
                Ok::<PayloadStream, io::Error>(result.into_stream().map_err(io_error).boxed())
            }
        });

        let size = file_size.or_else(|| storage::total_size(objects));
        Ok(ObjectReader::new(stream)
            .with_size(size)
            .with_chunk_size(settings.chunk_size(read_hint))
            .with_throttler(settings.throttler))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(path = object.path(), ?mode))]
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
        if mode == WriteMode::Append {
            return Err(Error::InvalidArgument(format!(
                "cannot append to {}: remote storage is write-once",
                object.path()
            )));
        }

        let settings = self.patch_write_settings(settings);
        let client = self.client.load_full();
        let location = client.location(object.path())?;

        let sink = RemoteSink {
            store: Arc::clone(&client.store),
            location,
            attributes: store_attributes(attributes),
            part_size: client.settings.upload_part_size.max(1),
            pool: WriterPool::clone(&self.pool.load()),
            buffer: BytesMut::new(),
            upload: None,
            parts: vec![],
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
        let client = self.client.load_full();
        let location = client.location(object.path())?;

        // Stores treat deletes of missing keys as success.
        head(&client, &location, object.path()).await?;

        client
            .store
            .delete(&location)
            .await
            .map_err(|err| store_error(err, object.path(), "failed to delete"))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(objects = objects.len()))]
    async fn remove_objects(&self, objects: &[StoredObject]) -> Result<()> {
        self.core.ensure_active()?;
        let client = self.client.load_full();

        let mut failures = vec![];
        let existing = self
            .existing_objects(&client, objects, &mut failures)
            .await;
        self.delete_batch(&client, existing, &mut failures).await;

        batch_result(objects.len(), failures)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(objects = objects.len()))]
    async fn remove_objects_if_exist(&self, objects: &[StoredObject]) -> Result<()> {
        self.core.ensure_active()?;
        let client = self.client.load_full();

        let mut failures = vec![];
        let mut batch = Vec::with_capacity(objects.len());
        for object in objects {
            match client.location(object.path()) {
                Ok(location) => batch.push((object.clone(), location)),
                Err(error) => failures.push(BatchFailure {
                    object: object.clone(),
                    error,
                }),
            }
        }
        self.delete_batch(&client, batch, &mut failures).await;

        batch_result(objects.len(), failures)
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
        // Server-side copies keep the source attributes, so replacing them needs a full copy.
        let native = destination
            .as_any()
            .downcast_ref::<RemoteStorage>()
            .filter(|target| attributes.is_none() && self.copies_natively_to(target));

        let Some(target) = native else {
            crate::copy::copy_object_through_stream(self, from, destination, to, attributes)
                .await?;
            return Ok(());
        };

        self.core.ensure_active()?;
        target.core.ensure_active()?;

        let client = self.client.load_full();
        let source = client.location(from.path())?;
        let target_location = target.client.load().location(to.path())?;

        client
            .store
            .copy(&source, &target_location)
            .await
            .map_err(|err| store_error(err, from.path(), "failed to copy"))?;

        tracing::debug!("Copied object server-side");
        Ok(())
    }

    async fn apply_new_settings(
        &self,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<()> {
        let config = StorageConfig::from_figment(config, prefix)?;
        let StorageConfig::Remote(settings) = config else {
            return Err(type_mismatch(self.name(), &config));
        };

        let current = self.client.load_full();
        if settings != current.settings {
            let client = current.rebind(settings)?;
            tracing::info!(
                url = client.settings.url,
                reconnected = !Arc::ptr_eq(&client.store, &current.store),
                "Applying new remote storage settings"
            );
            self.client.store(Arc::new(client));
        }

        self.pool.store(Arc::new(context.writer_pool()));
        self.core.throttlers().apply(&context.throttling);
        Ok(())
    }

    fn objects_namespace(&self) -> String {
        self.client.load().namespace.clone()
    }

    async fn clone_object_storage(
        &self,
        new_namespace: &str,
        config: &Figment,
        prefix: &str,
        context: &StorageContext,
    ) -> Result<BoxedStorage> {
        let config = StorageConfig::from_figment(config, prefix)?;
        let StorageConfig::Remote(mut settings) = config else {
            return Err(type_mismatch(self.name(), &config));
        };

        let mut url = parse_url(&settings.url)?;
        if LOCAL_SCHEMES.contains(&url.scheme()) {
            if !new_namespace.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "{} urls do not support namespaces",
                    url.scheme()
                )));
            }
        } else {
            let host = Some(new_namespace).filter(|n| !n.is_empty());
            url.set_host(host).map_err(|err| {
                Error::InvalidArgument(format!("invalid namespace {new_namespace}: {err}"))
            })?;
        }

        settings.url = url.to_string();
        Ok(Box::new(RemoteStorage::new(settings, context)?))
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|err| Error::InvalidArgument(format!("invalid url {url}: {err}")))
}

/// Returns the key prefix encoded in the path of a store URL.
fn parse_root(url: &Url) -> Result<ObjectPath> {
    let (_, root) = object_store::ObjectStoreScheme::parse(url)
        .map_err(|err| Error::InvalidArgument(format!("unsupported url {url}: {err}")))?;
    Ok(root)
}

/// Builds the client options, including credentials under the store-specific keys.
fn client_options(url: &Url, settings: &RemoteSettings) -> Vec<(String, String)> {
    let mut options: Vec<_> = settings
        .options
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let (key_id, secret) = match url.scheme() {
        "s3" | "s3a" => ("aws_access_key_id", "aws_secret_access_key"),
        "az" | "adl" | "azure" | "abfs" | "abfss" => {
            ("azure_storage_account_name", "azure_storage_account_key")
        }
        scheme => {
            if settings.access_key_id.is_some() || settings.secret_access_key.is_some() {
                tracing::warn!(scheme, "Ignoring access keys for store without key support");
            }
            return options;
        }
    };

    if let Some(access_key_id) = &settings.access_key_id {
        options.push((key_id.to_owned(), access_key_id.clone()));
    }
    if let Some(secret_access_key) = &settings.secret_access_key {
        let value = secret_access_key.expose_secret().as_str().to_owned();
        options.push((secret.to_owned(), value));
    }
    options
}

fn store_attributes(attributes: Option<ObjectAttributes>) -> Attributes {
    attributes
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (Attribute::Metadata(key.into()), AttributeValue::from(value)))
        .collect()
}

/// Fetches the metadata of a location, mapping missing objects to [`Error::NotFound`].
async fn head(
    client: &RemoteClient,
    location: &ObjectPath,
    path: &str,
) -> Result<object_store::ObjectMeta> {
    client
        .store
        .head(location)
        .await
        .map_err(|err| store_error(err, path, "failed to check"))
}

fn store_error(err: object_store::Error, path: &str, context: &str) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::not_found(path),
        err => Error::unavailable(format!("{context} {path}"), err),
    }
}

fn io_error(err: object_store::Error) -> io::Error {
    match err {
        object_store::Error::NotFound { .. } => io::Error::new(io::ErrorKind::NotFound, err),
        err => io::Error::other(err),
    }
}

/// Uploads an object, switching to a multipart upload once a full part has been written.
struct RemoteSink {
    store: Arc<dyn ObjectStore>,
    location: ObjectPath,
    attributes: Attributes,
    part_size: usize,
    pool: WriterPool,
    buffer: BytesMut,
    upload: Option<Box<dyn MultipartUpload>>,
    parts: Vec<JoinHandle<object_store::Result<()>>>,
}

impl RemoteSink {
    async fn upload_part(&mut self, part: Bytes) -> Result<()> {
        let mut upload = match self.upload.take() {
            Some(upload) => upload,
            None => {
                let options = PutMultipartOptions {
                    attributes: self.attributes.clone(),
                    ..Default::default()
                };
                let upload = self
                    .store
                    .put_multipart_opts(&self.location, options)
                    .await
                    .map_err(|err| {
                        store_error(err, self.location.as_ref(), "failed to start upload of")
                    })?;
                tracing::debug!(location = %self.location, "Started multipart upload");
                upload
            }
        };

        let part = upload.put_part(PutPayload::from(part));
        self.upload = Some(upload);
        let handle = self.pool.spawn(part).await?;
        self.parts.push(handle);
        Ok(())
    }

    async fn join_parts(&mut self) -> Result<()> {
        for handle in std::mem::take(&mut self.parts) {
            let result = handle.await.map_err(|err| {
                Error::Aborted(format!("part upload of {} failed: {err}", self.location))
            })?;
            result.map_err(|err| {
                store_error(err, self.location.as_ref(), "failed to upload part of")
            })?;
        }
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            let part = std::mem::take(&mut self.buffer).freeze();
            self.upload_part(part).await?;
        }
        self.join_parts().await?;

        if let Some(upload) = self.upload.as_mut() {
            upload.complete().await.map_err(|err| {
                store_error(err, self.location.as_ref(), "failed to complete upload of")
            })?;
        }
        self.upload = None;
        Ok(())
    }

    async fn discard(&mut self) {
        for handle in self.parts.drain(..) {
            handle.abort();
        }

        if let Some(mut upload) = self.upload.take() {
            if let Err(err) = upload.abort().await {
                tracing::warn!(
                    location = %self.location,
                    error = &err as &dyn std::error::Error,
                    "Failed to abort multipart upload"
                );
            }
        }
    }
}

#[async_trait]
impl ObjectSink for RemoteSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        while self.buffer.len() >= self.part_size {
            let part = self.buffer.split_to(self.part_size).freeze();
            self.upload_part(part).await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;

        if this.upload.is_none() {
            let options = PutOptions {
                attributes: this.attributes.clone(),
                ..Default::default()
            };
            let payload = PutPayload::from(std::mem::take(&mut this.buffer).freeze());
            this.store
                .put_opts(&this.location, payload, options)
                .await
                .map_err(|err| store_error(err, this.location.as_ref(), "failed to upload"))?;
            return Ok(());
        }

        if let Err(err) = this.complete().await {
            this.discard().await;
            return Err(err);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.discard().await;
        Ok(())
    }
}

impl Drop for RemoteSink {
    fn drop(&mut self) {
        for handle in self.parts.drain(..) {
            handle.abort();
        }

        let Some(mut upload) = self.upload.take() else {
            return;
        };

        let location = self.location.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = upload.abort().await {
                        tracing::warn!(
                            %location,
                            error = &err as &dyn std::error::Error,
                            "Failed to abort multipart upload"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%location, "Dropped multipart upload outside of a runtime");
            }
        }
    }
}
