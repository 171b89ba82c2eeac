//! Configuration for object storage backends.
//!
//! Backend settings are read from a [`Figment`] at a prefix, so that several storages can be
//! configured side by side in one configuration tree. The `type` field selects the backend:
//!
//! ```yaml
//! storage:
//!   type: remote
//!   url: s3://my-bucket/prefix
//!   options:
//!     aws_region: eu-central-1
//!   access_key_id: AKIA...
//!   secret_access_key: ...
//! throttling:
//!   max_read_bandwidth: 104857600
//! ```
//!
//! Every field can be overridden with environment variables prefixed by `BLOBSTORE__`, for example
//! `BLOBSTORE__STORAGE__URL=s3://other-bucket`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::{InMemoryStorage, LocalFsStorage, RemoteStorage};
use crate::error::{Error, Result};
use crate::pool::WriterPool;
use crate::storage::BoxedStorage;
use crate::throttle::ThrottlingSettings;

/// Environment variable prefix for all configuration options.
pub const ENV_PREFIX: &str = "BLOBSTORE__";

/// Default size of parts in multipart uploads.
pub const DEFAULT_UPLOAD_PART_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// A secret configuration value with a redacted [`Debug`](fmt::Debug) output.
///
/// Wrapped in a [`SecretBox`] so it is only read through [`ExposeSecret`].
#[derive(Clone, Serialize, Deserialize)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Storage backend configuration.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage (type `"filesystem"`).
    Filesystem(LocalFsSettings),
    /// In-process storage (type `"memory"`).
    Memory(InMemorySettings),
    /// Remote object store (type `"remote"`).
    Remote(RemoteSettings),
}

impl StorageConfig {
    /// Extracts the storage configuration at `prefix`.
    pub fn from_figment(config: &Figment, prefix: &str) -> Result<Self> {
        extract_settings(config, prefix)
    }

    /// Returns the backend kind selected by this configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem(_) => "filesystem",
            Self::Memory(_) => "memory",
            Self::Remote(_) => "remote",
        }
    }
}

/// Settings for [`LocalFsStorage`].
///
/// # Example
///
/// ```yaml
/// storage:
///   type: filesystem
///   path: /data
///   namespace: default
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LocalFsSettings {
    /// Root directory of the storage.
    ///
    /// The directory is created on the first write. Relative paths are resolved from the working
    /// directory.
    pub path: PathBuf,

    /// Subdirectory of `path` holding the objects.
    ///
    /// # Default
    ///
    /// Empty, meaning objects are stored directly under `path`.
    #[serde(default)]
    pub namespace: String,
}

/// Settings for [`InMemoryStorage`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct InMemorySettings {
    /// Name reported as the objects namespace.
    #[serde(default)]
    pub namespace: String,
}

/// Settings for [`RemoteStorage`].
///
/// # Example
///
/// ```yaml
/// storage:
///   type: remote
///   url: s3://my-bucket/clickhouse
///   options:
///     aws_endpoint: http://localhost:9000
///     aws_allow_http: "true"
///   access_key_id: minio
///   secret_access_key: minio123
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RemoteSettings {
    /// URL of the store.
    ///
    /// The scheme selects the store (`s3://`, `gs://`, `az://`, `http(s)://`, `file://`,
    /// `memory://`), the host is the bucket or container, and the path is a key prefix under which
    /// all objects are stored.
    pub url: String,

    /// Store-specific options passed through to the client builder.
    ///
    /// Keys follow the `object_store` configuration names, such as `aws_region`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Access key for stores using key-based authentication.
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Secret key matching [`access_key_id`](Self::access_key_id).
    #[serde(default)]
    pub secret_access_key: Option<SecretBox<ConfigSecret>>,

    /// Size of parts in multipart uploads. Objects smaller than this are uploaded at once.
    ///
    /// # Default
    ///
    /// 16 MiB
    #[serde(default = "default_upload_part_size")]
    pub upload_part_size: usize,
}

fn default_upload_part_size() -> usize {
    DEFAULT_UPLOAD_PART_SIZE
}

impl RemoteSettings {
    /// Creates settings for the given URL with default options.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: BTreeMap::new(),
            access_key_id: None,
            secret_access_key: None,
            upload_part_size: DEFAULT_UPLOAD_PART_SIZE,
        }
    }

    /// Returns `true` if both settings connect to the same store in the same way.
    ///
    /// Upload tuning such as [`upload_part_size`](Self::upload_part_size) is not compared, since
    /// it does not affect the client.
    pub fn same_client(&self, other: &Self) -> bool {
        let secret = |s: &Self| {
            s.secret_access_key
                .as_ref()
                .map(|secret| secret.expose_secret().as_str().to_owned())
        };

        self.url == other.url
            && self.options == other.options
            && self.access_key_id == other.access_key_id
            && secret(self) == secret(other)
    }
}

impl PartialEq for RemoteSettings {
    fn eq(&self, other: &Self) -> bool {
        self.same_client(other) && self.upload_part_size == other.upload_part_size
    }
}

/// Server-level context shared by all storages.
///
/// Passed to construction and to every
/// [`apply_new_settings`](crate::ObjectStorage::apply_new_settings) call.
#[derive(Clone, Debug, Default)]
pub struct StorageContext {
    /// Bandwidth limits applied to every storage.
    pub throttling: ThrottlingSettings,

    /// The pool running parallel upload tasks.
    ///
    /// Defaults to `None`, meaning the [global pool](WriterPool::global) is used.
    pub writer_pool: Option<WriterPool>,
}

impl StorageContext {
    /// Creates a context with the given throttling limits.
    pub fn new(throttling: ThrottlingSettings) -> Self {
        Self {
            throttling,
            writer_pool: None,
        }
    }

    /// Uses `pool` instead of the global pool for parallel uploads.
    pub fn with_writer_pool(mut self, pool: WriterPool) -> Self {
        self.writer_pool = Some(pool);
        self
    }

    /// Reads throttling limits from `prefix`, using no limits if the key is absent.
    pub fn from_config(config: &Figment, prefix: &str) -> Result<Self> {
        let throttling = if prefix.is_empty() || config.contains(prefix) {
            extract_settings(config, prefix)?
        } else {
            ThrottlingSettings::default()
        };
        Ok(Self::new(throttling))
    }

    /// Returns the pool for parallel uploads.
    pub fn writer_pool(&self) -> WriterPool {
        match &self.writer_pool {
            Some(pool) => pool.clone(),
            None => WriterPool::global().clone(),
        }
    }
}

/// Loads the configuration tree.
///
/// Sources are merged in the following order (later sources override earlier ones):
/// 1. YAML configuration file (if provided)
/// 2. Environment variables (prefixed with `BLOBSTORE__`)
///
/// Defaults are filled in when settings are extracted. Errors surface at extraction time.
pub fn load_config(path: Option<&Path>) -> Figment {
    let mut figment = Figment::new();
    if let Some(path) = path {
        figment = figment.merge(Yaml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Extracts typed settings at `prefix`, or from the root if `prefix` is empty.
pub fn extract_settings<T: DeserializeOwned>(config: &Figment, prefix: &str) -> Result<T> {
    let settings = if prefix.is_empty() {
        config.extract()?
    } else {
        config.extract_inner(prefix)?
    };
    Ok(settings)
}

/// Builds the storage configured at `prefix`.
///
/// The storage is returned in the created state and must be started before use.
pub fn create_storage(
    config: &Figment,
    prefix: &str,
    context: &StorageContext,
) -> Result<BoxedStorage> {
    let storage: BoxedStorage = match StorageConfig::from_figment(config, prefix)? {
        StorageConfig::Filesystem(settings) => Box::new(LocalFsStorage::new(settings, context)),
        StorageConfig::Memory(settings) => Box::new(InMemoryStorage::new(settings, context)),
        StorageConfig::Remote(settings) => Box::new(RemoteStorage::new(settings, context)?),
    };

    tracing::info!(
        backend = storage.name(),
        prefix,
        namespace = storage.objects_namespace(),
        "Created object storage"
    );
    Ok(storage)
}

/// Returns an error for a backend whose configured type changed.
pub(crate) fn type_mismatch(expected: &str, config: &StorageConfig) -> Error {
    Error::InvalidArgument(format!(
        "cannot apply {} settings to {expected} storage",
        config.kind()
    ))
}
