//! The Service layer is providing the uniform object storage abstraction, giving the storage
//! engine one contract for local disks and remote object stores.
//!
//! The central type is the [`ObjectStorage`] trait. Backends implement a small set of primitives
//! and inherit the derived operations, such as batch removal and the cross-backend copy fallback.
//! Storages are built from configuration with [`config::create_storage`]:
//!
//! ```
//! use blobstore_service::config::{self, StorageContext};
//! use blobstore_service::{ReadSettings, WriteSettings};
//! use blobstore_types::{StoredObject, WriteMode};
//! use figment::Figment;
//! use figment::providers::{Format, Yaml};
//!
//! # #[tokio::main]
//! # async fn main() -> blobstore_service::Result<()> {
//! let config = Figment::from(Yaml::string("disk:\n  type: memory\n"));
//! let storage = config::create_storage(&config, "disk", &StorageContext::default())?;
//! storage.startup().await?;
//!
//! let object = StoredObject::new("store/abc/data.bin").unwrap();
//! let mut writer = storage
//!     .write_object(&object, WriteMode::Rewrite, None, None, 1024, &WriteSettings::default())
//!     .await?;
//! writer.write(b"oh hai!").await?;
//! writer.finalize().await?;
//!
//! let reader = storage
//!     .read_object(&object, &ReadSettings::default(), None, None)
//!     .await?;
//! assert_eq!(reader.read_to_end().await?, "oh hai!");
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod config;
pub mod copy;
pub mod error;
pub mod pool;
pub mod settings;
pub mod storage;
pub mod stream;
pub mod throttle;
pub mod writer;

pub use error::{BatchFailure, Error, Result};
pub use settings::{DEFAULT_BUFFER_SIZE, FinalizeCallback, ReadSettings, WriteSettings};
pub use storage::{
    BoxedStorage, DataSourceDescription, ObjectStorage, ObjectStoragePtr, StorageCore, StorageState,
};
pub use stream::{ObjectReader, PayloadStream};
pub use writer::{ObjectSink, ObjectWriter};
