//! Concrete implementations of [`ObjectStorage`](crate::ObjectStorage).

mod in_memory;
mod local_fs;
mod remote;

pub use in_memory::InMemoryStorage;
pub use local_fs::LocalFsStorage;
pub use remote::RemoteStorage;
