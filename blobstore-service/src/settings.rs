//! Per-operation read and write settings.

use std::fmt;
use std::sync::Arc;

use crate::throttle::Throttler;

/// Default size of read and write buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Callback invoked once with the total number of bytes when a writer is finalized.
pub type FinalizeCallback = Box<dyn FnOnce(u64) + Send + 'static>;

/// Settings for reading an object.
///
/// These are passed through opaquely. Backends honor the throttler and the buffer size, the other
/// options are hints for composed layers such as a local cache.
#[derive(Clone, Debug)]
pub struct ReadSettings {
    /// The throttler every read chunk is accounted against.
    ///
    /// When `None`, [`patch_read_settings`](crate::ObjectStorage::patch_read_settings) fills in the
    /// storage's own read throttler.
    pub throttler: Option<Arc<Throttler>>,
    /// The maximum size of chunks yielded by the reader.
    pub buffer_size: usize,
    /// Whether this read may populate or use a local cache.
    pub enable_filesystem_cache: bool,
    /// Priority of the read. Higher values are more important.
    pub priority: i64,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            throttler: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            enable_filesystem_cache: true,
            priority: 0,
        }
    }
}

impl ReadSettings {
    /// Returns the chunk size for a read, taking the length hint into account.
    ///
    /// The hint only shrinks buffers and never affects the returned content.
    pub fn chunk_size(&self, read_hint: Option<usize>) -> usize {
        let size = match read_hint {
            Some(hint) if hint > 0 => hint.min(self.buffer_size),
            _ => self.buffer_size,
        };
        size.max(1)
    }
}

/// Settings for writing an object.
#[derive(Clone, Debug)]
pub struct WriteSettings {
    /// The throttler every written chunk is accounted against.
    ///
    /// When `None`, [`patch_write_settings`](crate::ObjectStorage::patch_write_settings) fills in
    /// the storage's own write throttler.
    pub throttler: Option<Arc<Throttler>>,
    /// Whether written data may also be placed in a local cache.
    pub enable_filesystem_cache_on_write: bool,
    /// Priority of the write. Higher values are more important.
    pub priority: i64,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            throttler: None,
            enable_filesystem_cache_on_write: false,
            priority: 0,
        }
    }
}

/// Wrapper that makes an optional [`FinalizeCallback`] printable.
pub(crate) struct CallbackSlot(pub Option<FinalizeCallback>);

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Some(<callback>)"),
            None => f.write_str("None"),
        }
    }
}
