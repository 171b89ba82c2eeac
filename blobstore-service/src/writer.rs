//! Buffered writers for object uploads.
//!
//! [`ObjectWriter`] is the caller-facing handle. It buffers written bytes, accounts them against the
//! write throttler and hands bounded chunks to a backend [`ObjectSink`]. Nothing becomes visible
//! until [`ObjectWriter::finalize`] commits the sink.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::settings::{CallbackSlot, FinalizeCallback};
use crate::throttle::{self, Throttler};

/// The backend half of an [`ObjectWriter`].
///
/// Sinks receive chunks in the order they were written. Dropping a sink without committing it must
/// discard everything written so far.
#[async_trait]
pub trait ObjectSink: Send {
    /// Writes the next chunk.
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Makes all written chunks visible as the object.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards all written chunks.
    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Sequential writer for one object.
///
/// Obtained from [`write_object`](crate::ObjectStorage::write_object). Dropping the writer without
/// calling [`finalize`](Self::finalize) discards the upload.
pub struct ObjectWriter {
    path: String,
    sink: Option<Box<dyn ObjectSink>>,
    buffer: BytesMut,
    buf_size: usize,
    throttler: Option<Arc<Throttler>>,
    written: u64,
    callback: CallbackSlot,
}

impl ObjectWriter {
    /// Creates a writer that flushes chunks of `buf_size` bytes into the sink.
    pub fn new(
        path: impl Into<String>,
        sink: Box<dyn ObjectSink>,
        buf_size: usize,
        throttler: Option<Arc<Throttler>>,
        callback: Option<FinalizeCallback>,
    ) -> Self {
        let buf_size = buf_size.max(1);
        Self {
            path: path.into(),
            sink: Some(sink),
            buffer: BytesMut::with_capacity(buf_size),
            buf_size,
            throttler,
            written: 0,
            callback: CallbackSlot(callback),
        }
    }

    /// Returns the path of the object being written.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the number of bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Appends bytes to the object.
    ///
    /// Fails with [`Error::Aborted`] if a previous write failed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;

        self.buffer.extend_from_slice(data);
        self.written += data.len() as u64;

        while self.buffer.len() >= self.buf_size {
            let chunk = self.buffer.split_to(self.buf_size).freeze();
            self.flush_chunk(chunk).await?;
        }

        Ok(())
    }

    /// Flushes buffered bytes, commits the object and runs the finalize callback.
    ///
    /// Returns the total number of bytes written.
    pub async fn finalize(mut self) -> Result<u64> {
        self.ensure_open()?;

        if !self.buffer.is_empty() {
            let chunk = std::mem::take(&mut self.buffer).freeze();
            self.flush_chunk(chunk).await?;
        }

        let sink = self.take_sink()?;
        sink.commit().await?;
        tracing::debug!(path = self.path, size = self.written, "Object committed");

        if let Some(callback) = self.callback.0.take() {
            callback(self.written);
        }

        Ok(self.written)
    }

    /// Discards the upload.
    pub async fn abort(mut self) -> Result<()> {
        self.buffer.clear();
        match self.sink.take() {
            Some(sink) => sink.abort().await,
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.sink {
            Some(_) => Ok(()),
            None => Err(Error::Aborted(format!(
                "writer for {} was released after an error",
                self.path
            ))),
        }
    }

    fn take_sink(&mut self) -> Result<Box<dyn ObjectSink>> {
        self.ensure_open()?;
        self.sink
            .take()
            .ok_or_else(|| Error::Aborted(self.path.clone()))
    }

    async fn flush_chunk(&mut self, chunk: Bytes) -> Result<()> {
        throttle::throttle(self.throttler.as_ref(), chunk.len() as u64).await;

        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| Error::Aborted(self.path.clone()))?;

        if let Err(err) = sink.write(chunk).await {
            self.buffer.clear();
            if let Some(sink) = self.sink.take() {
                if let Err(abort_err) = sink.abort().await {
                    tracing::warn!(
                        path = self.path,
                        error = &abort_err as &dyn std::error::Error,
                        "Failed to discard upload"
                    );
                }
            }
            return Err(err);
        }

        Ok(())
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if self.sink.take().is_some() {
            tracing::debug!(path = self.path, "Writer dropped without finalize");
        }
    }
}

impl fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("path", &self.path)
            .field("buf_size", &self.buf_size)
            .field("written", &self.written)
            .field("open", &self.sink.is_some())
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}
