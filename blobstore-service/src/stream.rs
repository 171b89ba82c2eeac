//! Payload streams and the reader handle returned by object reads.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::error::Result;
use crate::throttle::Throttler;

/// Type alias for data streams used in storage APIs.
pub type PayloadStream = BoxStream<'static, io::Result<Bytes>>;

/// A sequential reader over one object or an ordered sequence of objects.
///
/// The reader is exclusively owned by the caller. Dropping it releases the underlying file handles
/// or connections, so abandoning a read is the way to cancel it.
pub struct ObjectReader {
    stream: PayloadStream,
    size: Option<u64>,
}

impl ObjectReader {
    /// Creates a reader over the given stream.
    pub fn new(stream: PayloadStream) -> Self {
        Self { stream, size: None }
    }

    /// Records the total size of the content, if known.
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// Splits chunks larger than `chunk_size`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        self.stream = self
            .stream
            .flat_map(move |result| {
                let chunks = match result {
                    Ok(mut chunk) => {
                        let mut chunks = Vec::with_capacity(chunk.len() / chunk_size + 1);
                        while chunk.len() > chunk_size {
                            chunks.push(Ok(chunk.split_to(chunk_size)));
                        }
                        chunks.push(Ok(chunk));
                        chunks
                    }
                    Err(err) => vec![Err(err)],
                };
                futures_util::stream::iter(chunks)
            })
            .boxed();
        self
    }

    /// Accounts every chunk against the throttler before handing it out.
    pub fn with_throttler(mut self, throttler: Option<Arc<Throttler>>) -> Self {
        let Some(throttler) = throttler else {
            return self;
        };

        let mut inner = self.stream;
        self.stream = async_stream::try_stream! {
            while let Some(chunk) = inner.try_next().await? {
                throttler.throttle(chunk.len() as u64).await;
                yield chunk;
            }
        }
        .boxed();
        self
    }

    /// Returns the total size of the content, if it is known up front.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Reads the next chunk, returning `None` at the end of the content.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.stream.try_next().await?)
    }

    /// Reads all remaining content into memory.
    pub async fn read_to_end(self) -> Result<Bytes> {
        let capacity = self.size.unwrap_or_default() as usize;
        let buffer = self
            .stream
            .try_fold(BytesMut::with_capacity(capacity), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }

    /// Returns the underlying stream.
    pub fn into_stream(self) -> PayloadStream {
        self.stream
    }

    /// Converts the reader into an [`AsyncRead`].
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.stream)
    }
}

impl Stream for ObjectReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReader")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Concatenates already opened streams in order.
pub(crate) fn concat(streams: Vec<PayloadStream>) -> PayloadStream {
    futures_util::stream::iter(streams).flatten().boxed()
}

/// Concatenates streams that are opened one at a time, when the previous one is exhausted.
pub(crate) fn concat_lazy<T, F, Fut>(items: Vec<T>, mut open: F) -> PayloadStream
where
    T: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<PayloadStream>> + Send,
{
    async_stream::try_stream! {
        for item in items {
            let mut stream = open(item).await?;
            while let Some(chunk) = stream.try_next().await? {
                yield chunk;
            }
        }
    }
    .boxed()
}

/// Creates a [`PayloadStream`] from a byte slice.
#[cfg(test)]
pub(crate) fn make_stream(contents: &[u8]) -> PayloadStream {
    tokio_stream::once(Ok(contents.to_vec().into())).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(chunks: &[&'static [u8]]) -> PayloadStream {
        let chunks: Vec<io::Result<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        futures_util::stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn reads_to_end() {
        let reader = ObjectReader::new(chunked(&[b"oh ", b"hai", b"!"])).with_size(Some(7));
        assert_eq!(reader.size(), Some(7));
        assert_eq!(reader.read_to_end().await.unwrap().as_ref(), b"oh hai!");
    }

    #[tokio::test]
    async fn bounds_chunk_size() {
        let mut reader = ObjectReader::new(make_stream(b"abcdefg")).with_chunk_size(3);

        let mut chunks = vec![];
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["abc", "def", "g"]);
    }

    #[tokio::test]
    async fn concatenates_in_order() {
        let stream = concat(vec![chunked(&[b"1"]), chunked(&[]), chunked(&[b"2", b"3"])]);
        let bytes = ObjectReader::new(stream).read_to_end().await.unwrap();
        assert_eq!(bytes.as_ref(), b"123");
    }

    #[tokio::test]
    async fn opens_lazily() {
        let opened = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let stream = concat_lazy(vec![&b"first"[..], &b"second"[..]], move |data| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Ok(make_stream(data)) }
        });

        let mut reader = ObjectReader::new(stream);
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 0);

        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "first");
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "second");
        assert!(reader.next_chunk().await.unwrap().is_none());
        assert_eq!(opened.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn propagates_open_errors() {
        let stream = concat_lazy(vec![0u8, 1], |idx| async move {
            match idx {
                0 => Ok(make_stream(b"ok")),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "missing")),
            }
        });

        let err = ObjectReader::new(stream).read_to_end().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_chunks() {
        let throttler = Arc::new(Throttler::new(4, 4));
        let start = tokio::time::Instant::now();

        let reader = ObjectReader::new(chunked(&[b"abcd", b"efgh"]))
            .with_throttler(Some(Arc::clone(&throttler)));
        let bytes = reader.read_to_end().await.unwrap();

        assert_eq!(bytes.as_ref(), b"abcdefgh");
        assert!(start.elapsed() >= std::time::Duration::from_secs(1));
    }
}
