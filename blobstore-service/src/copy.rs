//! Backend-agnostic copy built on the read and write primitives.

use blobstore_types::{ObjectAttributes, StoredObject, WriteMode};

use crate::error::Result;
use crate::settings::{DEFAULT_BUFFER_SIZE, ReadSettings, WriteSettings};
use crate::storage::ObjectStorage;

/// Streams an object from `source` into `destination`, returning the number of bytes copied.
///
/// The destination writer is only finalized after the last chunk was written. On any error, the
/// writer is aborted and the destination object stays invisible. The source is never modified.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(
        source = source.name(),
        destination = destination.name(),
        from = from.path(),
        to = to.path(),
    )
)]
pub async fn copy_object_through_stream<S, D>(
    source: &S,
    from: &StoredObject,
    destination: &D,
    to: &StoredObject,
    attributes: Option<ObjectAttributes>,
) -> Result<u64>
where
    S: ObjectStorage + ?Sized,
    D: ObjectStorage + ?Sized,
{
    let read_settings = source.adjusted_read_settings(&ReadSettings::default(), from.path());
    let write_settings = destination.adjusted_write_settings(&WriteSettings::default(), to.path());

    let mut reader = source
        .read_object(from, &read_settings, None, from.bytes_size())
        .await?;
    let mut writer = destination
        .write_object(
            to,
            WriteMode::Rewrite,
            attributes,
            None,
            DEFAULT_BUFFER_SIZE,
            &write_settings,
        )
        .await?;

    loop {
        let chunk = match reader.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                abort_quietly(writer).await;
                return Err(err);
            }
        };

        if let Err(err) = writer.write(&chunk).await {
            abort_quietly(writer).await;
            return Err(err);
        }
    }

    let copied = writer.finalize().await?;
    tracing::debug!(copied, "Copied object through stream");
    Ok(copied)
}

async fn abort_quietly(writer: crate::writer::ObjectWriter) {
    let path = writer.path().to_owned();
    if let Err(err) = writer.abort().await {
        tracing::warn!(
            path,
            error = &err as &dyn std::error::Error,
            "Failed to abort copy destination"
        );
    }
}
