//! Concurrent I/O interleaved with settings changes.
//!
//! I/O tasks keep writing, reading and removing objects while settings tasks keep swapping the
//! throttlers and re-applying the backend configuration. Every I/O must still succeed and return
//! the bytes that were written.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use blobstore_service::config::{self, StorageContext};
use blobstore_service::throttle::ThrottlingSettings;
use blobstore_service::{ObjectStorage, ObjectStoragePtr, ReadSettings, WriteSettings};
use blobstore_types::{StoredObject, WriteMode};
use figment::Figment;
use figment::providers::{Format, Yaml};
use tokio::task::JoinSet;

const IO_TASKS: usize = 8;
const SETTINGS_TASKS: usize = 4;
const ITERATIONS: usize = 25;

fn throttling(round: usize) -> ThrottlingSettings {
    match round % 3 {
        0 => ThrottlingSettings::default(),
        1 => ThrottlingSettings {
            max_read_bandwidth: Some(64 * 1024 * 1024),
            max_write_bandwidth: Some(32 * 1024 * 1024),
            max_burst: None,
        },
        _ => ThrottlingSettings {
            max_read_bandwidth: Some(16 * 1024 * 1024),
            max_write_bandwidth: Some(0),
            max_burst: Some(1024 * 1024),
        },
    }
}

async fn run_io(storage: ObjectStoragePtr, task: usize) -> Result<()> {
    for iteration in 0..ITERATIONS {
        let seed = (task * ITERATIONS + iteration) as u64;
        let data = blobstore_test::payload::bytes(seed, 1000 + iteration * 397);
        let object = StoredObject::new(format!("stress/{task}/{iteration}"))?;

        let mut writer = storage
            .write_object(
                &object,
                WriteMode::Rewrite,
                None,
                None,
                512,
                &WriteSettings::default(),
            )
            .await?;
        writer.write(&data).await?;
        writer.finalize().await?;

        let reader = storage
            .read_object(&object, &ReadSettings::default(), Some(333), None)
            .await?;
        assert_eq!(reader.read_to_end().await?, data);

        storage.remove_object(&object).await?;
    }

    Ok(())
}

async fn run_settings(
    storage: ObjectStoragePtr,
    configs: Arc<Vec<Figment>>,
    task: usize,
) -> Result<()> {
    for round in 0..ITERATIONS {
        let config = &configs[(task + round) % configs.len()];
        let context = StorageContext::new(throttling(task + round));
        storage.apply_new_settings(config, "disk", &context).await?;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    Ok(())
}

/// Runs the workload while settings tasks cycle through `configs`.
async fn stress(configs: Vec<Figment>) -> Result<()> {
    blobstore_test::tracing::init();

    let context = StorageContext::new(throttling(1));
    let storage: ObjectStoragePtr = config::create_storage(&configs[0], "disk", &context)?.into();
    storage.startup().await?;

    let configs = Arc::new(configs);
    let mut tasks = JoinSet::new();
    for task in 0..IO_TASKS {
        tasks.spawn(run_io(storage.clone(), task));
    }
    for task in 0..SETTINGS_TASKS {
        tasks.spawn(run_settings(storage.clone(), configs.clone(), task));
    }

    while let Some(result) = tasks.join_next().await {
        result??;
    }

    assert!(storage.find_all_files("stress/", 0).await?.is_empty());
    storage.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory() -> Result<()> {
    stress(vec![Figment::from(Yaml::string("disk:\n  type: memory\n"))]).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_filesystem() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let yaml = format!("disk:\n  type: filesystem\n  path: {}\n", dir.path().display());
    stress(vec![Figment::from(Yaml::string(&yaml))]).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote() -> Result<()> {
    // Changing the part size swaps the client settings but keeps the stored objects.
    let configs = [2048, 4096]
        .into_iter()
        .map(|part_size| {
            let yaml = format!(
                "disk:\n  type: remote\n  url: memory:///\n  upload_part_size: {part_size}\n"
            );
            Figment::from(Yaml::string(&yaml))
        })
        .collect();
    stress(configs).await
}
