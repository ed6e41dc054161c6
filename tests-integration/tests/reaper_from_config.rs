//! Reaper construction from configuration
//!
//! Builds the reaper the way the binary does, from a storage DSN, and runs a
//! full delete/gc cycle through the `object_store` adapter.

use anyhow::Result;
use reaper::testing::create_dataset;
use reaper::{DatasetId, KeyValueStore, Reaper};
use tempfile::TempDir;
use tests_integration::{create_test_config, init_test_logging};

#[tokio::test]
async fn test_memory_dsn() -> Result<()> {
    init_test_logging();

    let config = create_test_config();
    let reaper = Reaper::from_config(&config)?;

    create_dataset(reaper.store().as_ref(), "dataset").await?;
    assert_eq!(reaper.list_datasets().await?, vec![DatasetId::new("dataset")?]);

    reaper.delete_dataset(&DatasetId::new("dataset")?).await?;
    assert!(reaper.store().keys(None).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_file_dsn_survives_restart() -> Result<()> {
    init_test_logging();

    let temp_dir = TempDir::new()?;
    let mut config = create_test_config();
    config.storage.dsn = format!("file://{}", temp_dir.path().display());

    {
        let reaper = Reaper::from_config(&config)?;
        create_dataset(reaper.store().as_ref(), "first").await?;
        create_dataset(reaper.store().as_ref(), "second").await?;
        reaper
            .store()
            .put("first/core/orphan.parquet", bytes::Bytes::from_static(b"x"))
            .await?;
    }

    // A fresh reaper over the same directory sees what the first one wrote.
    let reaper = Reaper::from_config(&config)?;
    let datasets = reaper.list_datasets().await?;
    assert_eq!(
        datasets,
        vec![DatasetId::new("first")?, DatasetId::new("second")?]
    );

    let gc = reaper.garbage_collect(&DatasetId::new("first")?).await?;
    assert_eq!(gc.deleted, vec!["first/core/orphan.parquet"]);

    let results = reaper.delete_datasets(&datasets).await;
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    assert!(reaper.list_datasets().await?.is_empty());
    assert!(reaper.store().keys(None).await?.is_empty());

    let summary = reaper.metrics().summary();
    assert_eq!(summary.datasets_deleted, 2);
    assert_eq!(summary.orphans_deleted, 1);
    Ok(())
}
