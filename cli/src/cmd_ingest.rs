//! `ingest` and `reconcile`: drive the pipeline over a recorded stream.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use txhistory_core::{Pipeline, PipelineConfig, ReplaySource};

use crate::{open_store, print_json};

fn load_source(fixture: &Path) -> Result<Arc<ReplaySource>> {
    let source = ReplaySource::from_json_file(fixture)
        .with_context(|| format!("loading replay fixture {}", fixture.display()))?;
    Ok(Arc::new(source))
}

pub async fn run(fixture: &Path, db: &str, config: PipelineConfig, follow: bool) -> Result<()> {
    let source = load_source(fixture)?;
    let store = open_store(db).await?;
    let mut pipeline = Pipeline::new(config, source, store)?;

    if !follow {
        let report = pipeline.run_until_caught_up().await?;
        return print_json(&report);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current batch");
            let _ = shutdown_tx.send(true);
        }
    });

    let checkpoint = pipeline.run(shutdown_rx).await?;
    print_json(&checkpoint)
}

pub async fn reconcile(fixture: &Path, db: &str, config: PipelineConfig) -> Result<()> {
    let source = load_source(fixture)?;
    let store = open_store(db).await?;
    let pipeline = Pipeline::new(config, source, store)?;

    let report = pipeline.reconciler().run_cycle().await?;
    print_json(&report)
}
