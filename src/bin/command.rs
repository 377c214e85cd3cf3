use anyhow::{bail, Context, Result};
use gcs_bigquery_loader::audit::Status;
use gcs_bigquery_loader::trigger::Trigger;
use gcs_bigquery_loader::{app, client};
use std::env::var;

/// Load a single object into BigQuery and audit the attempt, as if a
/// storage event had been received for it.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init()?;
    client::init(app::current().settings.bigquery_location.clone())?;

    let bucket = var("BUCKET").context("BUCKET is required")?;
    let name = var("OBJECT_NAME").context("OBJECT_NAME is required")?;
    let trigger = Trigger::manual(bucket, name);

    let record = app::current()
        .handle(&trigger, client::current())
        .await
        .with_context(|| format!("Failed to load object {:?}", trigger.source_uri()))?;
    if record.status == Status::Failure {
        bail!(
            "Load job for {:?} failed: {}",
            trigger.source_uri(),
            record.error_message.unwrap_or_default()
        );
    }
    Ok(())
}
