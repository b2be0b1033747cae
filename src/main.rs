//! `sspctl` entry point.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    secret_sync_pipeline::cli::run().await
}
