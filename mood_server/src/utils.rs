//! Utility functions
//!
use std::path::Path;

use anyhow::Result;
use reqwest::Client;

/// Download a file from a URL to a given filepath.
///
/// Content is staged in a `.part` file next to the target and renamed once complete.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    let partial = filepath.with_extension("part");
    tokio::fs::write(&partial, &content).await?;
    tokio::fs::rename(&partial, filepath).await?;

    Ok(())
}
