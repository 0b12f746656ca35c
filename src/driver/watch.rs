//! Output directory watching
//!
//! The browser writes traces on its own schedule, so the driver snapshots the
//! directory before a job and polls for the one new entry afterwards.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Names of the entries currently in `dir`.
pub async fn snapshot(dir: &Path) -> Result<HashSet<OsString>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    let mut names = HashSet::new();
    while let Some(entry) = entries.next_entry().await? {
        names.insert(entry.file_name());
    }
    Ok(names)
}

/// Wait until exactly one entry not in `before` appears. `None` on timeout.
pub async fn wait_for_new_file(
    dir: &Path,
    before: &HashSet<OsString>,
    poll: Duration,
    timeout: Duration,
) -> Result<Option<PathBuf>> {
    let deadline = Instant::now() + timeout;
    loop {
        let now = snapshot(dir).await?;
        let mut fresh = now.difference(before);
        if let (Some(name), None) = (fresh.next(), fresh.next()) {
            return Ok(Some(dir.join(name)));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        debug!(dir = %dir.display(), "waiting for a new trace file");
        sleep(poll).await;
    }
}

/// Wait until the file's size is unchanged across two polls.
pub async fn wait_until_settled(path: &Path, poll: Duration, timeout: Duration) -> Result<u64> {
    let deadline = Instant::now() + timeout;
    let mut last: Option<u64> = None;
    loop {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        if last == Some(size) || Instant::now() >= deadline {
            return Ok(size);
        }
        debug!(path = %path.display(), size, "waiting for trace file to be closed");
        last = Some(size);
        sleep(poll).await;
    }
}
