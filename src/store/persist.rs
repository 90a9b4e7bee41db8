//! On-disk mirror of published frames

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use super::RetentionPolicy;

pub const CURRENT_FILE: &str = "current.png";
pub const STAGING_FILE: &str = "staging.png";
pub const HISTORY_DIR: &str = "history";

/// Write `bytes` to the staging file, then rename it over `current.png`
pub(super) async fn persist_frame(
    dir: &Path,
    bytes: &[u8],
    updated: DateTime<Utc>,
    retention: RetentionPolicy,
) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let staging = dir.join(STAGING_FILE);
    tokio::fs::write(&staging, bytes).await?;
    tokio::fs::rename(&staging, dir.join(CURRENT_FILE)).await?;

    if let RetentionPolicy::History { keep } = retention {
        let history = dir.join(HISTORY_DIR);
        tokio::fs::create_dir_all(&history).await?;
        let name = format!("frame_{}.png", updated.format("%Y%m%d_%H%M%S_%6f"));
        tokio::fs::write(history.join(name), bytes).await?;

        let removed = prune_history(&history, keep).await?;
        if removed > 0 {
            debug!("Pruned {} history frame(s) in {:?}", removed, history);
        }
    }

    Ok(())
}

/// Delete the oldest `.png` files until at most `keep` remain
async fn prune_history(dir: &Path, keep: usize) -> io::Result<usize> {
    let mut frames: Vec<(SystemTime, PathBuf)> = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("png") {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        frames.push((modified, path));
    }

    if frames.len() <= keep {
        return Ok(0);
    }

    // Names embed the publish time, so they break mtime ties in order
    frames.sort();
    let excess = frames.len() - keep;
    for (_, path) in frames.iter().take(excess) {
        tokio::fs::remove_file(path).await?;
    }
    Ok(excess)
}
