use anyhow::{Context, Result};
use std::path::Path;
use std::time::SystemTime;
use tracing::{info, warn};

/// Enforce the cache ceiling: when more than `ceiling` resource directories
/// exist under `root`, delete the oldest (by creation time, modification
/// time where the filesystem records none) until `floor` remain.
///
/// Evicted resources look exactly as if they had never been fetched; a later
/// session for the same URL starts from a cold cache.
///
/// Returns the number of directories removed.
pub fn enforce_cache_limit(root: &Path, ceiling: usize, floor: usize) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut entries: Vec<(std::path::PathBuf, SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("Failed to read cache root {:?}", root))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let metadata = entry.metadata()?;
        let age = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((entry.path(), age));
    }

    if entries.len() <= ceiling {
        return Ok(0);
    }

    entries.sort_by_key(|(_, age)| *age);
    let excess = entries.len().saturating_sub(floor);

    let mut removed = 0;
    for (path, _) in entries.into_iter().take(excess) {
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to evict cached resource {:?}: {}", path, e),
        }
    }

    info!(
        "Cache cleanup at {:?}: evicted {} resources (ceiling {}, floor {})",
        root, removed, ceiling, floor
    );
    Ok(removed)
}
