use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Name of the raw payload file inside a resource directory.
const PAYLOAD_FILE: &str = "media.bin";

/// Name of the serialized range-map sidecar inside a resource directory.
const SIDECAR_FILE: &str = "ranges.json";

/// On-disk location of one cached resource: a directory keyed by a stable
/// hash of the URL, holding exactly the payload file and its sidecar.
#[derive(Debug, Clone)]
pub struct CachePaths {
    dir: PathBuf,
}

impl CachePaths {
    pub fn for_url(root: &Path, url: &str) -> Self {
        let digest = Sha256::digest(url.as_bytes());
        Self {
            dir: root.join(hex::encode(digest)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn payload(&self) -> PathBuf {
        self.dir.join(PAYLOAD_FILE)
    }

    pub fn sidecar(&self) -> PathBuf {
        self.dir.join(SIDECAR_FILE)
    }

    /// Create the resource directory and an empty payload file if they do
    /// not exist yet.
    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {:?}", self.dir))?;
        let payload = self.payload();
        if !payload.exists() {
            std::fs::File::create(&payload)
                .with_context(|| format!("Failed to create payload file {:?}", payload))?;
        }
        Ok(())
    }

    /// Actual size of the payload file on disk, 0 when absent.
    pub fn payload_size(&self) -> u64 {
        std::fs::metadata(self.payload())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}
