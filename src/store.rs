use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::paths::CachePaths;
use crate::range_map::RangeMap;

/// Persists a [`RangeMap`] as a sidecar file beside the cached payload.
///
/// Loading validates the record against the payload actually on disk: a
/// missing, unparsable, or inconsistent sidecar is a cache miss, not an
/// error, and both files are removed so the next session starts clean.
/// Save failures degrade to "re-download later"; they never fail a fetch.
#[derive(Debug, Clone)]
pub struct CacheStore {
    paths: CachePaths,
}

impl CacheStore {
    pub fn new(paths: CachePaths) -> Self {
        Self { paths }
    }

    /// Load the persisted range map, or `None` when there is no usable cache
    /// state for this resource.
    pub fn load(&self) -> Option<RangeMap> {
        let sidecar = self.paths.sidecar();
        if !sidecar.exists() || !self.paths.payload().exists() {
            return None;
        }

        let map = match std::fs::read_to_string(&sidecar)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<RangeMap>(&text).map_err(Into::into))
        {
            Ok(map) => map,
            Err(e) => {
                warn!("Discarding unreadable cache sidecar {:?}: {}", sidecar, e);
                self.discard();
                return None;
            }
        };

        let actual_size = self.paths.payload_size();
        if map.info.downloaded_length != actual_size {
            warn!(
                "Cache state mismatch for {:?}: recorded {} bytes, payload has {}",
                self.paths.dir(),
                map.info.downloaded_length,
                actual_size
            );
            self.discard();
            return None;
        }

        debug!(
            "Loaded cache state for {:?}: {} chunks, {} bytes",
            self.paths.dir(),
            map.chunks.len(),
            map.info.downloaded_length
        );
        Some(map)
    }

    /// Atomically overwrite the sidecar with the current range map.
    pub fn save(&self, map: &RangeMap) -> Result<()> {
        let contents =
            serde_json::to_string(map).context("Failed to serialize cache range map")?;

        let sidecar = self.paths.sidecar();
        let temp = sidecar.with_extension("tmp");
        std::fs::write(&temp, contents)
            .with_context(|| format!("Failed to write sidecar {:?}", temp))?;
        std::fs::rename(&temp, &sidecar)
            .with_context(|| format!("Failed to replace sidecar {:?}", sidecar))?;
        Ok(())
    }

    /// Remove both the sidecar and the payload file.
    pub fn discard(&self) {
        for path in [self.paths.sidecar(), self.paths.payload()] {
            if path.exists()
                && let Err(e) = std::fs::remove_file(&path)
            {
                warn!("Failed to remove stale cache file {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range_map::{Chunk, RangeMap};
    use tempfile::TempDir;

    fn store_in(temp: &TempDir) -> CacheStore {
        let paths = CachePaths::for_url(temp.path(), "http://example.com/a.mp4");
        paths.ensure_exists().unwrap();
        CacheStore::new(paths)
    }

    fn sample_map() -> RangeMap {
        let mut map = RangeMap::new();
        map.insert(Chunk::local(0..500));
        map.info.content_type = "video/mp4".to_string();
        map.info.content_length = 1000;
        map.info.byte_range_supported = true;
        map.download_speed = 42;
        map
    }

    #[test]
    fn test_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        let map = sample_map();

        // Payload must match the recorded downloaded length for load to
        // accept the record.
        std::fs::write(store.paths.payload(), vec![0u8; 500]).unwrap();
        store.save(&map).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_load_without_sidecar_is_none() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        assert!(store.load().is_none());
    }

    #[test]
    fn test_size_mismatch_discards_both_files() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        let map = sample_map();

        std::fs::write(store.paths.payload(), vec![0u8; 123]).unwrap();
        store.save(&map).unwrap();

        assert!(store.load().is_none());
        assert!(!store.paths.sidecar().exists());
        assert!(!store.paths.payload().exists());
    }

    #[test]
    fn test_unparsable_sidecar_discards_both_files() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        std::fs::write(store.paths.payload(), b"payload").unwrap();
        std::fs::write(store.paths.sidecar(), b"not json at all").unwrap();

        assert!(store.load().is_none());
        assert!(!store.paths.sidecar().exists());
        assert!(!store.paths.payload().exists());
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut map = sample_map();
        std::fs::write(store.paths.payload(), vec![0u8; 500]).unwrap();
        store.save(&map).unwrap();

        map.insert(Chunk::local(500..800));
        std::fs::write(store.paths.payload(), vec![0u8; 800]).unwrap();
        store.save(&map).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.info.downloaded_length, 800);
        assert_eq!(loaded.chunks, vec![Chunk::local(0..800)]);
    }
}
