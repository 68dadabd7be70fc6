use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory to store cached resources. Platform default when unset.
    pub cache_directory: Option<PathBuf>,

    /// Byte budget for a pre-download request, so starting playback never
    /// waits for a full download.
    pub predownload_bytes: u64,

    /// Minimum fragment size forwarded from the network stream; smaller
    /// pieces are coalesced before they are written and delivered.
    pub forward_buffer_bytes: usize,

    /// Number of consecutive data deliveries before the coordinator signals
    /// that playback can be attempted.
    pub prebuffer_delivery_count: u32,

    /// Quiet period after the last request completes before the coordinator
    /// signals that no more requests are pending.
    pub no_more_pending_debounce_ms: u64,

    /// Connect timeout in seconds.
    pub request_timeout_secs: u64,

    /// Whole-transfer timeout in seconds.
    pub resource_timeout_secs: u64,

    /// Ceiling on the number of cached resource directories.
    pub max_cached_resources: usize,

    /// When the ceiling is exceeded, evict down to this many directories.
    pub evict_to_resources: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: None,
            predownload_bytes: 400 * 1000,
            forward_buffer_bytes: 40 * 1000,
            prebuffer_delivery_count: 6,
            no_more_pending_debounce_ms: 300,
            request_timeout_secs: 20,
            resource_timeout_secs: 60,
            max_cached_resources: 150,
            evict_to_resources: 120,
        }
    }
}

impl CacheConfig {
    /// Resolve the cache directory, using the platform cache location when
    /// none was configured.
    pub fn cache_directory(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_directory {
            Ok(dir.clone())
        } else {
            let cache_dir =
                dirs::cache_dir().ok_or_else(|| anyhow::anyhow!("Failed to get cache directory"))?;
            Ok(cache_dir.join("spool").join("media"))
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.predownload_bytes == 0 {
            return Err(anyhow::anyhow!("predownload_bytes must be greater than 0"));
        }

        if self.forward_buffer_bytes == 0 {
            return Err(anyhow::anyhow!(
                "forward_buffer_bytes must be greater than 0"
            ));
        }

        if self.request_timeout_secs == 0 || self.resource_timeout_secs == 0 {
            return Err(anyhow::anyhow!("timeouts must be greater than 0"));
        }

        if self.max_cached_resources == 0 {
            return Err(anyhow::anyhow!(
                "max_cached_resources must be greater than 0"
            ));
        }

        if self.evict_to_resources > self.max_cached_resources {
            return Err(anyhow::anyhow!(
                "evict_to_resources must not exceed max_cached_resources"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.predownload_bytes, 400_000);
        assert_eq!(config.forward_buffer_bytes, 40_000);
        assert_eq!(config.prebuffer_delivery_count, 6);
    }

    #[test]
    fn test_validation_rejects_inverted_eviction_bounds() {
        let config = CacheConfig {
            max_cached_resources: 10,
            evict_to_resources: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_cache_directory_wins() {
        let config = CacheConfig {
            cache_directory: Some(PathBuf::from("/tmp/spool-test")),
            ..Default::default()
        };
        assert_eq!(
            config.cache_directory().unwrap(),
            PathBuf::from("/tmp/spool-test")
        );
    }
}
