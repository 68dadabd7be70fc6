//! Progressive byte-range disk cache for streaming media playback.
//!
//! A player asks for byte ranges of a remote resource through a
//! [`RequestCoordinator`]; the engine serves whatever is already on disk,
//! fetches only the missing sub-ranges over HTTP range requests, persists
//! every fetched byte, and multiplexes overlapping requests over a single
//! download stream. Repeated playback of the same URL is served from disk.
//!
//! ```no_run
//! use spool::{CacheConfig, CacheEvent, DownloadRegistry, RequestCoordinator};
//!
//! # async fn demo() {
//! let config = CacheConfig::default();
//! let registry = DownloadRegistry::new();
//!
//! let (handle, mut events) =
//!     RequestCoordinator::spawn("https://example.com/track.mp3", config, registry);
//! let _request = handle.submit_range_request(0..64 * 1024);
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         CacheEvent::DataDelivered { .. } => { /* feed the decoder */ }
//!         CacheEvent::RequestFinished { .. } => break,
//!         _ => {}
//!     }
//! }
//! # }
//! ```

mod config;
mod coordinator;
mod error;
mod events;
mod eviction;
mod fetcher;
mod local_file;
mod paths;
mod precache;
mod range;
mod range_map;
mod registry;
mod session;
mod store;

pub use config::CacheConfig;
pub use coordinator::{CoordinatorHandle, RequestCoordinator};
pub use error::CacheError;
pub use events::{CacheEvent, RequestId};
pub use eviction::enforce_cache_limit;
pub use precache::{Precacher, PrecacherHandle};
pub use range::RangeExt;
pub use range_map::{Chunk, ChunkKind, RangeMap, ResourceInfo};
pub use registry::DownloadRegistry;
pub use session::{CacheSession, SessionEvent, SessionHandle};

/// Whether `url` is completely cached on disk. Answerable without creating
/// any session or touching the network.
pub fn is_fully_cached(config: &CacheConfig, url: &str) -> bool {
    session::CacheSession::is_fully_cached(config, url)
}
