use bytes::Bytes;
use std::fmt;
use std::ops::Range;

use crate::error::CacheError;

/// Identifier of one submitted range or metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events the coordinator emits to its consumer.
///
/// This is the engine's entire outbound surface: instead of a delegate
/// object, the consumer holds the receiving end of one event channel and
/// owns the coordinator, so no back-references are needed.
#[derive(Debug)]
pub enum CacheEvent {
    /// Resource metadata became available.
    HeaderReady {
        content_type: String,
        content_length: u64,
        byte_range_supported: bool,
    },
    /// Bytes satisfying (part of) a request's range. One underlying
    /// delivery can produce this event for several overlapping requests.
    DataDelivered {
        request: RequestId,
        bytes: Bytes,
        range: Range<u64>,
    },
    /// A request is done. `None` means satisfied or cleanly stopped;
    /// an error means the range could not be served.
    RequestFinished {
        request: RequestId,
        error: Option<CacheError>,
    },
    /// No request has been pending for the debounce window; the player can
    /// relax its buffering state.
    NoMorePending,
    /// Enough consecutive deliveries arrived that playback is worth
    /// attempting.
    CanPrebuffer,
    /// A real (non-cancellation) failure ended the current request; the
    /// player should rebuild or give up.
    RecoverFromError,
}
