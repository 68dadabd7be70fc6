use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::range::RangeExt;

/// Whether a chunk of the resource is already on disk or still remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Local,
    Remote,
}

/// One contiguous piece of the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub range: Range<u64>,
}

impl Chunk {
    pub fn local(range: Range<u64>) -> Self {
        Self {
            kind: ChunkKind::Local,
            range,
        }
    }

    pub fn remote(range: Range<u64>) -> Self {
        Self {
            kind: ChunkKind::Remote,
            range,
        }
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Resource-level metadata learned from response headers and accumulated
/// while downloading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// MIME type reported by the server.
    pub content_type: String,

    /// Whether the server honors `Range` requests.
    pub byte_range_supported: bool,

    /// Total resource length in bytes (0 = not yet known).
    pub content_length: u64,

    /// Bytes currently stored on disk, kept in sync with the chunk list.
    pub downloaded_length: u64,

    /// Cumulative time spent in remote fetches, in milliseconds.
    pub total_fetch_ms: u64,
}

impl ResourceInfo {
    /// Header metadata has not been seen yet; no chunk can be trusted to
    /// describe a known resource until this turns false.
    pub fn is_empty(&self) -> bool {
        self.content_type.is_empty() || self.content_length == 0
    }
}

/// Sorted, disjoint list of cached chunks plus resource metadata.
///
/// This is the persisted record for one resource: which byte ranges exist on
/// disk, what the server told us about the resource, and the last measured
/// download speed. Pure data, no I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMap {
    pub chunks: Vec<Chunk>,
    pub info: ResourceInfo,
    /// Last measured throughput in bytes per millisecond. Logging only.
    pub download_speed: u64,
}

impl RangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk, merging it with every existing chunk it overlaps or
    /// touches until no mergeable neighbor remains. Keeps the list sorted and
    /// disjoint and recomputes `downloaded_length`.
    pub fn insert(&mut self, chunk: Chunk) {
        if chunk.is_empty() {
            return;
        }
        let mut merged = chunk;
        while let Some(pos) = self
            .chunks
            .iter()
            .position(|c| c.range.touches(&merged.range))
        {
            let existing = self.chunks.remove(pos);
            merged.range = merged.range.union_with(&existing.range);
        }
        self.chunks.push(merged);
        self.chunks.sort_by_key(|c| c.range.start);
        self.recompute_downloaded_length();
    }

    /// Resolve a requested range into an ordered execution plan: the local
    /// pieces that can be read from disk and the remote gaps that must be
    /// fetched, tiling the request exactly with no gaps and no overlaps.
    ///
    /// A zero-length request resolves to an empty plan. Clamping the request
    /// to a known content length is the caller's job; resolution itself is
    /// pure.
    pub fn resolve(&self, requested: Range<u64>) -> Vec<Chunk> {
        if requested.is_empty() {
            return Vec::new();
        }

        let mut local: Vec<Chunk> = self
            .chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Local)
            .filter_map(|c| c.range.intersect(&requested).map(Chunk::local))
            .collect();

        if local.is_empty() {
            return vec![Chunk::remote(requested)];
        }
        local.sort_by_key(|c| c.range.start);

        let mut plan = Vec::with_capacity(local.len() * 2 + 1);
        let mut cursor = requested.start;
        for piece in local {
            if piece.range.start > cursor {
                plan.push(Chunk::remote(cursor..piece.range.start));
            }
            cursor = piece.range.end;
            plan.push(piece);
        }
        if cursor < requested.end {
            plan.push(Chunk::remote(cursor..requested.end));
        }
        plan
    }

    /// True once a single local chunk spans the entire resource.
    pub fn fully_downloaded(&self) -> bool {
        match self.chunks.first() {
            Some(first) => self.info.content_length > 0 && first.len() == self.info.content_length,
            None => false,
        }
    }

    fn recompute_downloaded_length(&mut self) {
        self.info.downloaded_length = self
            .chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Local)
            .map(Chunk::len)
            .sum();
    }
}
