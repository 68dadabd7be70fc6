use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::ops::Range;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::fetcher::{FetchEvent, RemoteFetcher};
use crate::local_file::LocalFile;
use crate::paths::CachePaths;
use crate::range_map::{Chunk, ChunkKind, RangeMap, ResourceInfo};
use crate::registry::DownloadRegistry;
use crate::store::CacheStore;

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Serve a byte range: disk for cached parts, network for the rest.
    Fetch(Range<u64>),
    /// Cache the head of the resource up to the pre-download budget.
    Prefetch,
    /// Cache the entire resource.
    PrefetchAll,
    /// Abort the current work, then serve the given range (seek).
    StopAndFetch(Range<u64>),
    /// Abort the current work and report a cancellation.
    ForceStop,
    /// Terminate the session task.
    Shutdown,
}

/// Events a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// Resource metadata is known, either from disk or from the first
    /// response headers.
    HeaderReady(ResourceInfo),
    /// One fragment of the requested range, from disk or network.
    Data {
        bytes: bytes::Bytes,
        range: Range<u64>,
    },
    /// The current fetch ended. `None` = success, `Cancelled` = clean stop,
    /// anything else is a real failure.
    Finished { error: Option<CacheError> },
}

/// Cheap handle to a running [`CacheSession`] task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn fetch(&self, range: Range<u64>) {
        let _ = self.commands.send(SessionCommand::Fetch(range));
    }

    pub fn prefetch(&self) {
        let _ = self.commands.send(SessionCommand::Prefetch);
    }

    pub fn prefetch_all(&self) {
        let _ = self.commands.send(SessionCommand::PrefetchAll);
    }

    pub fn stop_and_fetch(&self, range: Range<u64>) {
        let _ = self.commands.send(SessionCommand::StopAndFetch(range));
    }

    pub fn force_stop(&self) {
        let _ = self.commands.send(SessionCommand::ForceStop);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

/// Orchestrates the cache for one resource.
///
/// A session owns the range map, the payload file and the only
/// [`RemoteFetcher`] for its URL, and runs as a single task: commands and
/// network callbacks are processed on one loop, so chunk-list edits and file
/// I/O for a resource are totally ordered.
///
/// A requested range is resolved into an execution plan of local reads and
/// remote fetches; fetched bytes are written back to disk, recorded in the
/// range map, persisted, and forwarded to the owner.
pub struct CacheSession {
    url: Url,
    config: CacheConfig,
    map: RangeMap,
    store: CacheStore,
    file: LocalFile,
    fetcher: RemoteFetcher,
    registry: DownloadRegistry,
    plan: VecDeque<Chunk>,
    fetch_rx: Option<mpsc::UnboundedReceiver<FetchEvent>>,
    /// Range handed to the active fetch, used to detect a server that
    /// ignored it and answered with the whole resource.
    requested_range: Option<Range<u64>>,
    /// Write position for incoming body fragments.
    start_offset: u64,
    /// Open-ended download that should stop at the pre-download budget.
    predownload: bool,
    /// Whether this session currently holds the registry claim for its URL.
    registered: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl CacheSession {
    /// Create the on-disk state for `url` (reusing any persisted cache that
    /// passes validation) and spawn the session task.
    pub fn spawn(
        url: &str,
        config: CacheConfig,
        registry: DownloadRegistry,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>)> {
        let url = Url::parse(url).with_context(|| format!("Invalid resource url {url:?}"))?;
        let root = config.cache_directory()?;
        let paths = CachePaths::for_url(&root, url.as_str());

        let store = CacheStore::new(paths.clone());
        let map = store.load().unwrap_or_default();
        paths.ensure_exists()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Self {
            file: LocalFile::new(paths.payload()),
            fetcher: RemoteFetcher::new(&config),
            url,
            config,
            map,
            store,
            registry,
            plan: VecDeque::new(),
            fetch_rx: None,
            requested_range: None,
            start_offset: 0,
            predownload: false,
            registered: false,
            events: event_tx,
            commands: cmd_rx,
        };
        tokio::spawn(session.run());

        Ok((SessionHandle { commands: cmd_tx }, event_rx))
    }

    /// Whether `url` is completely cached on disk, answerable without a
    /// session: the persisted record must validate against the payload file
    /// and record one chunk spanning the whole resource.
    pub fn is_fully_cached(config: &CacheConfig, url: &str) -> bool {
        let Ok(root) = config.cache_directory() else {
            return false;
        };
        let paths = CachePaths::for_url(&root, url);
        let Some(map) = CacheStore::new(paths.clone()).load() else {
            return false;
        };
        map.fully_downloaded() && map.info.downloaded_length == paths.payload_size()
    }

    async fn run(mut self) {
        debug!("Cache session started for {}", self.url);
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(SessionCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(ev) = recv_fetch(&mut self.fetch_rx) => {
                    self.handle_fetch_event(ev).await;
                }
            }
        }
        self.teardown();
        debug!("Cache session ended for {}", self.url);
    }

    /// Shutdown path: stop quietly, keep the persisted state current.
    fn teardown(&mut self) {
        self.fetcher.stop();
        self.plan.clear();
        if let Err(e) = self.store.save(&self.map) {
            warn!("Failed to persist cache state for {}: {}", self.url, e);
        }
        if self.registered {
            self.registry.end(self.url.as_str());
            self.registered = false;
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Fetch(range) => self.fetch(range).await,
            SessionCommand::Prefetch => self.prefetch().await,
            SessionCommand::PrefetchAll => self.prefetch_all().await,
            SessionCommand::StopAndFetch(range) => {
                self.force_stop();
                self.fetch(range).await;
            }
            SessionCommand::ForceStop => self.force_stop(),
            SessionCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Resolve `range` against the range map and start executing the plan.
    async fn fetch(&mut self, mut range: Range<u64>) {
        self.predownload = false;

        let content_length = self.map.info.content_length;
        if content_length > 0 && range.end > content_length {
            range.end = content_length;
        }
        if range.start >= range.end {
            debug!("Zero-length fetch for {}, nothing to do", self.url);
            self.finish(None);
            return;
        }

        let plan = self.map.resolve(range);
        let needs_remote = plan.iter().any(|c| c.kind == ChunkKind::Remote);
        if needs_remote && !self.claim_download() {
            return;
        }

        self.plan = plan.into();
        self.announce_header();
        self.process_next().await;
    }

    /// Cache the head of the resource, capped at the pre-download budget.
    /// With an unknown content length this degrades to an open-ended
    /// download that is cancelled once the budget is reached.
    async fn prefetch(&mut self) {
        let content_length = self.map.info.content_length;
        if content_length > 0 {
            let end = self.config.predownload_bytes.min(content_length);
            self.fetch(0..end).await;
        } else {
            if !self.claim_download() {
                return;
            }
            self.predownload = true;
            self.plan.clear();
            self.start_remote(None);
        }
    }

    /// Cache the entire resource (no budget cap).
    async fn prefetch_all(&mut self) {
        let content_length = self.map.info.content_length;
        if content_length > 0 {
            self.fetch(0..content_length).await;
        } else {
            self.prefetch().await;
        }
    }

    /// Cancel any in-flight fetch, drop the remaining plan, persist, and
    /// report a cancellation. Safe to call when idle.
    fn force_stop(&mut self) {
        self.plan.clear();
        self.predownload = false;
        self.requested_range = None;
        self.fetcher.stop();
        // Queued network callbacks are stale after a cancellation.
        self.fetch_rx = None;
        self.finish(Some(CacheError::Cancelled));
    }

    /// Claim the process-wide download slot for this URL. A fetch that loses
    /// the claim is a deliberate no-op: some other session is already
    /// downloading the same resource.
    fn claim_download(&mut self) -> bool {
        if self.registered {
            return true;
        }
        if !self.registry.try_begin(self.url.as_str()) {
            info!("{} is already being downloaded, request ignored", self.url);
            return false;
        }
        self.registered = true;
        true
    }

    fn announce_header(&mut self) {
        if !self.map.info.is_empty() {
            let _ = self
                .events
                .send(SessionEvent::HeaderReady(self.map.info.clone()));
        }
    }

    /// Execute plan chunks until one requires the network or the plan runs
    /// dry. Local reads are delivered inline; a remote chunk hands control
    /// to the fetcher and the loop resumes on its completion event.
    async fn process_next(&mut self) {
        loop {
            let Some(chunk) = self.plan.pop_front() else {
                self.finish(None);
                return;
            };
            match chunk.kind {
                ChunkKind::Local => match self.file.read_range(chunk.range.clone()).await {
                    Ok(data) => {
                        debug!(
                            "Read {} cached bytes at {} for {}",
                            data.len(),
                            chunk.range.start,
                            self.url
                        );
                        let _ = self.events.send(SessionEvent::Data {
                            bytes: bytes::Bytes::from(data),
                            range: chunk.range,
                        });
                    }
                    Err(e) => {
                        error!(
                            "Cache read failed at {:?} for {}: {}",
                            chunk.range, self.url, e
                        );
                        self.plan.clear();
                        self.finish(Some(e.into()));
                        return;
                    }
                },
                ChunkKind::Remote => {
                    self.start_remote(Some(chunk.range));
                    return;
                }
            }
        }
    }

    fn start_remote(&mut self, range: Option<Range<u64>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.fetch_rx = Some(rx);
        self.start_offset = range.as_ref().map(|r| r.start).unwrap_or(0);
        self.requested_range = range.clone();
        self.fetcher.start(self.url.clone(), range, tx);
    }

    async fn handle_fetch_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::Header(header) => {
                if self.requested_range.is_some() && !header.is_partial {
                    warn!(
                        "{} ignored the range request, falling back to sequential download",
                        self.url
                    );
                    self.start_offset = 0;
                }
                if self.map.info.is_empty() {
                    self.map.info.content_type = header.content_type;
                    self.map.info.byte_range_supported = header.byte_range_supported;
                    self.map.info.content_length = header.content_length;
                    self.announce_header();
                }
            }
            FetchEvent::Body(bytes) => {
                let range = self.start_offset..self.start_offset + bytes.len() as u64;
                if let Err(e) = self.file.write_at(range.start, &bytes).await {
                    error!(
                        "Cache write failed at {:?} for {}: {}",
                        range, self.url, e
                    );
                    self.fetcher.stop();
                    self.fetch_rx = None;
                    self.plan.clear();
                    self.finish(Some(e.into()));
                    return;
                }
                self.map.insert(Chunk::local(range.clone()));
                if let Err(e) = self.store.save(&self.map) {
                    warn!("Failed to persist cache state for {}: {}", self.url, e);
                }
                self.start_offset = range.end;
                let _ = self.events.send(SessionEvent::Data { bytes, range });

                if self.predownload && self.start_offset >= self.config.predownload_bytes {
                    debug!("Pre-download budget reached for {}", self.url);
                    self.predownload = false;
                    self.requested_range = None;
                    self.fetcher.stop();
                    self.fetch_rx = None;
                    self.process_next().await;
                }
            }
            FetchEvent::Finished {
                result,
                bytes,
                elapsed,
            } => {
                self.requested_range = None;
                match result {
                    // A cancellation is a clean stop, never an error;
                    // whoever cancelled has already moved on.
                    Err(e) if e.is_cancellation() => {}
                    Err(e) => {
                        self.count_speed(bytes, elapsed);
                        self.plan.clear();
                        self.finish(Some(e));
                    }
                    Ok(()) => {
                        self.count_speed(bytes, elapsed);
                        self.process_next().await;
                    }
                }
            }
        }
    }

    /// Plan exhausted or aborted: persist the range map, release the
    /// download claim, and report the outcome.
    fn finish(&mut self, error: Option<CacheError>) {
        if let Err(e) = self.store.save(&self.map) {
            warn!("Failed to persist cache state for {}: {}", self.url, e);
        }
        if self.registered {
            self.registry.end(self.url.as_str());
            self.registered = false;
        }
        self.fetch_rx = None;
        let _ = self.events.send(SessionEvent::Finished { error });
    }

    fn count_speed(&mut self, bytes: u64, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        if ms > 0 && bytes > 0 {
            self.map.info.total_fetch_ms += ms;
            self.map.download_speed = bytes / ms;
            debug!(
                "Download speed for {}: {} bytes/ms",
                self.url, self.map.download_speed
            );
        }
    }
}

async fn recv_fetch(rx: &mut Option<mpsc::UnboundedReceiver<FetchEvent>>) -> Option<FetchEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
