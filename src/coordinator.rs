use bytes::Bytes;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::events::{CacheEvent, RequestId};
use crate::range::RangeExt;
use crate::range_map::{Chunk, RangeMap, ResourceInfo};
use crate::registry::DownloadRegistry;
use crate::session::{CacheSession, SessionEvent, SessionHandle};

#[derive(Debug)]
enum CoordinatorCommand {
    Submit {
        id: RequestId,
        range: Range<u64>,
        metadata_only: bool,
    },
    Cancel(RequestId),
    Shutdown,
}

/// One outstanding consumer request.
#[derive(Debug)]
struct PendingRequest {
    id: RequestId,
    range: Range<u64>,
    metadata_only: bool,
    /// Ranges delivered so far; the request is satisfied once one merged
    /// range covers everything it asked for.
    delivered: RangeMap,
}

impl PendingRequest {
    fn new(id: RequestId, range: Range<u64>, metadata_only: bool) -> Self {
        Self {
            id,
            range,
            metadata_only,
            delivered: RangeMap::new(),
        }
    }

    /// Take the part of a delivered range this request wants, if any.
    /// Returns the sub-slice and its absolute range.
    fn accept(&mut self, bytes: &Bytes, range: &Range<u64>) -> Option<(Bytes, Range<u64>)> {
        if self.metadata_only {
            return None;
        }
        let overlap = self.range.intersect(range)?;
        let slice = bytes.slice(overlap.rebased_on(range.start));
        self.delivered.insert(Chunk::local(overlap.clone()));
        Some((slice, overlap))
    }

    fn satisfied(&self) -> bool {
        self.delivered
            .chunks
            .iter()
            .any(|c| c.range.start <= self.range.start && c.range.end >= self.range.end)
    }
}

/// Handle for submitting requests to a [`RequestCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    next_id: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Ask for a byte range of the resource. Bytes arrive as
    /// [`CacheEvent::DataDelivered`] and the request resolves with
    /// [`CacheEvent::RequestFinished`].
    pub fn submit_range_request(&self, range: Range<u64>) -> RequestId {
        let id = self.allocate_id();
        let _ = self.commands.send(CoordinatorCommand::Submit {
            id,
            range,
            metadata_only: false,
        });
        id
    }

    /// Ask for resource metadata only (content type, length, range support).
    pub fn submit_metadata_request(&self) -> RequestId {
        let id = self.allocate_id();
        let _ = self.commands.send(CoordinatorCommand::Submit {
            id,
            range: 0..0,
            metadata_only: true,
        });
        id
    }

    /// Cancel a request. The active download is aborted when the request is
    /// the one being served; the request resolves as cleanly stopped.
    pub fn cancel(&self, id: RequestId) {
        let _ = self.commands.send(CoordinatorCommand::Cancel(id));
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(CoordinatorCommand::Shutdown);
    }

    fn allocate_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Arbitrates many "read this byte range" requests against one
/// [`CacheSession`].
///
/// Requests are served one at a time in submission order, but every byte
/// delivery fans out to all pending requests whose ranges it overlaps, so
/// overlapping windows around the same playback position resolve together.
/// Cancelling the active request flips the coordinator into seeking mode:
/// requests submitted after the cancellation are served before stale queued
/// ones, which is what makes a seek land quickly.
pub struct RequestCoordinator {
    url: String,
    config: CacheConfig,
    registry: DownloadRegistry,
    session: Option<SessionHandle>,
    session_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    pending: VecDeque<PendingRequest>,
    seek_pending: VecDeque<PendingRequest>,
    seeking: bool,
    serving: Option<RequestId>,
    last_info: Option<ResourceInfo>,
    deliveries: u32,
    prebuffer_signaled: bool,
    idle_deadline: Option<Instant>,
    events: mpsc::UnboundedSender<CacheEvent>,
    commands: mpsc::UnboundedReceiver<CoordinatorCommand>,
}

impl RequestCoordinator {
    /// Spawn a coordinator for one resource. The session is created lazily
    /// on the first submitted request.
    pub fn spawn(
        url: impl Into<String>,
        config: CacheConfig,
        registry: DownloadRegistry,
    ) -> (CoordinatorHandle, mpsc::UnboundedReceiver<CacheEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            url: url.into(),
            config,
            registry,
            session: None,
            session_rx: None,
            pending: VecDeque::new(),
            seek_pending: VecDeque::new(),
            seeking: false,
            serving: None,
            last_info: None,
            deliveries: 0,
            prebuffer_signaled: false,
            idle_deadline: None,
            events: event_tx,
            commands: cmd_rx,
        };
        tokio::spawn(coordinator.run());

        let handle = CoordinatorHandle {
            commands: cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (handle, event_rx)
    }

    async fn run(mut self) {
        debug!("Request coordinator started for {}", self.url);
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(CoordinatorCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(ev) = recv_session(&mut self.session_rx) => {
                    self.handle_session_event(ev);
                }
                _ = sleep_until_deadline(self.idle_deadline) => {
                    self.idle_deadline = None;
                    debug!("No more pending requests for {}", self.url);
                    let _ = self.events.send(CacheEvent::NoMorePending);
                }
            }
        }
        if let Some(session) = &self.session {
            session.shutdown();
        }
        debug!("Request coordinator ended for {}", self.url);
    }

    fn handle_command(&mut self, cmd: CoordinatorCommand) {
        match cmd {
            CoordinatorCommand::Submit {
                id,
                range,
                metadata_only,
            } => self.submit(id, range, metadata_only),
            CoordinatorCommand::Cancel(id) => self.cancel(id),
            CoordinatorCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn submit(&mut self, id: RequestId, range: Range<u64>, metadata_only: bool) {
        debug!(
            "Request {} submitted for {}: range {:?}, metadata_only {}",
            id, self.url, range, metadata_only
        );
        self.idle_deadline = None;

        if self.session.is_none() && !self.create_session(id) {
            return;
        }

        // Metadata already known: answer without involving the session.
        if metadata_only && self.last_info.is_some() {
            self.announce_info();
            let _ = self.events.send(CacheEvent::RequestFinished {
                request: id,
                error: None,
            });
            return;
        }

        let request = PendingRequest::new(id, range, metadata_only);
        if self.seeking {
            self.seek_pending.push_back(request);
        } else {
            self.pending.push_back(request);
        }

        if self.serving.is_none() {
            self.dispatch_next();
        }
    }

    fn create_session(&mut self, failing_request: RequestId) -> bool {
        match CacheSession::spawn(&self.url, self.config.clone(), self.registry.clone()) {
            Ok((handle, rx)) => {
                self.session = Some(handle);
                self.session_rx = Some(rx);
                true
            }
            Err(e) => {
                error!("Failed to create cache session for {}: {}", self.url, e);
                let _ = self.events.send(CacheEvent::RequestFinished {
                    request: failing_request,
                    error: Some(CacheError::Storage(std::io::Error::other(e.to_string()))),
                });
                let _ = self.events.send(CacheEvent::RecoverFromError);
                false
            }
        }
    }

    fn cancel(&mut self, id: RequestId) {
        let was_serving = self.serving == Some(id);
        if self.remove_request(id).is_some() {
            debug!("Request {} cancelled for {}", id, self.url);
            let _ = self.events.send(CacheEvent::RequestFinished {
                request: id,
                error: None,
            });
        }

        if was_serving {
            // The next submission is a seek target; serve it before any
            // stale queued request for the abandoned region.
            self.serving = None;
            self.seeking = true;
            self.deliveries = 0;
            self.prebuffer_signaled = false;
            if let Some(session) = &self.session {
                session.force_stop();
            }
        }
    }

    fn dispatch_next(&mut self) {
        let (id, range, metadata_only, from_seek) =
            if let Some(request) = self.seek_pending.front() {
                (request.id, request.range.clone(), request.metadata_only, true)
            } else if let Some(request) = self.pending.front() {
                (request.id, request.range.clone(), request.metadata_only, false)
            } else {
                self.arm_idle_timer();
                return;
            };

        if from_seek {
            self.seeking = false;
        }
        self.serving = Some(id);
        debug!("Serving request {} for {}", id, self.url);

        let Some(session) = &self.session else {
            return;
        };
        if metadata_only {
            // Headers come with the first response; a budget-capped prefetch
            // is the cheapest way to obtain them when nothing is cached yet.
            session.prefetch();
        } else {
            session.fetch(range);
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::HeaderReady(info) => {
                self.last_info = Some(info);
                self.announce_info();
                self.complete_metadata_requests();
            }
            SessionEvent::Data { bytes, range } => self.fan_out(bytes, range),
            SessionEvent::Finished { error } => self.on_fetch_finished(error),
        }
    }

    /// Deliver a fetched range to every pending request it overlaps and
    /// resolve the ones it completes.
    fn fan_out(&mut self, bytes: Bytes, range: Range<u64>) {
        let mut deliveries = Vec::new();
        let mut satisfied = Vec::new();
        for request in self
            .pending
            .iter_mut()
            .chain(self.seek_pending.iter_mut())
        {
            if let Some((slice, overlap)) = request.accept(&bytes, &range) {
                deliveries.push((request.id, slice, overlap));
                if request.satisfied() {
                    satisfied.push(request.id);
                }
            }
        }

        for (id, slice, overlap) in deliveries {
            let _ = self.events.send(CacheEvent::DataDelivered {
                request: id,
                bytes: slice,
                range: overlap,
            });
        }
        for id in satisfied {
            self.remove_request(id);
            let _ = self.events.send(CacheEvent::RequestFinished {
                request: id,
                error: None,
            });
        }

        self.deliveries += 1;
        if !self.prebuffer_signaled && self.deliveries >= self.config.prebuffer_delivery_count {
            self.prebuffer_signaled = true;
            debug!("Prebuffer threshold reached for {}", self.url);
            let _ = self.events.send(CacheEvent::CanPrebuffer);
        }
    }

    fn on_fetch_finished(&mut self, error: Option<CacheError>) {
        match error {
            None => {
                if let Some(id) = self.serving.take()
                    && self.remove_request(id).is_some()
                {
                    let _ = self.events.send(CacheEvent::RequestFinished {
                        request: id,
                        error: None,
                    });
                }
                self.dispatch_next();
            }
            Some(e) if e.is_cancellation() => {
                // Clean stop: the cancelled request already resolved.
                self.deliveries = 0;
                self.prebuffer_signaled = false;
                if let Some(id) = self.serving.take()
                    && self.remove_request(id).is_some()
                {
                    let _ = self.events.send(CacheEvent::RequestFinished {
                        request: id,
                        error: None,
                    });
                }
                self.dispatch_next();
            }
            Some(e) => {
                warn!("Fetch failed for {}: {}", self.url, e);
                self.deliveries = 0;
                self.prebuffer_signaled = false;
                if let Some(id) = self.serving.take() {
                    self.remove_request(id);
                    let _ = self.events.send(CacheEvent::RequestFinished {
                        request: id,
                        error: Some(e),
                    });
                }
                // No automatic advance: the player decides whether to
                // rebuild the item or give up.
                let _ = self.events.send(CacheEvent::RecoverFromError);
            }
        }
    }

    fn announce_info(&mut self) {
        if let Some(info) = &self.last_info {
            let _ = self.events.send(CacheEvent::HeaderReady {
                content_type: info.content_type.clone(),
                content_length: info.content_length,
                byte_range_supported: info.byte_range_supported,
            });
        }
    }

    fn complete_metadata_requests(&mut self) {
        let mut done = Vec::new();
        for request in self.pending.iter().chain(self.seek_pending.iter()) {
            if request.metadata_only {
                done.push(request.id);
            }
        }
        for id in done {
            self.remove_request(id);
            let _ = self.events.send(CacheEvent::RequestFinished {
                request: id,
                error: None,
            });
        }
    }

    fn remove_request(&mut self, id: RequestId) -> Option<PendingRequest> {
        if let Some(pos) = self.pending.iter().position(|r| r.id == id) {
            return self.pending.remove(pos);
        }
        if let Some(pos) = self.seek_pending.iter().position(|r| r.id == id) {
            return self.seek_pending.remove(pos);
        }
        None
    }

    fn arm_idle_timer(&mut self) {
        // A burst of micro-requests around a playback position is normal;
        // only a sustained quiet period should reach the player.
        self.idle_deadline =
            Some(Instant::now() + Duration::from_millis(self.config.no_more_pending_debounce_ms));
    }
}

async fn recv_session(
    rx: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
