use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::registry::DownloadRegistry;
use crate::session::{CacheSession, SessionEvent, SessionHandle};

#[derive(Debug)]
enum PrecacheCommand {
    AddPrefetch(Vec<String>),
    AddFull(Vec<String>),
    Start,
    Stop,
    Clear,
    Shutdown,
}

/// Handle to a running [`Precacher`] task.
#[derive(Debug, Clone)]
pub struct PrecacherHandle {
    commands: mpsc::UnboundedSender<PrecacheCommand>,
}

impl PrecacherHandle {
    /// Queue URLs for head-of-file pre-caching (capped at the pre-download
    /// budget).
    pub fn add_prefetch(&self, urls: Vec<String>) {
        let _ = self.commands.send(PrecacheCommand::AddPrefetch(urls));
    }

    /// Queue URLs for complete background caching. The full queue is only
    /// drained once the prefetch queue is empty.
    pub fn add_full(&self, urls: Vec<String>) {
        let _ = self.commands.send(PrecacheCommand::AddFull(urls));
    }

    pub fn start(&self) {
        let _ = self.commands.send(PrecacheCommand::Start);
    }

    /// Stop the resource currently being pre-cached and pause the queue.
    /// Used by a player to take priority before starting playback.
    pub fn stop(&self) {
        let _ = self.commands.send(PrecacheCommand::Stop);
    }

    pub fn clear(&self) {
        let _ = self.commands.send(PrecacheCommand::Clear);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(PrecacheCommand::Shutdown);
    }
}

/// Walks a playlist in the background, warming the cache one resource at a
/// time: first the head of every queued URL up to the pre-download budget,
/// then, once that queue is empty, complete downloads from the full queue.
/// Already-cached resources are skipped.
pub struct Precacher {
    config: CacheConfig,
    registry: DownloadRegistry,
    prefetch_queue: VecDeque<String>,
    full_queue: VecDeque<String>,
    session: Option<SessionHandle>,
    session_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    running: bool,
    commands: mpsc::UnboundedReceiver<PrecacheCommand>,
}

impl Precacher {
    pub fn spawn(config: CacheConfig, registry: DownloadRegistry) -> PrecacherHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let precacher = Self {
            config,
            registry,
            prefetch_queue: VecDeque::new(),
            full_queue: VecDeque::new(),
            session: None,
            session_rx: None,
            running: false,
            commands: cmd_rx,
        };
        tokio::spawn(precacher.run());
        PrecacherHandle { commands: cmd_tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(PrecacheCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(ev) = recv_session(&mut self.session_rx) => {
                    if matches!(ev, SessionEvent::Finished { .. }) && self.running {
                        self.advance();
                    }
                }
            }
        }
        self.stop_current();
    }

    fn handle_command(&mut self, cmd: PrecacheCommand) {
        match cmd {
            PrecacheCommand::AddPrefetch(urls) => self.prefetch_queue.extend(urls),
            PrecacheCommand::AddFull(urls) => self.full_queue.extend(urls),
            PrecacheCommand::Start => {
                if !self.running {
                    self.running = true;
                    self.advance();
                }
            }
            PrecacheCommand::Stop => {
                self.running = false;
                self.stop_current();
            }
            PrecacheCommand::Clear => {
                self.running = false;
                self.prefetch_queue.clear();
                self.full_queue.clear();
                self.stop_current();
            }
            PrecacheCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Move on to the next URL that still needs caching, or go idle.
    fn advance(&mut self) {
        self.stop_current();

        while let Some((url, full)) = self.next_url() {
            if CacheSession::is_fully_cached(&self.config, &url) {
                debug!("Skipping fully cached resource {}", url);
                continue;
            }
            match CacheSession::spawn(&url, self.config.clone(), self.registry.clone()) {
                Ok((session, rx)) => {
                    info!(
                        "Pre-caching {} ({})",
                        url,
                        if full { "full" } else { "head" }
                    );
                    if full {
                        session.prefetch_all();
                    } else {
                        session.prefetch();
                    }
                    self.session = Some(session);
                    self.session_rx = Some(rx);
                    return;
                }
                Err(e) => {
                    warn!("Cannot pre-cache {}: {}", url, e);
                }
            }
        }

        debug!("Pre-cache queues drained");
        self.running = false;
    }

    fn next_url(&mut self) -> Option<(String, bool)> {
        if let Some(url) = self.prefetch_queue.pop_front() {
            return Some((url, false));
        }
        self.full_queue.pop_front().map(|url| (url, true))
    }

    fn stop_current(&mut self) {
        if let Some(session) = self.session.take() {
            session.force_stop();
            session.shutdown();
        }
        self.session_rx = None;
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
