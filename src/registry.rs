use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Process-wide set of URLs with an active download.
///
/// Exactly one session may download a given URL at a time; a second session
/// observing the URL here must treat its own fetch as a no-op. Cloned handles
/// share the same set — create one registry at startup and inject it into
/// every session.
#[derive(Debug, Clone, Default)]
pub struct DownloadRegistry {
    urls: Arc<Mutex<HashSet<String>>>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_downloading(&self, url: &str) -> bool {
        self.urls.lock().expect("registry poisoned").contains(url)
    }

    /// Atomically claim the URL for download. Returns false if another
    /// session already holds it; the check and the claim happen under one
    /// lock so two sessions cannot both win.
    pub fn try_begin(&self, url: &str) -> bool {
        self.urls
            .lock()
            .expect("registry poisoned")
            .insert(url.to_string())
    }

    pub fn end(&self, url: &str) {
        self.urls.lock().expect("registry poisoned").remove(url);
    }
}
