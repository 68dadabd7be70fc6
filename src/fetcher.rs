use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::ops::Range;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::error::CacheError;

/// Resource metadata extracted from response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHeader {
    /// MIME type, parameters stripped.
    pub content_type: String,
    /// Total resource length: `Content-Range` total when present, otherwise
    /// `Content-Length`. 0 when the server reported neither.
    pub content_length: u64,
    /// Whether the server advertises byte-range support.
    pub byte_range_supported: bool,
    /// True for a `206 Partial Content` answer. A ranged request answered
    /// with plain `200 OK` means the server ignored the `Range` header and
    /// is sending the whole resource from offset zero.
    pub is_partial: bool,
}

/// Events emitted by one in-flight fetch, in order: at most one `Header`,
/// any number of `Body` fragments, exactly one `Finished`.
#[derive(Debug)]
pub enum FetchEvent {
    Header(RemoteHeader),
    Body(Bytes),
    Finished {
        result: Result<(), CacheError>,
        bytes: u64,
        elapsed: Duration,
    },
}

/// Issues a single cancellable HTTP GET with an optional `Range` header and
/// streams the response to an event channel.
///
/// At most one fetch is active at a time; starting a new one stops the
/// previous. Network fragments are coalesced to at least the configured
/// forward-buffer size before being emitted, so downstream disk writes and
/// range-map updates happen in reasonably sized steps.
pub struct RemoteFetcher {
    client: Client,
    forward_buffer: usize,
    active: Option<ActiveFetch>,
}

struct ActiveFetch {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RemoteFetcher {
    pub fn new(config: &CacheConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .timeout(Duration::from_secs(config.resource_timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            forward_buffer: config.forward_buffer_bytes,
            active: None,
        }
    }

    /// Start fetching. `range: None` requests the whole resource with no
    /// `Range` header.
    pub fn start(
        &mut self,
        url: Url,
        range: Option<Range<u64>>,
        events: mpsc::UnboundedSender<FetchEvent>,
    ) {
        self.stop();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_fetch(
            self.client.clone(),
            url,
            range,
            events,
            cancel.clone(),
            self.forward_buffer,
        ));
        self.active = Some(ActiveFetch { cancel, task });
    }

    /// Cancel the in-flight fetch, if any. The fetch task reports the
    /// cancellation through its own `Finished` event; it is not awaited here.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            drop(active.task);
        }
    }
}

impl Drop for RemoteFetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_fetch(
    client: Client,
    url: Url,
    range: Option<Range<u64>>,
    events: mpsc::UnboundedSender<FetchEvent>,
    cancel: CancellationToken,
    forward_buffer: usize,
) {
    let started = Instant::now();
    let mut delivered: u64 = 0;

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(CacheError::Cancelled),
        r = drive(&client, &url, range, &events, forward_buffer, &mut delivered) => r,
    };

    match &result {
        Ok(()) => debug!("Fetch finished for {}: {} bytes", url, delivered),
        Err(e) if e.is_cancellation() => debug!("Fetch cancelled for {}", url),
        Err(e) => warn!("Fetch failed for {}: {}", url, e),
    }

    let _ = events.send(FetchEvent::Finished {
        result,
        bytes: delivered,
        elapsed: started.elapsed(),
    });
}

async fn drive(
    client: &Client,
    url: &Url,
    range: Option<Range<u64>>,
    events: &mpsc::UnboundedSender<FetchEvent>,
    forward_buffer: usize,
    delivered: &mut u64,
) -> Result<(), CacheError> {
    let mut request = client.get(url.clone());
    if let Some(ref r) = range {
        request = request.header(RANGE, format!("bytes={}-{}", r.start, r.end - 1));
        debug!("Requesting {} range {}..{}", url, r.start, r.end);
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CacheError::Status(status));
    }

    let header = header_meta(&response);
    if !is_media_content_type(&header.content_type) {
        return Err(CacheError::UnsupportedContent(header.content_type));
    }
    if events.send(FetchEvent::Header(header)).is_err() {
        return Ok(());
    }

    let mut stream = response.bytes_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        if buffer.len() >= forward_buffer {
            let fragment = buffer.split().freeze();
            *delivered += fragment.len() as u64;
            if events.send(FetchEvent::Body(fragment)).is_err() {
                return Ok(());
            }
        }
    }

    if !buffer.is_empty() {
        let fragment = buffer.split().freeze();
        *delivered += fragment.len() as u64;
        let _ = events.send(FetchEvent::Body(fragment));
    }

    Ok(())
}

fn header_meta(response: &Response) -> RemoteHeader {
    let headers = response.headers();

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .unwrap_or("")
        .trim()
        .to_string();

    let content_range = headers.get(CONTENT_RANGE).and_then(|v| v.to_str().ok());

    let accept_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let byte_range_supported = accept_ranges.eq_ignore_ascii_case("bytes") || content_range.is_some();

    let content_length = content_range
        .and_then(total_from_content_range)
        .or_else(|| {
            headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(0);

    RemoteHeader {
        content_type,
        content_length,
        byte_range_supported,
        is_partial: response.status() == StatusCode::PARTIAL_CONTENT,
    }
}

/// Total length out of `Content-Range: bytes <from>-<to>/<total>`.
/// `None` for an unknown total (`*`).
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Servers occasionally answer media URLs with an HTML error page and a
/// 200 status; reject anything that is clearly not a media payload. An
/// absent content type is tolerated.
fn is_media_content_type(content_type: &str) -> bool {
    content_type.is_empty()
        || content_type.starts_with("video/")
        || content_type.starts_with("audio/")
        || content_type.starts_with("application")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config() -> CacheConfig {
        CacheConfig {
            forward_buffer_bytes: 40_000,
            ..Default::default()
        }
    }

    async fn collect_events(rx: &mut mpsc::UnboundedReceiver<FetchEvent>) -> Vec<FetchEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, FetchEvent::Finished { .. });
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_ranged_fetch_sends_range_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a.mp4")
            .match_header("range", "bytes=100-199")
            .with_status(206)
            .with_header("Content-Type", "video/mp4")
            .with_header("Content-Range", "bytes 100-199/1000")
            .with_header("Accept-Ranges", "bytes")
            .with_body(vec![7u8; 100])
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/a.mp4", server.url())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetcher = RemoteFetcher::new(&test_config());
        fetcher.start(url, Some(100..200), tx);

        let events = collect_events(&mut rx).await;
        mock.assert_async().await;

        let FetchEvent::Header(header) = &events[0] else {
            panic!("expected header first, got {:?}", events[0]);
        };
        assert_eq!(header.content_type, "video/mp4");
        assert_eq!(header.content_length, 1000);
        assert!(header.byte_range_supported);
        assert!(header.is_partial);

        let body: Vec<u8> = events
            .iter()
            .filter_map(|ev| match ev {
                FetchEvent::Body(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, vec![7u8; 100]);

        let FetchEvent::Finished { result, bytes, .. } = events.last().unwrap() else {
            panic!("expected finished last");
        };
        assert!(result.is_ok());
        assert_eq!(*bytes, 100);
    }

    #[tokio::test]
    async fn test_open_ended_fetch_has_no_range_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a.mp4")
            .match_header("range", mockito::Matcher::Missing)
            .with_status(200)
            .with_header("Content-Type", "audio/mpeg")
            .with_header("Accept-Ranges", "bytes")
            .with_body(b"abcdef")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/a.mp4", server.url())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetcher = RemoteFetcher::new(&test_config());
        fetcher.start(url, None, tx);

        let events = collect_events(&mut rx).await;
        mock.assert_async().await;

        let FetchEvent::Header(header) = &events[0] else {
            panic!("expected header first");
        };
        // Content-Length comes from the body mockito serves.
        assert_eq!(header.content_length, 6);
        assert!(header.byte_range_supported);
        assert!(!header.is_partial);
    }

    #[tokio::test]
    async fn test_error_status_reported_without_body_events() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/a.mp4")
            .with_status(500)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/a.mp4", server.url())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetcher = RemoteFetcher::new(&test_config());
        fetcher.start(url, None, tx);

        let events = collect_events(&mut rx).await;
        assert_eq!(events.len(), 1);
        let FetchEvent::Finished { result, bytes, .. } = &events[0] else {
            panic!("expected finished only");
        };
        assert!(matches!(result, Err(CacheError::Status(s)) if s.as_u16() == 500));
        assert_eq!(*bytes, 0);
    }

    #[tokio::test]
    async fn test_non_media_content_type_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/a.mp4")
            .with_status(200)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body("<html>not found</html>")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/a.mp4", server.url())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetcher = RemoteFetcher::new(&test_config());
        fetcher.start(url, None, tx);

        let events = collect_events(&mut rx).await;
        assert_eq!(events.len(), 1);
        let FetchEvent::Finished { result, .. } = &events[0] else {
            panic!("expected finished only");
        };
        assert!(matches!(
            result,
            Err(CacheError::UnsupportedContent(ct)) if ct == "text/html"
        ));
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_fetch() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/a.mp4")
            .with_status(200)
            .with_header("Content-Type", "video/mp4")
            .with_chunked_body(|w| {
                w.write_all(&[1u8; 50_000])?;
                w.flush()?;
                std::thread::sleep(std::time::Duration::from_millis(500));
                w.write_all(&[2u8; 50_000])
            })
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/a.mp4", server.url())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut fetcher = RemoteFetcher::new(&test_config());
        fetcher.start(url, None, tx);

        // Wait for the first forwarded fragment, then cancel.
        loop {
            match rx.recv().await.expect("fetch died silently") {
                FetchEvent::Body(_) => break,
                FetchEvent::Header(_) => continue,
                other => panic!("unexpected event before cancel: {:?}", other),
            }
        }
        fetcher.stop();

        let events = collect_events(&mut rx).await;
        let FetchEvent::Finished { result, .. } = events.last().unwrap() else {
            panic!("expected finished last");
        };
        assert!(matches!(result, Err(e) if e.is_cancellation()));
    }

    #[test]
    fn test_content_range_total_parsing() {
        assert_eq!(total_from_content_range("bytes 0-499/1234"), Some(1234));
        assert_eq!(total_from_content_range("bytes 0-499/*"), None);
        assert_eq!(total_from_content_range("garbage"), None);
    }

    #[test]
    fn test_media_content_type_gate() {
        assert!(is_media_content_type("video/mp4"));
        assert!(is_media_content_type("audio/mpeg"));
        assert!(is_media_content_type("application/octet-stream"));
        assert!(is_media_content_type(""));
        assert!(!is_media_content_type("text/html"));
        assert!(!is_media_content_type("image/png"));
    }
}
