//! Cold-fetch then warm-restart flow against a mock origin: the second
//! playback of a resource must be served entirely from disk.

use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use spool::{CacheConfig, CacheEvent, DownloadRegistry, RequestCoordinator, RequestId};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("spool=debug")
        .try_init();
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<CacheEvent>) -> CacheEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for cache event")
        .expect("cache event channel closed")
}

/// Drain events until `id` finishes, returning the bytes it received.
async fn collect_request(
    rx: &mut mpsc::UnboundedReceiver<CacheEvent>,
    id: RequestId,
) -> Vec<u8> {
    let mut received = Vec::new();
    loop {
        match next_event(rx).await {
            CacheEvent::DataDelivered { request, bytes, .. } if request == id => {
                received.extend_from_slice(&bytes);
            }
            CacheEvent::RequestFinished { request, error } if request == id => {
                assert!(error.is_none(), "request failed: {error:?}");
                return received;
            }
            CacheEvent::RecoverFromError => panic!("unexpected error recovery signal"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn cold_fetch_then_warm_restart_serves_from_disk() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let config = CacheConfig {
        cache_directory: Some(temp.path().to_path_buf()),
        no_more_pending_debounce_ms: 50,
        ..Default::default()
    };
    let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/track.mp3")
        .match_header("range", "bytes=0-4095")
        .with_status(206)
        .with_header("Content-Type", "audio/mpeg")
        .with_header("Content-Range", "bytes 0-4095/4096")
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;
    let url = format!("{}/track.mp3", server.url());

    assert!(!spool::is_fully_cached(&config, &url));

    // Cold playback: everything comes from the network, once.
    {
        let (handle, mut events) =
            RequestCoordinator::spawn(&url, config.clone(), DownloadRegistry::new());
        let id = handle.submit_range_request(0..4096);
        let received = collect_request(&mut events, id).await;
        assert_eq!(received, body);
        handle.shutdown();
    }
    mock.assert_async().await;
    assert!(spool::is_fully_cached(&config, &url));

    // Warm restart: a fresh coordinator serves the same range from disk.
    // The mock's expect(1) would fail the test on any further hit.
    {
        let (handle, mut events) =
            RequestCoordinator::spawn(&url, config.clone(), DownloadRegistry::new());
        let id = handle.submit_range_request(1024..3072);
        let received = collect_request(&mut events, id).await;
        assert_eq!(received, &body[1024..3072]);
        handle.shutdown();
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn seek_pattern_reuses_cached_prefix() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let config = CacheConfig {
        cache_directory: Some(temp.path().to_path_buf()),
        no_more_pending_debounce_ms: 50,
        ..Default::default()
    };
    let body: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();

    let mut server = mockito::Server::new_async().await;
    let head = server
        .mock("GET", "/movie.mp4")
        .match_header("range", "bytes=0-4999")
        .with_status(206)
        .with_header("Content-Type", "video/mp4")
        .with_header("Content-Range", "bytes 0-4999/10000")
        .with_body(body[..5000].to_vec())
        .expect(1)
        .create_async()
        .await;
    let tail = server
        .mock("GET", "/movie.mp4")
        .match_header("range", "bytes=5000-9999")
        .with_status(206)
        .with_header("Content-Type", "video/mp4")
        .with_header("Content-Range", "bytes 5000-9999/10000")
        .with_body(body[5000..].to_vec())
        .expect(1)
        .create_async()
        .await;
    let url = format!("{}/movie.mp4", server.url());

    let (handle, mut events) =
        RequestCoordinator::spawn(&url, config.clone(), DownloadRegistry::new());

    // Forward playback covers the head.
    let playback = handle.submit_range_request(0..5000);
    assert_eq!(collect_request(&mut events, playback).await, &body[..5000]);

    // A jump into uncached territory downloads only the gap.
    let jump = handle.submit_range_request(2500..10_000);
    let received = collect_request(&mut events, jump).await;
    assert_eq!(received, &body[2500..]);

    head.assert_async().await;
    tail.assert_async().await;
    assert!(spool::is_fully_cached(&config, &url));
    handle.shutdown();
}
