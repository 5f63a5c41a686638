mod common;

use std::time::Duration;

use common::TestServer;
use netrunner_client::Client;

#[tokio::test]
async fn test_stream_status_pushes_frames() {
    let server = TestServer::start().await;
    let client = Client::new(&server.endpoint(), Duration::from_secs(10))
        .await
        .unwrap();

    let mut frames = client
        .stream_status(Duration::from_millis(200))
        .await
        .unwrap();

    // The first frame arrives immediately, then one per interval.
    let first = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for first frame")
        .expect("stream ended early");
    assert!(first.node_names.is_empty());

    let second = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .expect("timed out waiting for second frame")
        .expect("stream ended early");
    assert!(second.node_names.is_empty());
}

#[tokio::test]
async fn test_multiple_subscribers() {
    let server = TestServer::start().await;
    let client_a = Client::new(&server.endpoint(), Duration::from_secs(10))
        .await
        .unwrap();
    let client_b = Client::new(&server.endpoint(), Duration::from_secs(10))
        .await
        .unwrap();

    let mut frames_a = client_a
        .stream_status(Duration::from_millis(200))
        .await
        .unwrap();
    let mut frames_b = client_b
        .stream_status(Duration::from_millis(200))
        .await
        .unwrap();

    let a = tokio::time::timeout(Duration::from_secs(5), frames_a.recv())
        .await
        .unwrap()
        .unwrap();
    let b = tokio::time::timeout(Duration::from_secs(5), frames_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.network_id, b.network_id);
}
