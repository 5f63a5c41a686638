mod common;

use std::time::Duration;

use common::TestServer;
use netrunner_client::Client;
use netrunner_control::types::StartRequest;

async fn connect(server: &TestServer) -> Client {
    Client::new(&server.endpoint(), Duration::from_secs(10))
        .await
        .expect("Failed to dial control server")
}

#[tokio::test]
async fn test_ping_reports_server_pid() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    let pong = client.ping().await.unwrap();
    // The server runs in-process, so its pid is ours.
    assert_eq!(pong.pid, std::process::id());
}

#[tokio::test]
async fn test_rpc_version() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    let version = client.rpc_version().await.unwrap();
    assert_eq!(version.version, netrunner_control::RPC_VERSION);
}

#[tokio::test]
async fn test_status_on_empty_cluster() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    let status = client.status().await.unwrap();
    assert!(status.cluster_info.node_names.is_empty());
    assert!(!status.cluster_info.healthy);
    assert!(client.uris().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_writer_methods_rejected_when_empty() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    let err = client.stop().await.unwrap_err().to_string();
    assert!(err.contains("failed-precondition"), "got: {}", err);

    let err = client.remove_node("node1").await.unwrap_err().to_string();
    assert!(err.contains("failed-precondition"), "got: {}", err);

    let err = client
        .create_subnets(vec![])
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("failed-precondition"), "got: {}", err);

    let err = client
        .save_snapshot("snap1")
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("failed-precondition"), "got: {}", err);
}

#[tokio::test]
async fn test_start_with_missing_binary_leaves_state_empty() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    let err = client
        .start(StartRequest {
            exec_path: "/nonexistent/validator".into(),
            ..Default::default()
        })
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("resource"), "got: {}", err);

    // The failed start rolled back to empty.
    let status = client.status().await.unwrap();
    assert!(status.cluster_info.node_names.is_empty());
    let err = client.stop().await.unwrap_err().to_string();
    assert!(err.contains("failed-precondition"), "got: {}", err);
}

#[tokio::test]
async fn test_snapshot_listing_and_removal() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    assert!(client.get_snapshot_names().await.unwrap().is_empty());

    let err = client
        .remove_snapshot("missing")
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("not-found"), "got: {}", err);

    let err = client
        .load_snapshot(netrunner_control::types::LoadSnapshotRequest {
            snapshot_name: "missing".into(),
            ..Default::default()
        })
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("not-found"), "got: {}", err);
}

#[tokio::test]
async fn test_validation_errors_reported_without_side_effects() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    // A spec-level validation failure must not change the state machine.
    let err = client
        .start(StartRequest {
            exec_path: "/nonexistent/validator".into(),
            num_nodes: Some(0),
            ..Default::default()
        })
        .await
        .unwrap_err()
        .to_string();
    assert!(
        err.contains("invalid-argument") || err.contains("resource"),
        "got: {}",
        err
    );
    assert!(client.status().await.unwrap().cluster_info.node_names.is_empty());
}

#[tokio::test]
async fn test_concurrent_readers_do_not_block() {
    let server = TestServer::start().await;
    let client = connect(&server).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = Client::new(&server.endpoint(), Duration::from_secs(10))
            .await
            .unwrap();
        tasks.push(tokio::spawn(async move {
            let status = client.status().await.unwrap();
            assert!(status.cluster_info.node_names.is_empty());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    client.close();
    client.close();
}
