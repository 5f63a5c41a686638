use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use netrunner_control::{create_router, ControlService, ServiceConfig};

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for port {} to be ready", port);
        }
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// An in-process control server on an ephemeral port
pub struct TestServer {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
    _temp_dir: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = Arc::new(ControlService::new(ServiceConfig {
            snapshots_dir: temp_dir.path().join("snapshots"),
            root_data_dir: Some(temp_dir.path().join("data")),
        }));
        let app = create_router(service);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("test server failed: {}", e);
            }
        });
        wait_for_port(port, Duration::from_secs(10)).await;

        Self {
            port,
            server,
            _temp_dir: temp_dir,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}
