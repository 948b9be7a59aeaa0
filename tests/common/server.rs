//! Test server lifecycle management
//!
//! Each test gets an isolated daemon and HTTP server on a random port.

use super::constants::*;
use backupd::config::{AppConfig, CliConfig, FileConfig};
use backupd::daemon::Daemon;
use backupd::executor::CommandExecutor;
use backupd::server::make_app;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Test server instance running the command executor.
///
/// When dropped, the server shuts down and the daemon stops its jobs.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    pub daemon: Arc<Daemon>,

    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a started daemon and its API on a random port.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid, binding fails or the server does not become
    /// ready within [`SERVER_READY_TIMEOUT_MS`].
    pub async fn spawn() -> Self {
        backupd::server::metrics::init_metrics();

        let file: FileConfig = toml::from_str(TEST_CONFIG).expect("Invalid test config");
        let config =
            AppConfig::resolve(&CliConfig::default(), Some(file)).expect("Failed to resolve config");
        let daemon = Arc::new(
            Daemon::new(config, Arc::new(CommandExecutor::new())).expect("Failed to build daemon"),
        );
        daemon.start();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = make_app(daemon.clone());
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url: format!("http://127.0.0.1:{}", port),
            daemon,
            _shutdown_tx: Some(shutdown_tx),
        };
        server.wait_for_ready().await;
        server
    }

    /// Polls /api/jobs until it answers.
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);
        while start.elapsed() < timeout {
            if let Ok(response) = client.get(format!("{}/api/jobs", self.base_url)).send().await {
                if response.status().is_success() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Server did not become ready within {:?}", timeout);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.daemon.shutdown();
    }
}
