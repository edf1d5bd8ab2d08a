//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use bulwark::config::BulwarkConfig;
use bulwark::lifecycle::{Readiness, StartupCoordinator};
use bulwark::{HttpServer, Services, Shutdown};

/// A daemon assembled in-process and served on an ephemeral port.
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub services: Services,
    pub shutdown: Shutdown,
    pub coordinator: Option<StartupCoordinator>,
    pub readiness: Readiness,
}

impl TestDaemon {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn admin_get(&self, client: &reqwest::Client, path: &str) -> reqwest::RequestBuilder {
        client.get(self.url(path)).bearer_auth(ADMIN_KEY)
    }

    pub fn admin_post(&self, client: &reqwest::Client, path: &str) -> reqwest::RequestBuilder {
        client.post(self.url(path)).bearer_auth(ADMIN_KEY)
    }

    /// Run startup to completion.
    pub async fn run_startup(&mut self) -> bulwark::StartupReport {
        let coordinator = self
            .coordinator
            .take()
            .expect("startup already ran");
        coordinator.run().await.expect("startup graph is valid")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.shutdown.trigger("test finished");
    }
}

pub const ADMIN_KEY: &str = "test-admin-key";

/// Serve `config` without running startup yet. The admin key is always
/// [`ADMIN_KEY`].
pub async fn start_daemon(mut config: BulwarkConfig) -> TestDaemon {
    config.admin.api_key = ADMIN_KEY.to_string();
    let services = Services::from_config(&config);
    let coordinator = services.coordinator(&config.startup);
    let readiness = coordinator.readiness();
    let shutdown = Shutdown::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(services.app_state(readiness.clone()));
    tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestDaemon {
        addr,
        services,
        shutdown,
        coordinator: Some(coordinator),
        readiness,
    }
}

/// A TCP dependency that accepts and immediately drops connections.
pub async fn start_mock_dependency() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });
    addr
}

/// An address nothing is listening on.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
