//! End-to-end integration tests for Lockbox.
//!
//! These tests run a real server on a loopback port and verify complete
//! flows:
//! - Registration, login and persistence
//! - Uploads, downloads and quota accounting
//! - Directory commands and confinement
//! - Shutdown and framing compatibility

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use daemon::config::Config;
use daemon::server::{Server, ServerContext, ServerOptions, ShutdownCoordinator};
use protocol::messages::INSUFFICIENT_QUOTA;
use protocol::{Client, Framing, ProtocolError};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const MIB: u64 = 1024 * 1024;

struct TestServer {
    addr: SocketAddr,
    context: Arc<ServerContext>,
    coordinator: ShutdownCoordinator,
    task: JoinHandle<anyhow::Result<()>>,
    config: Config,
    _temp_dir: TempDir,
}

/// Create a test configuration with a temporary directory.
fn create_test_config(default_quota: u64) -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.daemon.data_dir = temp_dir.path().to_path_buf();
    config.network.bind_address = "127.0.0.1".to_string();
    config.network.port = 0;
    config.network.accept_poll_ms = 50;
    config.network.framing = Framing::Auto;
    config.storage.default_quota = default_quota;
    (config, temp_dir)
}

async fn start_server(default_quota: u64) -> TestServer {
    let (config, temp_dir) = create_test_config(default_quota);
    let context = Arc::new(ServerContext::from_config(&config).unwrap());
    let server = Server::bind(
        config.listen_addr(),
        Arc::clone(&context),
        ServerOptions::from_config(&config),
    )
    .await
    .unwrap();

    TestServer {
        addr: server.local_addr().unwrap(),
        context,
        coordinator: server.coordinator(),
        task: tokio::spawn(server.run()),
        config,
        _temp_dir: temp_dir,
    }
}

impl TestServer {
    async fn client(&self) -> Client {
        Client::connect(self.addr).await.unwrap()
    }

    fn remaining(&self, username: &str) -> Option<u64> {
        self.context.ledger().remaining(username)
    }

    fn user_root(&self, username: &str) -> std::path::PathBuf {
        self.context.registry().user_root(username)
    }

    async fn stop(self) {
        self.coordinator.request_shutdown();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_register_and_login() {
    let server = start_server(10 * MIB).await;

    let mut client = server.client().await;
    client.register("alice", "secret").await.unwrap();
    assert_eq!(client.request("exit").await.unwrap(), "exit");

    let mut client = server.client().await;
    let err = client.login("alice", "wrong").await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected(ref reply) if reply == "Authentication failed"));
    client.login("alice", "secret").await.unwrap();

    let mut other = server.client().await;
    let err = other.register("alice", "again").await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Rejected(ref reply) if reply == "Registration failed. User may already exist."
    ));

    let err = other.register("../evil", "pw").await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Rejected(ref reply) if reply == "Registration failed. Invalid username."
    ));

    drop(client);
    drop(other);
    server.stop().await;
}

#[tokio::test]
async fn test_registry_persisted_without_plaintext() {
    let server = start_server(10 * MIB).await;

    let mut client = server.client().await;
    client.register("alice", "hunter2").await.unwrap();
    drop(client);

    let contents = std::fs::read_to_string(server.config.registry_path()).unwrap();
    assert!(contents.contains("\"alice\""));
    assert!(contents.contains("salted-sha256"));
    assert!(!contents.contains("hunter2"));

    // A fresh registry sees the same account.
    let reopened = ServerContext::from_config(&server.config).unwrap();
    assert!(reopened.registry().authenticate("alice", "hunter2"));
    server.stop().await;
}

// =============================================================================
// Transfers
// =============================================================================

#[tokio::test]
async fn test_round_trip_empty_and_multi_chunk() {
    let server = start_server(10 * MIB).await;
    let mut client = server.client().await;
    client.register("alice", "secret").await.unwrap();

    for len in [0usize, 5000] {
        let name = format!("file_{len}.bin");
        let data = payload(len);
        let reply = client.upload(&name, &data).await.unwrap();
        assert_eq!(reply, format!("File '{name}' uploaded successfully."));

        let downloaded = client.download(&name).await.unwrap();
        assert_eq!(downloaded.len(), len);
        assert_eq!(downloaded, data);
    }

    assert_eq!(server.remaining("alice"), Some(10 * MIB - 5000));
    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_upload_over_quota_refused() {
    let server = start_server(10 * MIB).await;
    let mut client = server.client().await;
    client.register("alice", "secret").await.unwrap();

    let err = client.begin_upload("big.bin", 11 * MIB).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected(ref reply) if reply == INSUFFICIENT_QUOTA));
    assert_eq!(server.remaining("alice"), Some(10 * MIB));
    assert!(!server.user_root("alice").join("big.bin").exists());

    // The session is still usable.
    assert_eq!(client.request("ls").await.unwrap(), "(empty directory)");
    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_incomplete_upload_restores_quota() {
    let server = start_server(1000).await;
    let mut client = server.client().await;
    client.register("alice", "secret").await.unwrap();

    client.begin_upload("partial.bin", 600).await.unwrap();
    client.send_data(&payload(250)).await.unwrap();
    client.shutdown().await.unwrap();

    let reply = client.recv().await.unwrap();
    assert_eq!(reply, "Error: Incomplete upload for 'partial.bin'. Please try again.");
    assert_eq!(server.remaining("alice"), Some(750));

    let root = server.user_root("alice");
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0, "no file or temp file left");
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_uploads_share_quota() {
    let server = start_server(1000).await;
    let mut first = server.client().await;
    first.register("alice", "secret").await.unwrap();
    let mut second = server.client().await;
    second.login("alice", "secret").await.unwrap();

    let data = payload(600);
    let (a, b) = tokio::join!(first.upload("a.bin", &data), second.upload("b.bin", &data));

    let results = [a, b];
    let succeeded = results
        .iter()
        .filter(|r| matches!(r, Ok(reply) if reply.ends_with("uploaded successfully.")))
        .count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(ProtocolError::Rejected(reply)) if reply == INSUFFICIENT_QUOTA))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(refused, 1);
    assert_eq!(server.remaining("alice"), Some(400));

    drop(first);
    drop(second);
    server.stop().await;
}

#[tokio::test]
async fn test_download_outside_root_denied() {
    let server = start_server(10 * MIB).await;
    let mut bob = server.client().await;
    bob.register("bob", "pw").await.unwrap();
    bob.upload("private.txt", b"bob only").await.unwrap();

    let mut alice = server.client().await;
    alice.register("alice", "pw").await.unwrap();
    let err = alice.download("../../bob/docs/private.txt").await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Rejected(ref reply)
            if reply == "Access denied: Cannot download '../../bob/docs/private.txt' from outside your designated area."
    ));

    drop(alice);
    drop(bob);
    server.stop().await;
}

// =============================================================================
// Directory commands
// =============================================================================

#[tokio::test]
async fn test_directory_workflow() {
    let server = start_server(10 * MIB).await;
    let mut client = server.client().await;
    client.register("alice", "secret").await.unwrap();

    assert_eq!(client.request("mkdir sub").await.unwrap(), "Directory created: sub");
    client.upload("x", b"contents").await.unwrap();
    assert_eq!(client.request("rename x y").await.unwrap(), "Renamed from x to y");
    assert_eq!(
        client.request("copy y sub").await.unwrap(),
        "Copied file from 'y' to 'sub'"
    );
    assert_eq!(client.request("ls sub").await.unwrap(), "y");
    assert_eq!(client.request("ls").await.unwrap(), "sub; y");
    assert_eq!(client.download("sub/y").await.unwrap(), b"contents");

    assert_eq!(client.request("rmdir sub").await.unwrap(), "Directory removed: sub");
    assert!(!server.user_root("alice").join("sub").exists());
    assert_eq!(client.request("rmfile y").await.unwrap(), "File removed: y");
    assert_eq!(client.request("ls").await.unwrap(), "(empty directory)");

    // Deleting does not refund quota.
    assert_eq!(server.remaining("alice"), Some(10 * MIB - 8));
    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_traversal_never_touches_outside() {
    let server = start_server(10 * MIB).await;
    let mut client = server.client().await;
    client.register("alice", "secret").await.unwrap();

    let reply = client.request("mkdir ../../escape").await.unwrap();
    assert!(reply.starts_with("Access denied"));
    assert!(!server.config.users_dir().join("escape").exists());
    assert!(!server.config.daemon.data_dir.join("escape").exists());

    let reply = client.request("ls /").await.unwrap();
    assert!(reply.starts_with("Error: Directory '/'"));
    drop(client);
    server.stop().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_stop_requires_admin_and_waits_for_sessions() {
    let server = start_server(10 * MIB).await;

    let mut alice = server.client().await;
    alice.register("alice", "pw").await.unwrap();
    assert_eq!(alice.request("stop").await.unwrap(), "Insufficient privileges.");
    assert!(!server.coordinator.is_shutting_down());

    let mut admin = server.client().await;
    admin.register("admin", "pw").await.unwrap();
    assert_eq!(admin.request("stop").await.unwrap(), "Server stopping");
    assert!(matches!(admin.recv().await, Err(ProtocolError::ConnectionClosed(_))));

    // Alice's session keeps the server alive until she leaves.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.task.is_finished());
    assert_eq!(alice.request("pwd").await.unwrap(), "Current directory: /");
    assert_eq!(alice.request("exit").await.unwrap(), "exit");

    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

// =============================================================================
// Framing compatibility
// =============================================================================

async fn legacy_request(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = vec![0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[tokio::test]
async fn test_legacy_and_line_clients_on_one_server() {
    let server = start_server(10 * MIB).await;

    let mut legacy = TcpStream::connect(server.addr).await.unwrap();
    legacy.set_nodelay(true).unwrap();
    assert_eq!(legacy_request(&mut legacy, "register old pw").await, "Registered");
    assert_eq!(legacy_request(&mut legacy, "pwd").await, "Current directory: /");

    // Legacy upload: each control step is one undelimited write.
    assert_eq!(legacy_request(&mut legacy, "upload a.txt").await, "READY_FOR_UPLOAD_SIZE");
    assert_eq!(legacy_request(&mut legacy, "5").await, "QUOTA_OK");
    assert_eq!(
        legacy_request(&mut legacy, "hello").await,
        "File 'a.txt' uploaded successfully."
    );

    let mut line = server.client().await;
    line.register("new", "pw").await.unwrap();
    assert_eq!(line.request("pwd").await.unwrap(), "Current directory: /");

    assert_eq!(legacy_request(&mut legacy, "ls").await, "a.txt");
    assert_eq!(legacy_request(&mut legacy, "exit").await, "exit");

    drop(line);
    server.stop().await;
}
