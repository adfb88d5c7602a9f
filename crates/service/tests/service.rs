use dmirror_replicate::memory::MemoryClient;
use dmirror_replicate::{ClientHandle, Key};
use dmirror_rpc::protocol::Response;
use dmirror_rpc::{Client, ConnectOptions, ResourceKind, Status};
use dmirror_service::error::ErrorKind;
use dmirror_service::{MirroringService, Options, ServerEvent};
use dmirror_store::Location;
use serde_json::{Value, json};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn key(byte: u8) -> Key {
    Key::from_bytes([byte; 32])
}

fn options(database: Location) -> Options {
    Options {
        endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        probe_timeout: Duration::from_millis(200),
        database,
        ..Options::default()
    }
}

fn handle(client: &MemoryClient) -> ClientHandle {
    Arc::new(client.clone())
}

async fn start(client: &MemoryClient, database: Location) -> MirroringService {
    MirroringService::open(options(database), handle(client)).await.unwrap()
}

async fn connect(service: &MirroringService) -> Client {
    Client::connect(service.local_addr(), ConnectOptions::default()).await.unwrap()
}

/// Raw line-level access, for malformed input.
struct RawConnection {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RawConnection {
    async fn open(addr: SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self { reader: BufReader::new(read), writer }
    }

    async fn call(&mut self, line: &str) -> Value {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let mut response = String::new();
        self.reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

#[tokio::test]
async fn test_commands_over_the_wire() {
    let client = MemoryClient::default();
    let service = start(&client, Location::Memory).await;
    let mut rpc = connect(&service).await;

    let status = rpc.mirror(key(1), None).await.unwrap();
    assert_eq!(status, Status { key: key(1), kind: None, mirroring: true });
    assert!(rpc.status(key(1).to_hex(), None).await.unwrap().mirroring);

    let drive = key(2);
    let status = rpc.mirror(drive, Some(ResourceKind::Drive)).await.unwrap();
    assert!(status.mirroring);
    assert_eq!(service.mirroring().mirrored().len(), 3);

    let list = rpc.list().await.unwrap();
    assert_eq!(list.mirroring, vec![
        Status { key: key(1), kind: Some(ResourceKind::Base), mirroring: true },
        Status { key: drive, kind: Some(ResourceKind::Drive), mirroring: true },
    ]);

    let status = rpc.unmirror(drive, Some(ResourceKind::Drive)).await.unwrap();
    assert!(!status.mirroring);
    let content = MemoryClient::drive_content_key(&drive);
    assert!(!client.is_announced(&drive.discovery_key()));
    assert!(!client.is_announced(&content.discovery_key()));

    // Unmirroring again is a no-op.
    assert!(!rpc.unmirror(drive, Some(ResourceKind::Drive)).await.unwrap().mirroring);
    assert!(!rpc.unmirror(key(9), None).await.unwrap().mirroring);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_wire_key_forms_and_legacy_types() {
    let client = MemoryClient::default();
    let service = start(&client, Location::Memory).await;
    let mut raw = RawConnection::open(service.local_addr()).await;

    let bytes: Vec<u8> = vec![3; 32];
    let response = raw.call(&json!({"id": 1, "method": "mirror", "params": {"key": bytes, "type": "ddatabase"}}).to_string()).await;
    assert_eq!(response, json!({"id": 1, "result": {"key": key(3).to_hex(), "type": "base", "mirroring": true}}));

    let response = raw.call(&json!({"id": 2, "method": "mirror", "params": {"key": key(4).to_hex(), "type": "ddrive"}}).to_string()).await;
    assert_eq!(response["result"]["type"], json!("drive"));
    assert_eq!(response["result"]["mirroring"], json!(true));

    // No type given, none echoed.
    let response = raw.call(&json!({"id": 3, "method": "status", "params": {"key": key(3).to_hex()}}).to_string()).await;
    assert_eq!(response, json!({"id": 3, "result": {"key": key(3).to_hex(), "mirroring": true}}));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_malformed_lines_keep_connection_open() {
    let client = MemoryClient::default();
    let service = start(&client, Location::Memory).await;
    let mut raw = RawConnection::open(service.local_addr()).await;

    let response: Response = serde_json::from_value(raw.call("this is not json").await).unwrap();
    assert_eq!(response.id, 0);
    assert!(response.error.is_some());

    let response: Response = serde_json::from_value(raw.call(r#"{"id":5,"method":"status","params":{"key":"abc"}}"#).await).unwrap();
    assert_eq!(response.id, 0);
    assert!(response.error.is_some());

    let response = raw.call(r#"{"id":6,"method":"ping"}"#).await;
    assert_eq!(response, json!({"id": 6, "result": {"protocol": "dmirror/1"}}));

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_command_only_rejects_that_command() {
    let client = MemoryClient::default();
    client.set_broken(key(7), true);
    let service = start(&client, Location::Memory).await;
    let mut rpc = connect(&service).await;

    let err = rpc.mirror(key(7), None).await.unwrap_err();
    assert!(matches!(&*err, dmirror_rpc::error::ErrorKind::Remote(_)));
    assert!(rpc.mirror(key(1), None).await.unwrap().mirroring);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_second_instance_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let first = start(&MemoryClient::default(), Location::Memory).await;

    let client = MemoryClient::default();
    let database = dir.path().join("second.db");
    let options = Options { endpoint: first.local_addr(), ..options(Location::File(database.clone())) };
    let err = MirroringService::open(options, handle(&client)).await.err().unwrap();
    assert!(matches!(&*err, ErrorKind::AlreadyRunning(_)));
    assert!(!err.is_retryable());
    // Nothing was initialized.
    assert!(!client.is_ready());
    assert!(!client.is_closed());
    assert!(!Path::new(&database).exists());

    first.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_recovers_membership() {
    let dir = tempfile::tempdir().unwrap();
    let database = Location::File(dir.path().join("mirror.db"));

    let client = MemoryClient::default();
    let service = start(&client, database.clone()).await;
    let mut rpc = connect(&service).await;
    rpc.mirror(key(1), None).await.unwrap();
    rpc.mirror(key(2), None).await.unwrap();
    rpc.mirror(key(5), Some(ResourceKind::Drive)).await.unwrap();
    drop(rpc);
    service.close().await.unwrap();
    // Shutdown drains downloads but does not unmirror.
    assert_eq!(client.total_downloads(), 0);
    assert!(client.configure_calls().is_empty());

    let client = MemoryClient::default();
    let service = start(&client, database).await;
    let report = service.recovery();
    assert!(report.is_clean());
    assert_eq!(report.restored.len(), 4);
    assert_eq!(report.drives, vec![key(5)]);
    assert_eq!(client.active_downloads(&key(1)), 1);
    assert_eq!(client.active_downloads(&key(2)), 1);

    let mut rpc = connect(&service).await;
    assert!(rpc.status(key(1), None).await.unwrap().mirroring);
    assert!(rpc.status(key(5), Some(ResourceKind::Drive)).await.unwrap().mirroring);
    // The drive can be unmirrored without mirroring it again first.
    rpc.unmirror(key(5), Some(ResourceKind::Drive)).await.unwrap();
    assert_eq!(service.mirroring().mirrored(), vec![key(1), key(2)]);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_recovery_failures() {
    let dir = tempfile::tempdir().unwrap();
    let database = Location::File(dir.path().join("mirror.db"));
    let service = start(&MemoryClient::default(), database.clone()).await;
    let mut rpc = connect(&service).await;
    rpc.mirror(key(1), None).await.unwrap();
    rpc.mirror(key(2), None).await.unwrap();
    drop(rpc);
    service.close().await.unwrap();

    let client = MemoryClient::default();
    client.set_broken(key(1), true);
    let service = start(&client, database.clone()).await;
    assert_eq!(service.recovery().restored, vec![key(2)]);
    assert_eq!(service.recovery().failed.len(), 1);
    service.close().await.unwrap();

    let client = MemoryClient::default();
    client.set_broken(key(1), true);
    let options = Options { strict_recovery: true, ..options(database) };
    let err = MirroringService::open(options, handle(&client)).await.err().unwrap();
    assert!(matches!(&*err, ErrorKind::Recovery));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_stop_over_the_wire() {
    let client = MemoryClient::default();
    let service = start(&client, Location::Memory).await;
    let mut rpc = connect(&service).await;
    rpc.mirror(key(1), None).await.unwrap();

    rpc.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), service.stopped()).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.total_downloads(), 0);
    assert!(!dmirror_rpc::probe(service.local_addr(), Duration::from_millis(200)).await);

    let err = service.mirroring().mirror(key(2), None).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Stopped));
}

#[tokio::test]
async fn test_client_events() {
    let service = start(&MemoryClient::default(), Location::Memory).await;
    let mut events = service.subscribe();

    let stream = TcpStream::connect(service.local_addr()).await.unwrap();
    let peer = stream.local_addr().unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ServerEvent::ClientOpen(peer));

    drop(stream);
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
    assert_eq!(event, ServerEvent::ClientClose(peer));

    service.close().await.unwrap();
}
