//! Integration tests for quicpath
//!
//! These tests run a client and a server controller against each other,
//! shuttling encoded frames between them the way a packet layer would.

use quicpath::config::{Config, RetryConfig};
use quicpath::quic::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const MAX_FRAME: usize = 1200;

struct Endpoint {
    registry: ConnectionRegistry<&'static str>,
    tables: SharedTables,
    handle: ConnectionHandle,
    controller: MigrationController,
    clock: ManualClock,
    events: UnboundedReceiver<MigrationEvent>,
}

impl Endpoint {
    fn new(name: &'static str, local_cid: &ConnectionId, remote_cid: &ConnectionId, secret: &[u8]) -> Self {
        let registry = ConnectionRegistry::new();
        let handle = registry.insert(name);
        let tables = SharedTables::with_key(ResetTokenKey::from_secret(secret));
        let clock = ManualClock::new();
        let (sink, events) = EventSink::channel();
        let controller = MigrationController::new(
            handle,
            &Config::default().migration,
            &tables,
            local_cid.clone(),
            remote_cid.clone(),
            Arc::new(clock.clone()),
            sink,
        );
        Self {
            registry,
            tables,
            handle,
            controller,
            clock,
            events,
        }
    }

    /// Everything the controller wants to send on `path`, as one payload
    fn flush(&mut self, path: &Path) -> Vec<u8> {
        let mut payload = Vec::new();
        while let Some(out) = self.controller.poll_frame(EncryptionLevel::OneRtt, path, MAX_FRAME) {
            payload.extend_from_slice(&out.frame.encode());
        }
        payload
    }

    fn receive(&mut self, path: &Path, payload: &[u8]) -> ReceiveOutcome {
        self.controller
            .receive(EncryptionLevel::OneRtt, path, payload)
            .expect("payload accepted")
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// The same path as seen from the other end
fn mirror(path: &Path) -> Path {
    Path::new(path.remote, path.local)
}

fn setup() -> (Endpoint, Endpoint, Path) {
    let client_cid = ConnectionId::from_slice(&[0xc0; 8]).unwrap();
    let server_cid = ConnectionId::from_slice(&[0x50; 8]).unwrap();
    let mut client = Endpoint::new("client", &client_cid, &server_cid, b"client secret");
    let mut server = Endpoint::new("server", &server_cid, &client_cid, b"server secret");

    let handshake_path = Path::new(addr("192.0.2.1:50000"), addr("198.51.100.1:443"));
    client.controller.set_trusted_path(handshake_path);
    server.controller.set_trusted_path(mirror(&handshake_path));
    (client, server, handshake_path)
}

#[tokio::test]
async fn test_client_validates_new_path() {
    let (mut client, mut server, handshake_path) = setup();
    let new_path = Path::new(addr("192.0.2.1:50001"), handshake_path.remote);

    client.controller.probe_path(new_path);
    assert_eq!(client.controller.current_path(), Some(new_path));
    assert_eq!(client.controller.verified_path(), Some(handshake_path));

    let challenge = client.flush(&new_path);
    let outcome = server.receive(&mirror(&new_path), &challenge);
    assert!(outcome.is_probing_only);

    let response = server.flush(&mirror(&new_path));
    client.receive(&new_path, &response);

    assert_eq!(client.controller.current_path(), Some(new_path));
    assert_eq!(client.controller.verified_path(), Some(new_path));
    assert!(!client.controller.is_validation_pending());

    let validated = timeout(Duration::from_secs(1), client.events.recv()).await.unwrap();
    assert_eq!(validated, Some(MigrationEvent::PathValidated(new_path)));
    let committed = timeout(Duration::from_secs(1), client.events.recv()).await.unwrap();
    assert_eq!(committed, Some(MigrationEvent::PathCommitted(new_path)));
}

#[tokio::test]
async fn test_unanswered_path_rolls_back() {
    let (mut client, _server, handshake_path) = setup();
    let new_path = Path::new(addr("192.0.2.1:50001"), handshake_path.remote);

    client.controller.probe_path(new_path);
    let _ = client.flush(&new_path);

    client.clock.advance(Duration::from_millis(2_999));
    assert_eq!(client.controller.current_path(), Some(new_path));

    client.clock.advance(Duration::from_millis(1));
    assert_eq!(client.controller.current_path(), Some(handshake_path));
    assert!(!client.controller.is_validation_pending());

    let event = timeout(Duration::from_secs(1), client.events.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(MigrationEvent::PathRolledBack {
            failed: new_path,
            restored: Some(handshake_path)
        })
    );
}

#[test]
fn test_response_on_other_path_is_ignored() {
    let (mut client, mut server, handshake_path) = setup();
    let new_path = Path::new(addr("192.0.2.1:50001"), handshake_path.remote);
    let spoofed = Path::new(addr("192.0.2.99:50001"), handshake_path.remote);

    // Drain the server's CID advertisements first
    let _ = server.flush(&mirror(&handshake_path));

    client.controller.probe_path(new_path);
    let challenge = client.flush(&new_path);

    // The server answers on the path the challenge arrived on only
    server.receive(&mirror(&spoofed), &challenge);
    assert!(server.flush(&mirror(&new_path)).is_empty());
    let response = server.flush(&mirror(&spoofed));
    assert!(!response.is_empty());

    client.receive(&spoofed, &response);
    assert!(client.controller.is_validation_pending());
    assert_eq!(client.controller.verified_path(), Some(handshake_path));
}

#[test]
fn test_migration_to_alternate_cid() {
    let (mut client, mut server, handshake_path) = setup();
    let server_handshake_cid = ConnectionId::from_slice(&[0x50; 8]).unwrap();

    // Server advertises an alternate CID on the handshake path
    let advertised = server.flush(&mirror(&handshake_path));
    client.receive(&handshake_path, &advertised);
    assert!(client.controller.cid_manager().lock().is_ready_to_migrate());

    let new_path = Path::new(addr("192.0.2.1:50001"), handshake_path.remote);
    let alt_cid = client.controller.migrate(new_path).expect("spare CID");
    assert_ne!(alt_cid, server_handshake_cid);
    assert_eq!(client.controller.destination_cid(), Some(alt_cid.clone()));
    assert_eq!(server.tables.cid_table.lookup(&alt_cid), Some(server.handle));

    // Packets now arrive at the server addressed to the alternate CID
    assert!(server.controller.cid_manager().lock().set_local_cid_in_use(&alt_cid));

    // Challenge on the new path, then the retirement of the old CID
    let payload = client.flush(&new_path);
    server.receive(&mirror(&new_path), &payload);
    assert_eq!(server.tables.cid_table.lookup(&server_handshake_cid), None);

    let response = server.flush(&mirror(&new_path));
    client.receive(&new_path, &response);
    assert_eq!(client.controller.verified_path(), Some(new_path));
}

#[test]
fn test_retiring_cid_in_use_closes_connection() {
    let (mut client, mut server, handshake_path) = setup();
    let advertised = server.flush(&mirror(&handshake_path));
    client.receive(&handshake_path, &advertised);

    let new_path = Path::new(addr("192.0.2.1:50001"), handshake_path.remote);
    client.controller.migrate(new_path).expect("spare CID");
    let payload = client.flush(&new_path);

    // The server never saw the new CID in use
    let err = server
        .controller
        .receive(EncryptionLevel::OneRtt, &mirror(&new_path), &payload)
        .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::ProtocolViolation);
    assert_eq!(err.frame_type, Some(FrameType::RetireConnectionId));
}

#[test]
fn test_stateless_reset_recognized() {
    let (mut client, mut server, handshake_path) = setup();
    let advertised = server.flush(&mirror(&handshake_path));
    client.receive(&handshake_path, &advertised);

    let (alt_cid, token) = match Frame::decode(&advertised).unwrap().0 {
        Frame::NewConnectionId {
            connection_id,
            stateless_reset_token,
            ..
        } => (connection_id, stateless_reset_token),
        other => panic!("expected NEW_CONNECTION_ID, got {:?}", other),
    };
    assert_eq!(token, ResetTokenKey::from_secret(b"server secret").token_for(&alt_cid));

    // Server lost state and sends a stateless reset
    let mut datagram = vec![0x40; 24];
    datagram.extend_from_slice(token.as_bytes());
    let handle = client.tables.reset_tokens.check_datagram(&datagram).unwrap();
    assert_eq!(handle, client.handle);
    assert_eq!(client.registry.get(handle).as_deref(), Some(&"client"));

    client.controller.teardown();
    assert_eq!(client.tables.reset_tokens.check_datagram(&datagram), None);
    assert!(client.tables.cid_table.is_empty());

    client.registry.remove(client.handle);
    assert!(client.registry.get(handle).is_none());
}

#[test]
fn test_retry_cookie_round_trip() {
    let config = RetryConfig {
        enabled: true,
        ..RetryConfig::default()
    };
    let clock = ManualClock::new();
    let retry = StatelessRetry::new(&config, Arc::new(clock.clone())).unwrap();
    let client = addr("192.0.2.1:50000");

    let mut buf = [0u8; 32];
    let mut len = 0;
    assert_eq!(retry.generate_cookie_cb(&client, &mut buf, &mut len), 1);
    assert_eq!(retry.verify_cookie_cb(&client, &buf[..len]), 1);
    assert_eq!(retry.verify_cookie_cb(&addr("192.0.2.1:50001"), &buf[..len]), 0);

    // Survives one rotation, not two
    clock.advance(Duration::from_secs(3_600));
    assert_eq!(retry.verify_cookie_cb(&client, &buf[..len]), 1);
    clock.advance(Duration::from_secs(3_600));
    assert_eq!(retry.verify_cookie_cb(&client, &buf[..len]), 0);
}

#[test]
fn test_strict_config_rejects_garbage() {
    let mut config = Config::default();
    config.migration.reject_trailing_garbage = true;
    let registry = ConnectionRegistry::new();
    let tables = SharedTables::with_key(ResetTokenKey::from_secret(b"k"));
    let mut controller = MigrationController::new(
        registry.insert(()),
        &config.migration,
        &tables,
        ConnectionId::from_slice(&[1; 8]).unwrap(),
        ConnectionId::from_slice(&[2; 8]).unwrap(),
        Arc::new(SystemClock),
        EventSink::disabled(),
    );
    let path = Path::new(addr("192.0.2.1:50000"), addr("198.51.100.1:443"));

    let mut payload = Frame::Ping.encode().to_vec();
    payload.push(0x3f);
    let err = controller
        .receive(EncryptionLevel::OneRtt, &path, &payload)
        .unwrap_err();
    assert_eq!(err.code, TransportErrorCode::FrameEncodingError);
}
