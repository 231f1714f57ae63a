//! End-to-end session behavior against a scripted in-process server.
//!
//! The mock accepts real TCP connections and plays back framed responses, so
//! these tests exercise the whole stack: socket, framing, handshake, auth
//! exchange, post-connect setup, command cycle and transaction replay.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use marlin::protocol::{capabilities, PacketWriter};
use marlin::{Configuration, Session};

/// One step of a connection script.
enum Step {
    /// Send raw pre-framed bytes to the client.
    Send(Vec<u8>),
    /// Read (and discard) one client packet.
    Expect,
    /// Drop the connection.
    Disconnect,
}

struct ConnectionScript {
    steps: Vec<Step>,
}

fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![
        (payload.len() & 0xFF) as u8,
        ((payload.len() >> 8) & 0xFF) as u8,
        ((payload.len() >> 16) & 0xFF) as u8,
        seq,
    ];
    out.extend_from_slice(payload);
    out
}

fn read_client_packet(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// Spawn a server that plays each script for one accepted connection.
fn spawn_server(scripts: Vec<ConnectionScript>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for script in scripts {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            for step in script.steps {
                match step {
                    Step::Send(bytes) => {
                        if stream.write_all(&bytes).is_err() {
                            break;
                        }
                    }
                    Step::Expect => {
                        if read_client_packet(&mut stream).is_err() {
                            break;
                        }
                    }
                    Step::Disconnect => {
                        drop(stream);
                        break;
                    }
                }
            }
        }
    });
    addr
}

/// Capabilities a MariaDB 10.6 server would advertise (CLIENT_MYSQL unset
/// marks the MariaDB flavor).
fn server_capabilities() -> u64 {
    capabilities::PROTOCOL_41
        | capabilities::SECURE_CONNECTION
        | capabilities::PLUGIN_AUTH
        | capabilities::LONG_FLAG
        | capabilities::TRANSACTIONS
        | capabilities::MULTI_RESULTS
        | capabilities::PS_MULTI_RESULTS
        | capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA
        | capabilities::DEPRECATE_EOF
        | capabilities::SESSION_TRACK
        | capabilities::CONNECT_WITH_DB
        | capabilities::CONNECT_ATTRS
}

fn initial_handshake(thread_id: u32, auth_plugin: &str) -> Vec<u8> {
    let caps = server_capabilities();
    let seed: Vec<u8> = (1..=20).collect();

    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_str("10.6.12-MariaDB");
    w.write_u32_le(thread_id);
    w.write_bytes(&seed[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(45);
    w.write_u16_le(0x0002); // autocommit
    w.write_u16_le(((caps >> 16) & 0xFFFF) as u16);
    w.write_u8(21); // seed length
    w.write_zeros(6);
    w.write_u32_le((caps >> 32) as u32);
    w.write_bytes(&seed[8..20]);
    w.write_u8(0);
    w.write_null_str(auth_plugin);
    frame(0, w.as_bytes())
}

fn ok_payload(affected: u64, status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected);
    w.write_lenenc_int(0);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

fn column_def(name: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_str("def");
    w.write_lenenc_str("");
    w.write_lenenc_str("");
    w.write_lenenc_str("");
    w.write_lenenc_str(name);
    w.write_lenenc_str(name);
    w.write_u8(0x0C);
    w.write_u16_le(33);
    w.write_u32_le(21);
    w.write_u8(0x08); // BIGINT
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_u16_le(0);
    w.into_bytes()
}

fn eof_ok(status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_lenenc_int(0);
    w.write_lenenc_int(0);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

/// Response frames for `SELECT @@max_allowed_packet, @@wait_timeout`.
fn limits_result_set() -> Vec<u8> {
    let mut out = frame(1, &[2]);
    out.extend_from_slice(&frame(2, &column_def("@@max_allowed_packet")));
    out.extend_from_slice(&frame(3, &column_def("@@wait_timeout")));
    let mut row = PacketWriter::new();
    row.write_lenenc_str("16777216");
    row.write_lenenc_str("28800");
    out.extend_from_slice(&frame(4, row.as_bytes()));
    out.extend_from_slice(&frame(5, &eof_ok(0)));
    out
}

/// Handshake + auth + post-connect steps shared by every healthy connection.
/// `first_connection` includes the host-limits query that later connections
/// skip thanks to the per-host cache.
fn connection_preamble(thread_id: u32, first_connection: bool) -> Vec<Step> {
    let mut steps = vec![
        Step::Send(initial_handshake(thread_id, "mysql_native_password")),
        Step::Expect, // handshake response
        Step::Send(frame(2, &ok_payload(0, 0x0002))),
        Step::Expect, // SET autocommit=..., sql_mode=...
        Step::Send(frame(1, &ok_payload(0, 0x0002))),
    ];
    if first_connection {
        steps.push(Step::Expect); // SELECT @@max_allowed_packet, @@wait_timeout
        steps.push(Step::Send(limits_result_set()));
    }
    steps
}

fn configuration(addr: std::net::SocketAddr) -> Configuration {
    Configuration::builder()
        .host("127.0.0.1")
        .port(addr.port())
        .user("app")
        .password("secret")
        .connect_timeout(Duration::from_secs(5))
        .socket_timeout(Duration::from_secs(5))
        .build()
}

const IN_TRANS: u16 = 0x0003; // autocommit | in-transaction

#[test]
fn connect_and_execute_over_tcp() {
    let mut steps = connection_preamble(42, true);
    steps.push(Step::Expect); // PING
    steps.push(Step::Send(frame(1, &ok_payload(0, 0x0002))));
    steps.push(Step::Expect); // INSERT
    steps.push(Step::Send(frame(1, &ok_payload(3, 0x0002))));
    steps.push(Step::Expect); // QUIT
    let addr = spawn_server(vec![ConnectionScript { steps }]);

    let conf = Arc::new(configuration(addr));
    let mut session = Session::connect(conf.clone()).unwrap();
    assert_eq!(session.thread_id(), 42);
    assert!(session.server_version().is_mariadb);
    // The host cache was filled from the handshake-time query.
    assert_eq!(conf.host.cached_max_allowed_packet(), 16_777_216);
    assert_eq!(conf.host.cached_wait_timeout(), 28_800);

    session.ping().unwrap();
    let ok = session.execute("INSERT INTO t VALUES (1),(2),(3)").unwrap();
    assert_eq!(ok.affected_rows, 3);
    session.close();
}

#[test]
fn transaction_replays_after_connection_loss() {
    // Connection 1 dies while acknowledging the second INSERT.
    let mut first = connection_preamble(7, true);
    first.extend([
        Step::Expect, // BEGIN
        Step::Send(frame(1, &ok_payload(0, IN_TRANS))),
        Step::Expect, // INSERT A
        Step::Send(frame(1, &ok_payload(1, IN_TRANS))),
        Step::Expect, // INSERT B
        Step::Disconnect,
    ]);

    // Connection 2 sees the replayed transaction, then the commit.
    let mut second = connection_preamble(8, false);
    second.extend([
        Step::Expect, // BEGIN (replayed)
        Step::Send(frame(1, &ok_payload(0, IN_TRANS))),
        Step::Expect, // INSERT A (replayed)
        Step::Send(frame(1, &ok_payload(1, IN_TRANS))),
        Step::Expect, // INSERT B (re-executed)
        Step::Send(frame(1, &ok_payload(1, IN_TRANS))),
        Step::Expect, // COMMIT
        Step::Send(frame(1, &ok_payload(0, 0x0002))),
        Step::Expect, // QUIT
    ]);

    let addr = spawn_server(vec![
        ConnectionScript { steps: first },
        ConnectionScript { steps: second },
    ]);

    let conf = Arc::new({
        let mut c = configuration(addr);
        c.transaction_replay = true;
        c
    });

    let mut session = Session::connect(conf).unwrap();
    assert_eq!(session.thread_id(), 7);

    session.execute("BEGIN").unwrap();
    let a = session.execute("INSERT INTO t VALUES ('A')").unwrap();
    assert_eq!(a.affected_rows, 1);

    // The server dies mid-command; the session replays the transaction on a
    // fresh connection and returns the re-executed command's result.
    let b = session.execute("INSERT INTO t VALUES ('B')").unwrap();
    assert_eq!(b.affected_rows, 1);
    assert_eq!(session.thread_id(), 8);
    assert!(session.in_transaction());

    session.execute("COMMIT").unwrap();
    assert!(!session.in_transaction());
    session.close();
}

#[test]
fn caching_sha2_without_rsa_key_fails_on_plaintext() {
    let steps = vec![
        Step::Send(initial_handshake(9, "caching_sha2_password")),
        Step::Expect, // handshake response with fast-path scramble
        Step::Send(frame(2, &[0x01, 0x04])), // perform full authentication
    ];
    let addr = spawn_server(vec![ConnectionScript { steps }]);

    let conf = Arc::new(configuration(addr));
    let err = Session::connect(conf).unwrap_err();
    assert_eq!(err.sql_state(), "28000");
    assert!(
        err.to_string().contains("RSA public key is not available client side"),
        "unexpected message: {err}"
    );
}

#[test]
fn caching_sha2_with_public_key_retrieval_succeeds() {
    use rsa::pkcs8::EncodePublicKey;

    // The mock only transports the key; it never needs to decrypt, so a
    // freshly generated keypair's public half is all that is required.
    let private = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .unwrap();

    let mut key_packet = vec![0x01];
    key_packet.extend_from_slice(public_pem.as_bytes());

    let mut steps = vec![
        Step::Send(initial_handshake(10, "caching_sha2_password")),
        Step::Expect,                        // handshake response
        Step::Send(frame(2, &[0x01, 0x04])), // perform full authentication
        Step::Expect,                        // 0x02 public key request
        Step::Send(frame(4, &key_packet)),
        Step::Expect, // RSA-encrypted password
        Step::Send(frame(6, &ok_payload(0, 0x0002))),
        Step::Expect, // SET ...
        Step::Send(frame(1, &ok_payload(0, 0x0002))),
        Step::Expect, // limits query
        Step::Send(limits_result_set()),
    ];
    steps.push(Step::Expect); // QUIT
    let addr = spawn_server(vec![ConnectionScript { steps }]);

    let conf = Arc::new({
        let mut c = configuration(addr);
        c.allow_public_key_retrieval = true;
        c
    });
    let session = Session::connect(conf).unwrap();
    assert_eq!(session.thread_id(), 10);
    session.close();
}

#[test]
fn pool_round_trip_over_tcp() {
    let mut steps = connection_preamble(30, true);
    steps.extend([
        Step::Expect, // INSERT (first checkout)
        Step::Send(frame(1, &ok_payload(1, 0x0002))),
        Step::Expect, // INSERT (second checkout, same session)
        Step::Send(frame(1, &ok_payload(1, 0x0002))),
    ]);
    let addr = spawn_server(vec![ConnectionScript { steps }]);

    let conf = Arc::new({
        let mut c = configuration(addr);
        c.min_pool_size = 1;
        c.max_pool_size = 2;
        c
    });
    let pool = marlin::Pool::new(conf, "live-pool".into());
    assert_eq!(pool.status().idle, 1);

    {
        let mut conn = pool.get_connection().unwrap();
        conn.execute("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(pool.status().active, 1);
    }
    // Returned to the idle LIFO on drop.
    assert_eq!(pool.status().idle, 1);

    {
        let mut conn = pool.get_connection().unwrap();
        conn.execute("INSERT INTO t VALUES (2)").unwrap();
        // Same physical session both times.
        assert_eq!(conn.thread_id(), 30);
    }

    pool.close();
    assert_eq!(pool.status().total, 0);
}
