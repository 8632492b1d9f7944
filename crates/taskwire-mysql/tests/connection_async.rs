//! The async driver over a scripted in-memory transport.

mod common;

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use taskwire_core::{AuthenticationError, AuthenticationErrorKind, ConnectionErrorKind, Error, Value};
use taskwire_mysql::protocol::capabilities::CLIENT_SSL;
use taskwire_mysql::{FieldType, MySqlConfig, MySqlConnection, SharedMySqlConnection, SslMode, Transport};

use common::{AUTOCOMMIT, Server, config, frames, greeting, modern_server};

/// Replays one scripted server flight per read and records every write.
struct ScriptedStream {
    flights: VecDeque<Vec<u8>>,
    pending: Vec<u8>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedStream {
    fn new(flights: Vec<Vec<u8>>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = Self {
            flights: flights.into(),
            pending: Vec::new(),
            written: Arc::clone(&written),
        };
        (stream, written)
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match this.flights.pop_front() {
                Some(flight) => this.pending = flight,
                // server hung up
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending[..n]);
        this.pending.drain(..n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Transport for ScriptedStream {
    fn upgrade_to_ssl(&mut self, _config: &MySqlConfig) -> impl Future<Output = taskwire_core::Result<()>> + Send {
        async { Ok(()) }
    }
}

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn login_flights() -> Vec<Vec<u8>> {
    let mut hello = Server::new(0);
    hello.packet(greeting(modern_server(), "mysql_native_password"));
    let mut ok = Server::new(2);
    ok.ok(0, 0, AUTOCOMMIT);
    vec![hello.into_bytes(), ok.into_bytes()]
}

fn select_one_flight() -> Vec<u8> {
    let mut server = Server::new(1);
    server
        .column_count(1)
        .column("1", FieldType::LongLong)
        .text_row(&[Some("1")])
        .ok_eof(AUTOCOMMIT);
    server.into_bytes()
}

#[test]
fn connect_query_close() {
    let mut flights = login_flights();
    flights.push(select_one_flight());
    let (stream, written) = ScriptedStream::new(flights);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut conn = unwrap_outcome(MySqlConnection::connect_with(&cx, stream, config()).await);
        assert_eq!(conn.server_version(), Some("8.0.36"));
        assert_eq!(conn.thread_id(), Some(42));

        let sets = unwrap_outcome(conn.query(&cx, "SELECT 1").await);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].rows[0].get_as::<i64>(0).unwrap(), 1);

        unwrap_outcome(conn.close(&cx).await);
    });

    let sent = frames(&written.lock().unwrap());
    // handshake response, query, quit
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].0, 1);
    assert_eq!(sent[1], (0, b"\x03SELECT 1".to_vec()));
    assert_eq!(sent[2], (0, vec![0x01]));
}

#[test]
fn prepare_and_execute() {
    let mut flights = login_flights();
    let mut prepared = Server::new(1);
    prepared
        .prepare_ok(3, 1, 1)
        .column("?", FieldType::LongLong)
        .column("v", FieldType::Long);
    flights.push(prepared.into_bytes());
    let mut rows = Server::new(1);
    rows.column_count(1)
        .column("v", FieldType::Long)
        .binary_int_row(42)
        .ok_eof(AUTOCOMMIT);
    flights.push(rows.into_bytes());
    let (stream, written) = ScriptedStream::new(flights);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut conn = unwrap_outcome(MySqlConnection::connect_with(&cx, stream, config()).await);
        let stmt = unwrap_outcome(conn.prepare(&cx, "SELECT ? + 1").await);
        assert_eq!(stmt.param_count(), 1);

        let sets = unwrap_outcome(conn.execute(&cx, &stmt, &[Value::BigInt(41)]).await);
        assert_eq!(sets[0].rows[0].values(), &[Value::Int(42)]);

        unwrap_outcome(conn.close_statement(&cx, &stmt).await);
        assert!(stmt.is_closed());
    });

    let sent = frames(&written.lock().unwrap());
    let execute = &sent[2];
    assert_eq!(execute.0, 0);
    assert_eq!(execute.1[0], 0x17);
    assert_eq!(&execute.1[1..5], &3u32.to_le_bytes());
    assert_eq!(sent[3], (0, vec![0x19, 3, 0, 0, 0]));
}

#[test]
fn server_error_keeps_connection_usable() {
    let mut flights = login_flights();
    let mut err = Server::new(1);
    err.err(1064, "42000", "syntax error");
    flights.push(err.into_bytes());
    let mut pong = Server::new(1);
    pong.ok(0, 0, AUTOCOMMIT);
    flights.push(pong.into_bytes());
    let (stream, _written) = ScriptedStream::new(flights);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut conn = unwrap_outcome(MySqlConnection::connect_with(&cx, stream, config()).await);
        match conn.query(&cx, "SELEC 1").await {
            Outcome::Err(Error::Server(e)) => assert_eq!(e.code, 1064),
            other => panic!("expected server error, got {other:?}"),
        }
        assert!(!conn.is_broken());
        unwrap_outcome(conn.ping(&cx).await);
    });
}

#[test]
fn server_hangup_breaks_connection() {
    let (stream, _written) = ScriptedStream::new(login_flights());

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let mut conn = unwrap_outcome(MySqlConnection::connect_with(&cx, stream, config()).await);
        match conn.ping(&cx).await {
            Outcome::Err(Error::Connection(e)) => assert_eq!(e.kind, ConnectionErrorKind::Disconnected),
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(conn.is_broken());
        match conn.ping(&cx).await {
            Outcome::Err(Error::Connection(e)) => assert_eq!(e.kind, ConnectionErrorKind::Broken),
            other => panic!("expected broken connection, got {other:?}"),
        }
    });
}

#[test]
fn access_denied() {
    let mut hello = Server::new(0);
    hello.packet(greeting(modern_server(), "mysql_native_password"));
    let mut denied = Server::new(2);
    denied.err(1045, "28000", "Access denied for user 'app'");
    let (stream, _written) = ScriptedStream::new(vec![hello.into_bytes(), denied.into_bytes()]);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        match MySqlConnection::connect_with(&cx, stream, config()).await {
            Outcome::Err(Error::Authentication(AuthenticationError { kind, code, .. })) => {
                assert_eq!(kind, AuthenticationErrorKind::Rejected);
                assert_eq!(code, Some(1045));
            }
            other => panic!("expected authentication failure, got {other:?}"),
        }
    });
}

#[test]
fn preferred_ssl_falls_back_on_plain_transport() {
    let mut hello = Server::new(0);
    hello.packet(greeting(modern_server() | CLIENT_SSL, "mysql_native_password"));
    let mut ok = Server::new(2);
    ok.ok(0, 0, AUTOCOMMIT);
    let (stream, written) = ScriptedStream::new(vec![hello.into_bytes(), ok.into_bytes()]);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = unwrap_outcome(
            MySqlConnection::connect_with(&cx, stream, config().ssl_mode(SslMode::Preferred)).await,
        );
        assert!(!conn.session().supports_ssl());
    });

    let sent = frames(&written.lock().unwrap());
    // a full handshake response, not a 32-byte SSLRequest
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.len() > 32);
}

#[test]
fn shared_connection_serializes_callers() {
    let mut flights = login_flights();
    flights.push(select_one_flight());
    flights.push(select_one_flight());
    let (stream, _written) = ScriptedStream::new(flights);

    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = unwrap_outcome(MySqlConnection::connect_with(&cx, stream, config()).await);
        let shared = SharedMySqlConnection::new(conn);
        let other = shared.clone();

        let first = unwrap_outcome(shared.query(&cx, "SELECT 1").await);
        let second = unwrap_outcome(other.query(&cx, "SELECT 1").await);
        assert_eq!(first[0].rows, second[0].rows);
    });
}
