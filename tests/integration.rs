//! Integration tests for fcgi-mux.
//!
//! Each test scripts what a web server would send over one connection,
//! serves it with a [`Service`] and checks the records written back.

mod common;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{end_requests, init_tracing, pairs, stdout_of, stream_of, MockConnection, Script};
use fcgi_mux::handler::{Handler, HandlerResult, ResponderContext};
use fcgi_mux::protocol::{
    values, EndRequestBody, ProtocolStatus, RecordType, Role, UnknownTypeBody, VERSION_1,
};
use fcgi_mux::{Connection, FcgiError, Service};

fn echo_service() -> Service {
    Service::builder()
        .responder(|ctx| {
            let id = ctx.request_id();
            let mut body = String::new();
            ctx.stdin().read_to_string(&mut body)?;
            write!(ctx.stdout(), "{}:{}", id, body)?;
            Ok(0)
        })
        .build()
        .unwrap()
}

fn complete(status: u32) -> EndRequestBody {
    EndRequestBody::new(status, ProtocolStatus::RequestComplete)
}

/// Two interleaved requests on one connection stay independent.
#[test]
fn test_two_multiplexed_requests() {
    init_tracing();
    let script = Script::new()
        .begin(1, Role::Responder, true)
        .begin(2, Role::Responder, true)
        .params(2, &[("CONTENT_LENGTH", "3")])
        .params(1, &[("CONTENT_LENGTH", "5")])
        .record(RecordType::Stdin, 1, b"al")
        .record(RecordType::Stdin, 2, b"two")
        .record(RecordType::Stdin, 1, b"pha")
        .record(RecordType::Stdin, 2, b"")
        .record(RecordType::Stdin, 1, b"")
        .build();
    let conn = MockConnection::scripted(script);

    echo_service().serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(stdout_of(&records, 1), "1:alpha");
    assert_eq!(stdout_of(&records, 2), "2:two");
    assert_eq!(end_requests(&records, 1), vec![complete(0)]);
    assert_eq!(end_requests(&records, 2), vec![complete(0)]);
    assert!(conn.is_closed());
}

/// A role without a handler gets exactly one END_REQUEST and no thread.
#[test]
fn test_unknown_role_rejected() {
    let script = Script::new().begin(1, Role::Filter, true).build();
    let conn = MockConnection::scripted(script);

    echo_service().serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        end_requests(&records, 1),
        vec![EndRequestBody::new(0, ProtocolStatus::UnknownRole)]
    );
}

/// Role codes outside 1..=3 are answered the same way.
#[test]
fn test_invalid_role_code_rejected() {
    let mut body = [0u8; 8];
    body[1] = 9;
    let script = Script::new().record(RecordType::BeginRequest, 4, &body).build();
    let conn = MockConnection::scripted(script);

    echo_service().serve_connection(conn.clone()).unwrap();

    assert_eq!(
        end_requests(&conn.records(), 4),
        vec![EndRequestBody::new(0, ProtocolStatus::UnknownRole)]
    );
}

/// Without KEEP_CONN the server closes the connection after the request.
#[test]
fn test_request_without_keep_conn_closes_connection() {
    init_tracing();
    let script = Script::new()
        .begin(1, Role::Responder, false)
        .params(1, &[("CONTENT_LENGTH", "0")])
        .stdin(1, b"")
        .build();
    // the peer never closes; the server has to
    let conn = MockConnection::held_open(script);

    echo_service().serve_connection(conn.clone()).unwrap();
    assert!(conn.is_closed());

    let records = conn.records();
    assert_eq!(stdout_of(&records, 1), "1:");
    let kinds: Vec<RecordType> = records.iter().map(|r| r.record_type()).collect();
    assert_eq!(kinds.last(), Some(&RecordType::EndRequest));

    // both output streams are terminated before END_REQUEST
    let empty_stdout = records
        .iter()
        .position(|r| r.record_type() == RecordType::Stdout && r.content().is_empty())
        .unwrap();
    let empty_stderr = records
        .iter()
        .position(|r| r.record_type() == RecordType::Stderr && r.content().is_empty())
        .unwrap();
    assert!(empty_stdout < records.len() - 1);
    assert!(empty_stderr < records.len() - 1);
    assert_eq!(end_requests(&records, 1), vec![complete(0)]);
}

/// A closing request ends the connection while another request still waits
/// for input; that request sees the input received so far as its whole body.
#[test]
fn test_closing_request_truncates_other_active_request() {
    init_tracing();
    let service = Service::builder()
        .responder(|ctx| {
            let id = ctx.request_id();
            let mut body = String::new();
            ctx.stdin().read_to_string(&mut body)?;
            write!(ctx.stdout(), "{}:{}", id, body)?;
            Ok(body.len() as i32)
        })
        .build()
        .unwrap();

    let script = Script::new()
        .begin(2, Role::Responder, true)
        .params(2, &[("CONTENT_LENGTH", "5")])
        .record(RecordType::Stdin, 2, b"ab")
        .begin(1, Role::Responder, false)
        .params(1, &[("CONTENT_LENGTH", "0")])
        .stdin(1, b"")
        .build();
    let conn = MockConnection::held_open(script);

    service.serve_connection(conn.clone()).unwrap();
    assert!(conn.is_closed());

    let records = conn.records();
    assert_eq!(end_requests(&records, 1), vec![complete(0)]);
    assert_eq!(stdout_of(&records, 2), "2:ab");
    assert_eq!(end_requests(&records, 2), vec![complete(2)]);
}

#[test]
fn test_get_values_reports_multiplexing() {
    let query = fcgi_mux::protocol::encode_pairs([
        (values::MAX_CONNS.as_bytes(), &b""[..]),
        (values::MPXS_CONNS.as_bytes(), &b""[..]),
    ])
    .unwrap();
    let script = Script::new().record(RecordType::GetValues, 0, &query).build();
    let conn = MockConnection::scripted(script);

    echo_service().serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_type(), RecordType::GetValuesResult);
    assert_eq!(records[0].header.request_id, 0);
    assert_eq!(
        pairs(&records[0].content),
        vec![(values::MPXS_CONNS.to_string(), "1".to_string())]
    );
}

/// A panicking handler reports failure; the connection keeps serving.
#[test]
fn test_handler_panic_is_contained() {
    let service = Service::builder()
        .responder(|ctx| {
            if ctx.param("PANIC").is_some() {
                panic!("handler blew up");
            }
            ctx.stdout().write_all(b"fine")?;
            Ok(0)
        })
        .build()
        .unwrap();
    let script = Script::new()
        .begin(1, Role::Responder, true)
        .params(1, &[("PANIC", "yes")])
        .begin(2, Role::Responder, true)
        .params(2, &[])
        .build();
    let conn = MockConnection::scripted(script);

    service.serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(end_requests(&records, 1), vec![complete(u32::MAX)]);
    assert_eq!(stream_of(&records, RecordType::Stdout, 1), b"");
    assert_eq!(stdout_of(&records, 2), "fine");
    assert_eq!(end_requests(&records, 2), vec![complete(0)]);
}

#[test]
fn test_handler_error_reports_failure() {
    let service = Service::builder()
        .authorizer(|ctx| {
            ctx.stderr().write_all(b"denied")?;
            Err(FcgiError::HandlerFault("no credentials".into()))
        })
        .build()
        .unwrap();
    let script = Script::new()
        .begin(3, Role::Authorizer, true)
        .params(3, &[])
        .build();
    let conn = MockConnection::scripted(script);

    service.serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(stream_of(&records, RecordType::Stderr, 3), b"denied");
    assert_eq!(end_requests(&records, 3), vec![complete(0xFFFF_FFFF)]);
}

/// Bytes past a full request buffer are dropped and framing stays intact.
#[test]
fn test_full_stdin_buffer_drops_excess() {
    let service = Service::builder()
        .stdin_limit(4)
        .responder(|ctx| {
            let mut body = Vec::new();
            ctx.stdin().read_to_end(&mut body)?;
            ctx.stdout().write_all(&body)?;
            Ok(body.len() as i32)
        })
        .build()
        .unwrap();
    let script = Script::new()
        .begin(1, Role::Responder, true)
        .record(RecordType::Stdin, 1, b"0123456789")
        .params(1, &[("CONTENT_LENGTH", "4")])
        .record(RecordType::Stdin, 1, b"")
        .begin(2, Role::Responder, true)
        .params(2, &[("CONTENT_LENGTH", "2")])
        .stdin(2, b"ok")
        .build();
    let conn = MockConnection::scripted(script);

    service.serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(stdout_of(&records, 1), "0123");
    assert_eq!(end_requests(&records, 1), vec![complete(4)]);
    assert_eq!(stdout_of(&records, 2), "ok");
}

#[test]
fn test_abort_cancels_request() {
    let service = Service::builder()
        .responder(|ctx| {
            for _ in 0..5000 {
                if ctx.is_cancelled() {
                    ctx.stdout().write_all(b"cancelled")?;
                    return Ok(2);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(0)
        })
        .build()
        .unwrap();
    let script = Script::new()
        .begin(7, Role::Responder, true)
        .params(7, &[])
        .abort(7)
        .build();
    let conn = MockConnection::scripted(script);

    service.serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(stdout_of(&records, 7), "cancelled");
    assert_eq!(end_requests(&records, 7), vec![complete(2)]);
}

#[test]
fn test_unsupported_record_type_answered() {
    let script = Script::new()
        .record(RecordType::Stdout, 1, b"not for us")
        .record(RecordType::Other(42), 0, b"")
        .build();
    let conn = MockConnection::scripted(script);

    echo_service().serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    let rejected: Vec<u8> = records
        .iter()
        .map(|r| {
            assert_eq!(r.record_type(), RecordType::UnknownType);
            assert_eq!(r.header.request_id, 0);
            UnknownTypeBody::decode(r.content()).unwrap().record_type
        })
        .collect();
    assert_eq!(rejected, vec![RecordType::Stdout.code(), 42]);
}

/// Records for ids that were never begun are dropped without a reply.
#[test]
fn test_records_for_unknown_request_ignored() {
    let script = Script::new()
        .record(RecordType::Stdin, 5, b"orphan")
        .abort(6)
        .params(8, &[("A", "B")])
        .build();
    let conn = MockConnection::scripted(script);

    echo_service().serve_connection(conn.clone()).unwrap();
    assert!(conn.written().is_empty());
}

#[test]
fn test_version_mismatch_drops_connection() {
    let mut wire = Script::new().begin(1, Role::Responder, true).build();
    wire[0] = VERSION_1 + 1;
    let conn = MockConnection::scripted(wire);

    let err = echo_service().serve_connection(conn.clone()).unwrap_err();
    assert!(matches!(err, FcgiError::VersionMismatch { actual: 2, .. }));
    assert!(conn.written().is_empty());
    assert!(conn.is_closed());
}

#[test]
fn test_truncated_record_is_framing_error() {
    let mut wire = Script::new().begin(1, Role::Responder, true).build();
    wire.truncate(12);
    let conn = MockConnection::scripted(wire);

    let err = echo_service().serve_connection(conn.clone()).unwrap_err();
    assert!(matches!(err, FcgiError::Framing(_)));
    assert!(conn.is_closed());
}

/// A filter sees its whole STDIN before it runs, then reads DATA.
#[test]
fn test_filter_reads_stdin_then_data() {
    let service = Service::builder()
        .filter(|ctx| {
            // already fully buffered
            assert_eq!(ctx.stdin().expected_len(), 3);
            let mut stdin = String::new();
            ctx.stdin().read_to_string(&mut stdin)?;
            let mut data = String::new();
            ctx.data().read_to_string(&mut data)?;
            write!(ctx.stdout(), "{}|{}", stdin, data.to_uppercase())?;
            Ok(0)
        })
        .build()
        .unwrap();
    let script = Script::new()
        .begin(1, Role::Filter, true)
        .params(1, &[("CONTENT_LENGTH", "3"), ("FCGI_DATA_LENGTH", "11")])
        .stdin(1, b"abc")
        .data(1, b"hello world")
        .build();
    let conn = MockConnection::scripted(script);

    service.serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    assert_eq!(stdout_of(&records, 1), "abc|HELLO WORLD");
    assert_eq!(end_requests(&records, 1), vec![complete(0)]);
}

/// Output larger than one page is split into page-sized records in order.
#[test]
fn test_large_output_split_into_records() {
    let service = Service::builder()
        .output_page_size(1000)
        .responder(|ctx| {
            for i in 0..100u32 {
                write!(ctx.stdout(), "{:04}-------------------------------------------\n", i)?;
            }
            Ok(0)
        })
        .build()
        .unwrap();
    let script = Script::new()
        .begin(1, Role::Responder, true)
        .params(1, &[])
        .build();
    let conn = MockConnection::scripted(script);

    service.serve_connection(conn.clone()).unwrap();

    let records = conn.records();
    let stdout_records: Vec<_> = records
        .iter()
        .filter(|r| r.record_type() == RecordType::Stdout)
        .collect();
    assert!(stdout_records.len() > 2);
    assert!(stdout_records.iter().all(|r| r.content().len() <= 1000));

    let text = stdout_of(&records, 1);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 100);
    assert!(lines[99].starts_with("0099"));
}

/// A request id can be reused once its request has ended.
#[test]
fn test_request_id_reuse() {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let service = Service::builder()
        .responder(move |ctx| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            write!(ctx.stdout(), "run {}", n)?;
            Ok(0)
        })
        .build()
        .unwrap();

    let first = Script::new().begin(1, Role::Responder, true).params(1, &[]);
    let conn = MockConnection::held_open(first.build());
    let runner = {
        let service = service.clone();
        let conn = conn.clone();
        std::thread::spawn(move || service.serve_connection(conn))
    };

    let wait_for_ends = |n: usize| {
        for _ in 0..5000 {
            if end_requests(&conn.records(), 1).len() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("no END_REQUEST #{}", n);
    };

    wait_for_ends(1);
    conn.feed(&Script::new().begin(1, Role::Responder, true).params(1, &[]).build());
    wait_for_ends(2);
    conn.close();
    runner.join().unwrap().unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(stdout_of(&conn.records(), 1), "run 0run 1");
}

struct Counter {
    calls: Arc<AtomicUsize>,
}

impl Handler for Counter {
    type Context = ResponderContext;

    fn run(&mut self, ctx: &mut ResponderContext) -> HandlerResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        write!(ctx.stdout(), "{}", n)?;
        Ok(0)
    }
}

/// Handler types get a fresh instance per request.
#[test]
fn test_handler_type_per_request() {
    let calls = Arc::new(AtomicUsize::new(0));
    let factory_calls = calls.clone();
    let service = Service::builder()
        .handler(move || Counter {
            calls: factory_calls.clone(),
        })
        .build()
        .unwrap();
    let script = Script::new()
        .begin(1, Role::Responder, true)
        .params(1, &[])
        .begin(2, Role::Responder, true)
        .params(2, &[])
        .build();
    let conn = MockConnection::scripted(script);

    service.serve_connection(conn.clone()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(end_requests(&conn.records(), 2), vec![complete(0)]);
}

/// End to end over a loopback TCP socket.
#[test]
fn test_tcp_round_trip() {
    use fcgi_mux::SocketConnection;
    use std::net::{Shutdown, TcpListener, TcpStream};

    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let service = echo_service();
    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        service.serve_connection(SocketConnection::new(stream).unwrap())
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let script = Script::new()
        .begin(1, Role::Responder, false)
        .params(1, &[("CONTENT_LENGTH", "4")])
        .stdin(1, b"ping")
        .build();
    client.write_all(&script).unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    client.shutdown(Shutdown::Both).ok();
    server.join().unwrap().unwrap();

    let records = common::parse_records(&reply);
    assert_eq!(stdout_of(&records, 1), "1:ping");
    assert_eq!(end_requests(&records, 1), vec![complete(0)]);
}
