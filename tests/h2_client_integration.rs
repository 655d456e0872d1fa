//! HTTP/2 client integration tests
//!
//! Runs `H2Client` against the scripted peer in `common` and covers:
//! - ALPN negotiation of "h2" over TLS, and refusal when it is missing
//! - Sequential requests on stream ids 1, 3, 5, ...
//! - Bodies larger than the initial windows (flow-control acknowledgement)
//! - Cleartext prior-knowledge connections
//! - HEAD, 204 and 404 responses, trailers
//! - RST_STREAM, GOAWAY, premature close and read timeouts, including a
//!   server slower than the connect timeout
//! - Explicit stream ids, PING and connection close

mod common;

use common::{body_of, init_logging, PeerServer, LARGE_BODY, MEDIUM_BODY};
use ion_harness::http::h2::{
    ConnectionState, Error, ErrorCode, Event, H2Client, H2ClientBuilder,
    DEFAULT_INITIAL_WINDOW_SIZE,
};
use ion_harness::http::tls::TlsConfig;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

fn connect(peer: &PeerServer) -> H2Client {
    H2Client::connect("127.0.0.1", peer.port(), true).unwrap()
}

fn request_headers<'a>(path: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        (":method", "GET"),
        (":path", path),
        (":authority", "localhost"),
        (":scheme", "https"),
    ]
}

#[test]
fn test_tls_get_negotiates_h2() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    assert_eq!(client.alpn(), Some("h2"));

    let response = client.get("/ok").unwrap();
    assert_eq!(response.stream_id(), 1);
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_str().unwrap(), "ok");
    assert_eq!(response.header("server"), Some("ion-peer"));
    assert_eq!(response.header("content-length"), Some("2"));
    // Pseudo-headers are not part of the header map
    assert!(response.header(":status").is_none());

    assert_eq!(client.state(), ConnectionState::Active);
    client.close().unwrap();
}

#[test]
fn test_sequential_requests_use_odd_stream_ids() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    let mut ids = Vec::new();
    for _ in 0..10 {
        let response = client.get("/ok").unwrap();
        assert_eq!(response.status(), 200);
        ids.push(response.stream_id());
    }

    assert_eq!(ids, vec![1, 3, 5, 7, 9, 11, 13, 15, 17, 19]);
    assert_eq!(client.next_stream_id().unwrap(), 21);
    // Finished streams are not kept around
    assert_eq!(client.connection().tracked_streams(), 0);
    client.close().unwrap();
}

#[test]
fn test_large_body_returns_all_credit() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    let response = client.get("/large").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body().len(), LARGE_BODY);
    assert!(response.body() == body_of(LARGE_BODY).as_slice());

    // Far more than one window's worth arrived in many DATA frames
    let data_events = response
        .events()
        .iter()
        .filter(|event| matches!(event, Event::DataReceived { .. }))
        .count();
    assert!(data_events >= LARGE_BODY / 16384);

    // Every received byte was acknowledged on the connection
    assert_eq!(
        client.connection().flow().recv.size(),
        DEFAULT_INITIAL_WINDOW_SIZE as i64
    );

    // The connection is still usable afterwards
    assert_eq!(client.get("/medium").unwrap().body().len(), MEDIUM_BODY);
    client.close().unwrap();
}

#[test]
fn test_cleartext_prior_knowledge() {
    init_logging();
    let peer = PeerServer::builder().cleartext().spawn();
    let mut client = H2ClientBuilder::new()
        .scheme("http")
        .connect("127.0.0.1", peer.port(), false)
        .unwrap();

    assert_eq!(client.alpn(), None);

    let response = client.get("/medium").unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.body() == body_of(MEDIUM_BODY).as_slice());
    client.close().unwrap();
}

#[test]
fn test_head_no_content_and_not_found() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    let head = client.head("/ok").unwrap();
    assert_eq!(head.status(), 200);
    assert!(head.body().is_empty());
    assert_eq!(head.header("content-length"), Some("2"));

    let empty = client.get("/empty").unwrap();
    assert_eq!(empty.status(), 204);
    assert!(empty.body().is_empty());

    let missing = client.get("/nowhere").unwrap();
    assert_eq!(missing.status(), 404);
    assert_eq!(missing.body_str().unwrap(), "not found");
    client.close().unwrap();
}

#[test]
fn test_trailers_are_separate_from_headers() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    let response = client.get("/trailers").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_str().unwrap(), "ok");
    assert_eq!(response.trailers().get("x-checksum").map(String::as_str), Some("2"));
    assert!(response.header("x-checksum").is_none());

    let names: Vec<&str> = response.events().iter().map(Event::name).collect();
    assert_eq!(
        names.iter().filter(|name| **name == "TrailersReceived").count(),
        1
    );
    assert_eq!(names.last(), Some(&"StreamEnded"));
    client.close().unwrap();
}

#[test]
fn test_stream_reset_leaves_connection_usable() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    match client.get("/reset") {
        Err(Error::StreamReset {
            stream_id,
            error_code,
            ..
        }) => {
            assert_eq!(stream_id, 1);
            assert_eq!(error_code, ErrorCode::InternalError.as_u32());
        }
        other => panic!("expected StreamReset, got {:?}", other.map(|r| r.status())),
    }

    let response = client.get("/ok").unwrap();
    assert_eq!(response.stream_id(), 3);
    assert_eq!(response.status(), 200);
    client.close().unwrap();
}

#[test]
fn test_goaway_before_stream_is_connection_terminated() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    let err = client.get("/goaway").unwrap_err();
    match &err {
        Error::ConnectionTerminated {
            last_stream_id,
            error_code,
            events,
        } => {
            assert_eq!(*last_stream_id, 0);
            assert_eq!(*error_code, ErrorCode::NoError.as_u32());
            assert!(events
                .iter()
                .any(|event| matches!(event, Event::ConnectionTerminated { .. })));
        }
        other => panic!("expected ConnectionTerminated, got {other}"),
    }
    assert_eq!(client.state(), ConnectionState::Closing);
}

#[test]
fn test_dropped_connection_is_premature_close() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    match client.get("/drop") {
        Err(Error::PrematureClose { stream_id, .. }) => assert_eq!(stream_id, 1),
        other => panic!("expected PrematureClose, got {:?}", other.map(|r| r.status())),
    }
}

#[test]
fn test_silent_stream_times_out() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = H2ClientBuilder::new()
        .read_timeout(Duration::from_millis(300))
        .connect("127.0.0.1", peer.port(), true)
        .unwrap();

    let err = client.get("/stall").unwrap_err();
    assert!(matches!(err, Error::ReadTimeout { stream_id: 1, .. }), "got {err}");
    // Whatever arrived before the timeout is still reported
    assert!(err.events().is_some());
}

#[test]
fn test_slow_server_bounded_by_read_timeout() {
    init_logging();
    let peer = PeerServer::builder()
        .settings_delay(Duration::from_secs(1))
        .spawn();
    let mut client = H2ClientBuilder::new()
        .connect_timeout(Duration::from_millis(300))
        .read_timeout(Duration::from_secs(5))
        .connect("127.0.0.1", peer.port(), true)
        .unwrap();

    let response = client.get("/ok").unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"ok");
    client.close().unwrap();
}

#[test]
fn test_slow_server_past_read_timeout() {
    init_logging();
    let peer = PeerServer::builder()
        .settings_delay(Duration::from_secs(2))
        .spawn();
    let mut client = H2ClientBuilder::new()
        .connect_timeout(Duration::from_secs(5))
        .read_timeout(Duration::from_millis(300))
        .connect("127.0.0.1", peer.port(), true)
        .unwrap();

    let err = client.get("/ok").unwrap_err();
    assert!(matches!(err, Error::ReadTimeout { stream_id: 1, .. }), "got {err}");
}

#[test]
fn test_explicit_stream_ids() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    let first = client.send_request_on(1, &request_headers("/ok")).unwrap();
    assert_eq!(first.stream_id(), 1);

    // Reused, even and decreasing ids are refused before anything is sent
    assert!(matches!(
        client.send_request_on(1, &request_headers("/ok")),
        Err(Error::InvalidStreamId(1))
    ));
    assert!(matches!(
        client.send_request_on(4, &request_headers("/ok")),
        Err(Error::InvalidStreamId(4))
    ));

    // Skipping ahead is allowed
    let skipped = client.send_request_on(7, &request_headers("/ok")).unwrap();
    assert_eq!(skipped.status(), 200);
    assert_eq!(client.next_stream_id().unwrap(), 9);

    assert!(matches!(
        client.send_request_on(5, &request_headers("/ok")),
        Err(Error::InvalidStreamId(5))
    ));
    client.close().unwrap();
}

#[test]
fn test_ping_round_trip() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);

    let events = client.ping(*b"ionping!").unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::PingAckReceived { data } if data == b"ionping!")));
    client.close().unwrap();
}

#[test]
fn test_close_releases_server_connection() {
    init_logging();
    let peer = PeerServer::spawn();
    let mut client = connect(&peer);
    client.get("/ok").unwrap();
    assert_eq!(peer.active(), 1);

    client.close().unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(common::eventually(Duration::from_secs(2), || peer.active() == 0));

    // Closing twice is harmless
    client.close().unwrap();
}

#[test]
fn test_missing_alpn_is_refused() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let (tcp, _) = listener.accept().unwrap();
        // No ALPN callback: the server never selects a protocol
        let config = TlsConfig::server().unwrap().build().unwrap();
        let _session = config.accept(tcp).unwrap();
        thread::sleep(Duration::from_millis(500));
    });

    match H2Client::connect("127.0.0.1", port, true) {
        Err(Error::AlpnFailed(None)) => {}
        Err(other) => panic!("expected AlpnFailed, got {other}"),
        Ok(_) => panic!("connection without ALPN must be refused"),
    }
}
