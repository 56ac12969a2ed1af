//! Framed I/O over real socketpairs.

use std::io::Write;
use std::net::TcpListener;
use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use conn::{Connection, Flush, Progress, Wait};
use fdset::FdSet;
use parking_lot::Mutex;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Wrap both ends of a socketpair.
fn pair() -> (Arc<Connection>, Arc<Connection>) {
    let (a, b) = UnixStream::pair().unwrap();
    let a = Connection::wrap_fd(a.into_raw_fd()).unwrap();
    let b = Connection::wrap_fd(b.into_raw_fd()).unwrap();
    (a, b)
}

/// Poll `read` until it produces a frame or the deadline passes.
fn read_eventually(mut read: impl FnMut() -> Option<Vec<u8>>) -> Option<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Some(frame) = read() {
            return Some(frame);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

#[test]
fn fixed_round_trip() {
    init_logging();
    let (a, b) = pair();
    assert_eq!(a.write(b"abcdef").unwrap(), Progress::Complete);
    let frame = read_eventually(|| b.read_fixed(6)).expect("six bytes");
    assert_eq!(frame, b"abcdef");
}

#[test]
fn length_prefixed_round_trip() {
    init_logging();
    let (a, b) = pair();

    // Nothing there yet: non-blocking "not yet".
    assert!(b.read_with_length().is_none());

    a.write_with_length(b"HELLO").unwrap();
    let frame = read_eventually(|| b.read_with_length()).expect("frame");
    assert_eq!(frame, b"HELLO");
    assert!(b.read_with_length().is_none());
}

#[test]
fn length_prefixed_empty_frame() {
    init_logging();
    let (a, b) = pair();
    a.write_with_length(b"").unwrap();
    let frame = read_eventually(|| b.read_with_length()).expect("empty frame");
    assert!(frame.is_empty());
}

#[test]
fn negative_length_prefix_is_skipped() {
    init_logging();
    let (a, b) = pair();

    // Corrupt prefix (top bit set), then a valid frame.
    a.write(&[0xff, 0xff, 0xff, 0xff]).unwrap();
    a.write_with_length(b"ok").unwrap();

    let frame = read_eventually(|| b.read_with_length()).expect("recovered frame");
    assert_eq!(frame, b"ok");
}

#[test]
fn read_line_strips_terminators() {
    init_logging();
    let (a, b) = pair();
    a.write(b"line1\nline2\r\nline3").unwrap();

    assert_eq!(read_eventually(|| b.read_line()).unwrap(), b"line1");
    assert_eq!(read_eventually(|| b.read_line()).unwrap(), b"line2");
    // No trailing LF for line3 yet.
    assert!(b.read_line().is_none());
    // The unterminated tail is still buffered, untouched.
    assert_eq!(b.inbuf_len(), 5);

    a.write(b"\n").unwrap();
    assert_eq!(read_eventually(|| b.read_line()).unwrap(), b"line3");
}

#[test]
fn read_everything_drains_the_buffer() {
    init_logging();
    let (a, b) = pair();
    assert!(b.read_everything().is_none());

    a.write(b"all of it").unwrap();
    let bytes = read_eventually(|| b.read_everything()).unwrap();
    assert_eq!(bytes, b"all of it");
    assert_eq!(b.inbuf_len(), 0);
}

#[test]
fn read_packet_finds_marked_frames() {
    init_logging();
    let (a, b) = pair();
    a.write(b"noise<abc>tail").unwrap();

    let packet = read_eventually(|| b.read_packet(b'<', b'>')).expect("packet");
    assert_eq!(packet, b"<abc>");

    // "tail" has no start mark; the scan discards it entirely.
    assert!(b.read_packet(b'<', b'>').is_none());
    assert_eq!(b.inbuf_len(), 0);
}

#[test]
fn read_packet_waits_for_end_mark() {
    init_logging();
    let (a, b) = pair();
    a.write(b"<incomplete").unwrap();

    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline && b.inbuf_len() == 0 {
        assert!(b.read_packet(b'<', b'>').is_none());
        std::thread::sleep(Duration::from_millis(5));
    }
    // Start mark seen, end mark missing: nothing is consumed.
    assert!(b.read_packet(b'<', b'>').is_none());
    assert_eq!(b.inbuf_len(), 11);

    a.write(b"done>").unwrap();
    let packet = read_eventually(|| b.read_packet(b'<', b'>')).expect("packet");
    assert_eq!(packet, b"<incompletedone>");
}

#[test]
fn buffered_output_holds_until_flush() {
    init_logging();
    let (a, b) = pair();
    a.set_output_buffering(1024);

    assert_eq!(a.write(b"held").unwrap(), Progress::Pending);
    assert_eq!(a.outbuf_len(), 4);
    std::thread::sleep(Duration::from_millis(50));
    assert!(b.read_fixed(4).is_none(), "bytes should still be buffered");

    assert_eq!(a.flush().unwrap(), Flush::Done);
    assert_eq!(a.outbuf_len(), 0);
    assert_eq!(read_eventually(|| b.read_fixed(4)).unwrap(), b"held");
}

#[test]
fn lowering_threshold_triggers_drain() {
    init_logging();
    let (a, b) = pair();
    a.set_output_buffering(1024);
    assert_eq!(a.write(b"pent up").unwrap(), Progress::Pending);

    a.set_output_buffering(0);
    assert_eq!(a.outbuf_len(), 0);
    assert_eq!(read_eventually(|| b.read_fixed(7)).unwrap(), b"pent up");
}

#[test]
fn eof_is_sticky() {
    init_logging();
    let (a, b) = pair();
    a.write(b"last words").unwrap();
    drop(a);

    assert_eq!(read_eventually(|| b.read_fixed(10)).unwrap(), b"last words");
    let deadline = Instant::now() + Duration::from_secs(2);
    while !b.eof() && Instant::now() < deadline {
        assert!(b.read_fixed(1).is_none());
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(b.eof());
    assert!(!b.read_error());
    // Still safe to keep calling.
    assert!(b.read_everything().is_none());
    assert!(b.eof());
}

#[test]
fn wait_times_out_and_reports_progress() {
    init_logging();
    let (a, b) = pair();

    assert_eq!(b.wait(Some(Duration::from_millis(100))).unwrap(), Wait::TimedOut);

    a.write(b"now").unwrap();
    assert_eq!(b.wait(Some(Duration::from_secs(2))).unwrap(), Wait::Progress);
    // wait() already pulled the bytes into the input buffer.
    assert_eq!(b.inbuf_len(), 3);
    assert_eq!(b.read_fixed(3).unwrap(), b"now");
}

#[test]
fn claim_asserts_exclusivity() {
    init_logging();
    let (a, _b) = pair();
    a.claim();
    a.write(b"mine").unwrap();
}

#[test]
#[should_panic(expected = "claimed twice")]
fn double_claim_panics() {
    let (a, _b) = pair();
    a.claim();
    a.claim();
}

#[test]
fn registered_callback_sees_all_chunks_in_order() {
    init_logging();
    let set = FdSet::new().unwrap();
    let (a, b) = pair();

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    b.register(&set, move |conn| {
        if let Some(bytes) = conn.read_everything() {
            sink.lock().extend_from_slice(&bytes);
        }
    })
    .unwrap();

    let payload: Vec<u8> = (0u8..100).collect();
    for chunk in payload.chunks(10) {
        a.write(chunk).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while log.lock().len() < payload.len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*log.lock(), payload);

    b.unregister();
}

#[test]
fn register_twice_with_same_set_replaces_callback() {
    init_logging();
    let set = FdSet::new().unwrap();
    let (a, b) = pair();

    let first = Arc::new(Mutex::new(0usize));
    let second = Arc::new(Mutex::new(0usize));

    let counter = first.clone();
    b.register(&set, move |_| *counter.lock() += 1).unwrap();
    let counter = second.clone();
    b.register(&set, move |_| *counter.lock() += 1).unwrap();

    a.write(b"ping").unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while *second.lock() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*first.lock(), 0, "old callback must be fully replaced");
    assert!(*second.lock() > 0);

    b.unregister();
}

#[test]
fn register_with_two_sets_is_rejected() {
    init_logging();
    let set_a = FdSet::new().unwrap();
    let set_b = FdSet::new().unwrap();
    let (_a, b) = pair();

    b.register(&set_a, |_| {}).unwrap();
    assert!(matches!(
        b.register(&set_b, |_| {}),
        Err(conn::Error::AlreadyRegistered)
    ));
    b.unregister();
}

#[test]
fn registered_connection_drains_buffered_output() {
    init_logging();
    let set = FdSet::new().unwrap();
    let (a, b) = pair();

    // Queue output while unregistered, then let the poller drain it.
    // The poller's drain ignores the buffering threshold.
    a.set_output_buffering(u32::MAX);
    a.write(b"deferred").unwrap();
    assert_eq!(a.outbuf_len(), 8);
    a.register(&set, |_| {}).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while a.outbuf_len() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(a.outbuf_len(), 0);
    assert_eq!(read_eventually(|| b.read_fixed(8)).unwrap(), b"deferred");

    a.unregister();
}

#[test]
fn open_tcp_connects_and_exchanges() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"welcome\n").unwrap();
    });

    let conn = Connection::open_tcp("127.0.0.1", port).unwrap();
    assert_eq!(read_eventually(|| conn.read_line()).unwrap(), b"welcome");
    server.join().unwrap();
}
