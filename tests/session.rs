//! End-to-end session tests over the in-memory packet pipe.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use shroud::{
    packet_pipe, AnswersMode, EventHandler, Identity, KeyExchangerOptions, MessageType,
    NopEventHandler, PipeTransport, Session, SessionError, SessionOptions, SessionState,
    Transport,
};

fn session_pair(
    opts_a: SessionOptions,
    opts_b: SessionOptions,
    handler_a: Arc<dyn EventHandler>,
    handler_b: Arc<dyn EventHandler>,
) -> (
    Session<PipeTransport>,
    Session<PipeTransport>,
    PipeTransport,
    PipeTransport,
) {
    let alice = Identity::generate();
    let bob = Identity::generate();
    let (conn_a, conn_b) = packet_pipe(512);
    let tap_a = conn_a.clone();
    let tap_b = conn_b.clone();

    let sess_a = Session::new(alice.clone(), bob.peer_identity(), conn_a, handler_a, opts_a);
    let sess_b = Session::new(bob, alice.peer_identity(), conn_b, handler_b, opts_b);
    (sess_a, sess_b, tap_a, tap_b)
}

fn default_pair() -> (Session<PipeTransport>, Session<PipeTransport>) {
    let (a, b, _, _) = session_pair(
        SessionOptions::default(),
        SessionOptions::default(),
        Arc::new(NopEventHandler),
        Arc::new(NopEventHandler),
    );
    (a, b)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

async fn wait_closed(sessions: &[&Session<PipeTransport>]) {
    for sess in sessions {
        tokio::time::timeout(Duration::from_secs(5), sess.wait_for_closure())
            .await
            .expect("session failed to close in time");
        assert_eq!(sess.state(), SessionState::Closed);
    }
}

#[tokio::test]
async fn big_write_roundtrip() {
    let (sess_a, sess_b) = default_pair();
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    let payload = random_bytes(sess_a.payload_size_limit() as usize);
    let mut read_buf = vec![0u8; payload.len()];

    let n = sess_a.write(&payload).await.unwrap();
    assert_eq!(n, payload.len());

    let n = sess_b.read(&mut read_buf).await.unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(read_buf, payload);

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn async_send_token_completes() {
    let (sess_a, sess_b) = default_pair();
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    let payload = random_bytes(8);
    let token = sess_a
        .write_message_async(MessageType::ReadWrite, &payload)
        .unwrap();

    let reader = {
        let sess_b = sess_b.clone();
        let expected = payload.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let n = sess_b.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &expected[..]);
        })
    };

    let written = token.wait().await.unwrap();
    assert!(written > 0);
    token.release();
    reader.await.unwrap();

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn replayed_packet_is_ignored() {
    let opts = SessionOptions {
        enable_debug: true,
        key_exchanger: KeyExchangerOptions {
            answers_mode: AnswersMode::Disable,
            retry_interval: Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    };
    let (sess_a, sess_b, tap_a, tap_b) = session_pair(
        opts.clone(),
        opts,
        Arc::new(NopEventHandler),
        Arc::new(NopEventHandler),
    );
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    assert_eq!(
        sess_a.wait_for_state(SessionState::Established).await,
        SessionState::Established
    );
    assert_eq!(
        sess_b.wait_for_state(SessionState::Established).await,
        SessionState::Established
    );

    // Pause the receiver so the test can intercept its traffic.
    sess_b.set_pause(true).unwrap();

    let msg_size = sess_a.payload_size_limit() as usize;
    let payload = random_bytes(msg_size);
    sess_a.write(&payload).await.unwrap();

    // Skim handshake stragglers until the data packet shows up.
    let mut intercepted = vec![0u8; sess_b.packet_size_limit() as usize + 1];
    let intercepted = loop {
        let n = tokio::time::timeout(Duration::from_secs(5), tap_b.recv(&mut intercepted))
            .await
            .expect("no packet intercepted")
            .unwrap();
        assert!(n <= sess_b.packet_size_limit() as usize);
        if n >= msg_size {
            break intercepted[..n].to_vec();
        }
    };

    // Unpause and deliver the packet once: the message arrives normally.
    sess_b.set_pause(false).unwrap();
    tap_a.send(&intercepted).await.unwrap();

    let mut read_buf = vec![0u8; msg_size + 1];
    let n = sess_b.read(&mut read_buf).await.unwrap();
    assert_eq!(n, msg_size);
    assert_eq!(&read_buf[..n], &payload[..]);
    assert_eq!(sess_b.unexpected_packet_id_count(), 0);

    // Replay it: the duplicate must be dropped, not delivered.
    tap_a.send(&intercepted).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while sess_b.unexpected_packet_id_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("duplicate was not rejected");
    assert_eq!(sess_b.unexpected_packet_id_count(), 1);

    // The session keeps working, and the next read sees fresh data only.
    let follow_up = random_bytes(16);
    sess_a.write(&follow_up).await.unwrap();
    let n = sess_b.read(&mut read_buf).await.unwrap();
    assert_eq!(&read_buf[..n], &follow_up[..]);

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn key_renewal_fills_the_ring() {
    let opts = SessionOptions {
        key_exchanger: KeyExchangerOptions {
            key_update_interval: Duration::from_micros(1),
            retry_interval: Duration::from_secs(365 * 24 * 3600),
            psk: Some(vec![1, 2, 3]),
            ..Default::default()
        },
        ..Default::default()
    };
    let (sess_a, sess_b, _, _) = session_pair(
        opts.clone(),
        opts,
        Arc::new(NopEventHandler),
        Arc::new(NopEventHandler),
    );
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if sess_a.cipher_keys()[3].is_some() && sess_b.cipher_keys()[3].is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("key ring never filled");

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;

    let keys_a = sess_a.cipher_keys();
    let keys_b = sess_b.cipher_keys();
    assert!(keys_a.iter().all(Option::is_some));
    assert!(keys_b.iter().all(Option::is_some));
    let matched = keys_a
        .iter()
        .flatten()
        .any(|key| keys_b.iter().flatten().any(|other| other == key));
    assert!(matched, "no shared key between the two rings");
}

struct RecordingHandler {
    saw_mismatch: AtomicBool,
    error_count: AtomicU64,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            saw_mismatch: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
        })
    }
}

impl EventHandler for RecordingHandler {
    fn on_error(&self, err: &SessionError) -> bool {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if matches!(err, SessionError::AnswersModeMismatch) {
            self.saw_mismatch.store(true, Ordering::Relaxed);
        }
        false
    }
}

#[tokio::test]
async fn answers_mode_mismatch_closes_both_sides() {
    let handler_a = RecordingHandler::new();
    let handler_b = RecordingHandler::new();
    let opts_a = SessionOptions {
        key_exchanger: KeyExchangerOptions {
            answers_mode: AnswersMode::Disable,
            ..Default::default()
        },
        ..Default::default()
    };
    let opts_b = SessionOptions {
        key_exchanger: KeyExchangerOptions {
            answers_mode: AnswersMode::AnswerAndWait,
            ..Default::default()
        },
        ..Default::default()
    };
    let (sess_a, sess_b, _, _) = session_pair(
        opts_a,
        opts_b,
        handler_a.clone(),
        handler_b.clone(),
    );
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    wait_closed(&[&sess_a, &sess_b]).await;
    assert!(
        handler_a.saw_mismatch.load(Ordering::Relaxed)
            || handler_b.saw_mismatch.load(Ordering::Relaxed),
        "neither side reported the answers-mode mismatch"
    );
}

#[tokio::test]
async fn oversize_write_without_fragmentation_fails_cleanly() {
    let (sess_a, sess_b) = default_pair();
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    let oversize = random_bytes(sess_a.payload_size_limit() as usize * 2);
    let err = sess_a.write(&oversize).await.unwrap_err();
    assert!(matches!(err, SessionError::PayloadTooBig { .. }));

    // The session stays usable for conforming writes.
    let payload = random_bytes(64);
    sess_a.write(&payload).await.unwrap();
    let mut read_buf = [0u8; 64];
    let n = sess_b.read(&mut read_buf).await.unwrap();
    assert_eq!(&read_buf[..n], &payload[..]);

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn start_and_close_are_idempotent() {
    let (sess_a, _sess_b) = default_pair();

    sess_a.start().unwrap();
    assert!(matches!(
        sess_a.start(),
        Err(SessionError::AlreadyStarted)
    ));

    sess_a.close().unwrap();
    assert!(matches!(sess_a.close(), Err(SessionError::AlreadyClosed)));
    assert!(matches!(sess_a.start(), Err(SessionError::AlreadyClosed)));

    wait_closed(&[&sess_a]).await;
    assert!(matches!(sess_a.close(), Err(SessionError::AlreadyClosed)));
}

#[tokio::test]
async fn fragmentation_roundtrip() {
    let opts = SessionOptions {
        enable_fragmentation: true,
        payload_size_limit: Some(1000),
        ..Default::default()
    };
    let (sess_a, sess_b, _, _) = session_pair(
        opts.clone(),
        opts,
        Arc::new(NopEventHandler),
        Arc::new(NopEventHandler),
    );
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    let payload = random_bytes(60000);
    let mut read_buf = vec![0u8; payload.len()];

    sess_a.write(&payload).await.unwrap();
    let n = sess_b.read(&mut read_buf).await.unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(read_buf, payload);

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn send_now_skips_the_merge_delay() {
    let (sess_a, sess_b) = default_pair();
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    sess_a.wait_for_state(SessionState::Established).await;
    sess_b.wait_for_state(SessionState::Established).await;

    let token = sess_a
        .write_message_async(MessageType::ReadWrite, &[1])
        .unwrap();
    let written = token.send_now_and_wait().await.unwrap();
    assert!(written > 0, "send {} reported an empty write", token.send_id());
    assert!(token.is_done());
    token.release();

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn channel_handlers_receive_in_order() {
    let (sess_a, sess_b) = default_pair();

    let received: Arc<std::sync::Mutex<Vec<Vec<u8>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    sess_b.set_handler_funcs(
        MessageType::Channel(0),
        move |payload| {
            sink.lock().unwrap().push(payload.to_vec());
            Ok(())
        },
        |err| panic!("handler error: {err}"),
    );

    sess_a.start().unwrap();
    sess_b.start().unwrap();

    for i in 0..10u8 {
        sess_a
            .write_message(MessageType::Channel(0), &[i, i, i])
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while received.lock().unwrap().len() < 10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("channel messages not delivered");

    let got = received.lock().unwrap().clone();
    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i, i, i]).collect();
    assert_eq!(got, expected);

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn negotiation_shrinks_payload_limit_to_the_smaller_side() {
    let alice = Identity::generate();
    let bob = Identity::generate();
    let (conn_a, conn_b) = packet_pipe(512);
    let conn_a = conn_a.with_mtu(4096);
    let conn_b = conn_b.with_mtu(2048);

    let sess_a = Session::new(
        alice.clone(),
        bob.peer_identity(),
        conn_a,
        Arc::new(NopEventHandler),
        SessionOptions::default(),
    );
    let sess_b = Session::new(
        bob,
        alice.peer_identity(),
        conn_b,
        Arc::new(NopEventHandler),
        SessionOptions::default(),
    );
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    sess_a.wait_for_state(SessionState::Established).await;
    sess_b.wait_for_state(SessionState::Established).await;
    assert_eq!(sess_a.payload_size_limit(), sess_b.payload_size_limit());

    let payload = random_bytes(sess_a.payload_size_limit() as usize);
    sess_a.write(&payload).await.unwrap();
    let mut read_buf = vec![0u8; payload.len()];
    let n = sess_b.read(&mut read_buf).await.unwrap();
    assert_eq!(&read_buf[..n], &payload[..]);

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn write_blocks_until_established_then_flows() {
    let (sess_a, sess_b) = default_pair();
    sess_a.start().unwrap();

    // Queue the write before the peer even starts; it must complete once
    // the key exchange finishes.
    let writer = {
        let sess_a = sess_a.clone();
        tokio::spawn(async move { sess_a.write(b"early bird").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    sess_b.start().unwrap();

    let mut read_buf = [0u8; 32];
    let n = sess_b.read(&mut read_buf).await.unwrap();
    assert_eq!(&read_buf[..n], b"early bird");
    writer.await.unwrap().unwrap();

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}

#[tokio::test]
async fn short_read_buffer_is_reported() {
    let (sess_a, sess_b) = default_pair();
    sess_a.start().unwrap();
    sess_b.start().unwrap();

    sess_a.write(&[0u8; 100]).await.unwrap();
    let mut small = [0u8; 10];
    let err = sess_b.read(&mut small).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::ShortBuffer {
            needed: 100,
            got: 10
        }
    ));

    sess_a.close().unwrap();
    sess_b.close().unwrap();
    wait_closed(&[&sess_a, &sess_b]).await;
}
