//! TCP communicator integration tests
//!
//! The broker side is played by a blocking fake peer speaking the framed
//! wire format; neighbour links are exercised between two real workers.

mod common;

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::{frames, free_port, init_tracing, test_worker, LoopbackCommunicator};
use distwork_runtime::communicators::{broker, codec};
use distwork_runtime::{Message, PeerRole, PipeContext, WorkerApi, WorkerConfig, WorkerError};

const LONG: Duration = Duration::from_secs(3);

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

/// Blocking peer reading and writing length-prefixed frame lists
struct FakePeer {
    stream: TcpStream,
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FakePeer {
    fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().expect("worker should connect");
        Self {
            stream,
            buffer: Vec::new(),
            max_frame_size: WorkerConfig::default().link.max_frame_size,
        }
    }

    fn recv(&mut self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((message, used)) = codec::decode(&self.buffer, self.max_frame_size)
                .expect("worker should send well-formed frames")
            {
                self.buffer.drain(..used);
                return Some(message);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .expect("set read timeout");
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return None
                }
                Err(e) => panic!("fake peer read failed: {e}"),
            }
        }
    }

    /// Next broker command other than a heartbeat
    fn recv_command(&mut self) -> (u8, Message) {
        let deadline = Instant::now() + LONG;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let message = self.recv(remaining).expect("broker command should arrive");
            let (command, body) = broker::parse(message).expect("broker frames");
            if command != broker::HEARTBEAT {
                return (command, body);
            }
        }
        panic!("no broker command before the deadline");
    }

    fn send(&mut self, message: &Message) {
        let bytes = codec::encode(message, self.max_frame_size).expect("encode");
        self.stream.write_all(&bytes).expect("fake peer write");
    }
}

/// Worker that tolerates a fake broker which never sends heartbeats
fn broker_worker(context: &PipeContext, identity: &str) -> WorkerApi {
    let mut config = WorkerConfig::testing(identity);
    config.heartbeat.liveness = 1000;
    WorkerApi::new(context.clone(), config).expect("testing configuration should be valid")
}

fn broker_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake broker");
    let port = listener.local_addr().expect("fake broker address").port();
    (listener, format!("tcp://127.0.0.1:{port}"))
}

// ----------------------------------------------------------------------------
// Broker
// ----------------------------------------------------------------------------

#[test]
fn test_broker_session_round_trip() {
    init_tracing();
    let (listener, endpoint) = broker_listener();
    let context = PipeContext::new();
    let mut worker = broker_worker(&context, "tcp-worker");
    worker.add_broker_communicator(&endpoint).unwrap();
    worker.start().expect("broker should be reachable");

    let mut peer = FakePeer::accept(&listener);
    let (command, body) = peer.recv_command();
    assert_eq!(command, broker::READY);
    assert_eq!(body, frames(&[b"tcp-worker"]));

    // Requests from the broker reach the application
    peer.send(&broker::command(
        broker::REQUEST,
        vec![b"client-7".to_vec(), b"job".to_vec()],
    ));
    let request = worker
        .receive_message_from(PeerRole::Broker, LONG)
        .unwrap()
        .expect("request should arrive");
    assert_eq!(request, frames(&[b"client-7", b"job"]));

    // Application messages go back as replies
    worker
        .send_message(frames(&[b"client-7", b"done"]), PeerRole::Broker)
        .unwrap();
    let (command, body) = peer.recv_command();
    assert_eq!(command, broker::REPLY);
    assert_eq!(body, frames(&[b"client-7", b"done"]));

    worker.stop().expect("stop should be clean");
    let (command, _) = peer.recv_command();
    assert_eq!(command, broker::DISCONNECT);
}

#[test]
fn test_broker_heartbeats_while_idle() {
    let (listener, endpoint) = broker_listener();
    let context = PipeContext::new();
    let mut worker = broker_worker(&context, "beating");
    worker.add_broker_communicator(&endpoint).unwrap();
    worker.start().unwrap();

    let mut peer = FakePeer::accept(&listener);
    let ready = peer.recv(LONG).expect("READY should arrive");
    assert_eq!(broker::parse(ready).unwrap().0, broker::READY);

    let mut beats = 0;
    while beats < 3 {
        let message = peer.recv(LONG).expect("idle worker should keep beating");
        if broker::parse(message).unwrap().0 == broker::HEARTBEAT {
            beats += 1;
        }
    }
    worker.stop().unwrap();
}

#[test]
fn test_unreachable_broker_fails_start() {
    let context = PipeContext::new();
    let mut worker = test_worker(&context, "lonely");
    worker
        .add_broker_communicator(&format!("tcp://127.0.0.1:{}", free_port()))
        .unwrap();

    assert!(matches!(
        worker.start(),
        Err(WorkerError::StartupFailed { .. })
    ));
    assert!(!worker.is_running());
}

#[test]
fn test_malformed_endpoint_is_rejected() {
    let context = PipeContext::new();
    let mut worker = test_worker(&context, "typo");
    assert!(worker.add_broker_communicator("tcp://").is_err());
    assert!(worker.registered_roles().is_empty());
}

#[test]
fn test_unexpected_broker_command_is_contained() {
    let (listener, endpoint) = broker_listener();
    let context = PipeContext::new();
    let mut worker = broker_worker(&context, "strict");
    worker.add_broker_communicator(&endpoint).unwrap();
    worker.start().unwrap();

    let mut peer = FakePeer::accept(&listener);
    peer.recv_command();
    // A REPLY travels worker to broker only
    peer.send(&broker::command(broker::REPLY, vec![b"wrong way".to_vec()]));
    std::thread::sleep(Duration::from_millis(300));

    // The communicator reported the mismatch; the loop keeps serving
    assert!(worker.stats().hook_failures >= 1);
    assert!(worker.is_running());
    worker.stop().unwrap();
}

#[test]
fn test_stop_completes_while_broker_stops_reading() {
    init_tracing();
    let (listener, endpoint) = broker_listener();
    let context = PipeContext::new();
    let mut worker = broker_worker(&context, "flooded");
    worker.add_broker_communicator(&endpoint).unwrap();
    worker
        .add_communicator(PeerRole::LeftNeighbour, LoopbackCommunicator::new())
        .unwrap();
    worker.start().expect("broker should be reachable");

    // Accepted, then never read: the socket buffers fill and writes block
    let _silent = FakePeer::accept(&listener);
    let bulk = vec![0x5a; 1024 * 1024];
    for _ in 0..64 {
        worker
            .send_message(
                Message::from_frames(vec![b"client".to_vec(), bulk.clone()]),
                PeerRole::Broker,
            )
            .unwrap();
    }
    thread::sleep(Duration::from_millis(500));

    // The loop keeps serving the other peers
    worker
        .send_message(frames(&[b"still served"]), PeerRole::LeftNeighbour)
        .unwrap();
    assert_eq!(
        worker
            .receive_message_from(PeerRole::LeftNeighbour, LONG)
            .unwrap(),
        Some(frames(&[b"still served"]))
    );

    let (done_tx, done_rx) = mpsc::channel();
    let stopper = thread::spawn(move || {
        let _ = done_tx.send(worker.stop());
    });
    let stopped = done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("stop should return while the broker is not reading");
    stopped.expect("abandoned writes do not make the stop unclean");
    stopper.join().unwrap();
}

// ----------------------------------------------------------------------------
// Neighbours
// ----------------------------------------------------------------------------

#[test]
fn test_neighbour_pipeline_both_directions() {
    init_tracing();
    let endpoint = format!("tcp://127.0.0.1:{}", free_port());
    let context = PipeContext::new();

    // Pipelines start from the listening (downstream) side
    let mut downstream = test_worker(&context, "downstream");
    downstream.add_left_neighbour_communicator(&endpoint).unwrap();
    downstream.start().unwrap();

    let mut upstream = test_worker(&context, "upstream");
    upstream.add_right_neighbour_communicator(&endpoint).unwrap();
    upstream.start().expect("downstream should be listening");

    upstream
        .send_message(frames(&[b"chunk-1"]), PeerRole::RightNeighbour)
        .unwrap();
    let received = downstream
        .receive_message_from(PeerRole::LeftNeighbour, LONG)
        .unwrap();
    assert_eq!(received, Some(frames(&[b"chunk-1"])));

    downstream
        .send_message(frames(&[b"ack-1"]), PeerRole::LeftNeighbour)
        .unwrap();
    let received = upstream
        .receive_message_from(PeerRole::RightNeighbour, LONG)
        .unwrap();
    assert_eq!(received, Some(frames(&[b"ack-1"])));

    upstream.stop().unwrap();
    downstream.stop().unwrap();
}

#[test]
fn test_listening_side_flushes_after_attach() {
    let endpoint = format!("tcp://127.0.0.1:{}", free_port());
    let context = PipeContext::new();

    let mut downstream = test_worker(&context, "early");
    downstream.add_left_neighbour_communicator(&endpoint).unwrap();
    downstream.start().unwrap();
    downstream
        .send_message(frames(&[b"queued"]), PeerRole::LeftNeighbour)
        .expect("unattached links queue outbound data");

    let mut upstream = test_worker(&context, "late");
    upstream.add_right_neighbour_communicator(&endpoint).unwrap();
    upstream.start().unwrap();

    let received = upstream
        .receive_message_from(PeerRole::RightNeighbour, LONG)
        .unwrap();
    assert_eq!(received, Some(frames(&[b"queued"])));

    upstream.stop().unwrap();
    downstream.stop().unwrap();
}

#[test]
fn test_right_neighbour_needs_a_listener() {
    let context = PipeContext::new();
    let mut upstream = test_worker(&context, "too-early");
    upstream
        .add_right_neighbour_communicator(&format!("tcp://127.0.0.1:{}", free_port()))
        .unwrap();

    assert!(matches!(
        upstream.start(),
        Err(WorkerError::StartupFailed { .. })
    ));
}
