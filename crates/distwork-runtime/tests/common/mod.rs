//! Shared test utilities for the runtime integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use distwork_runtime::{
    Communicator, DeliverySink, Message, PipeContext, TransportError, TransportResult,
    WorkerApi, WorkerConfig,
};

// ----------------------------------------------------------------------------
// Tracing
// ----------------------------------------------------------------------------

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------------
// Loopback Communicator
// ----------------------------------------------------------------------------

/// How a loopback communicator misbehaves, if at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behaviour {
    #[default]
    Echo,
    FailConnect,
    FailServedRequests,
    PanicOnOutgoing,
    FailDisconnect,
    /// Never returns from the served-requests hook
    StallServedRequests,
}

/// Latch the test opens to release a communicator blocked in a hook
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
    }
}

/// Hook invocation counters shared with the test body
#[derive(Debug, Clone, Default)]
pub struct HookCounters {
    pub connects: Arc<AtomicUsize>,
    pub timeouts: Arc<AtomicUsize>,
    pub served: Arc<AtomicUsize>,
    pub outgoing: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
}

impl HookCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Test double that loops every outgoing message back to the application
pub struct LoopbackCommunicator {
    sink: Option<DeliverySink>,
    behaviour: Behaviour,
    counters: HookCounters,
    gate: Option<Arc<Gate>>,
}

impl LoopbackCommunicator {
    pub fn new() -> Self {
        Self::with(Behaviour::Echo, HookCounters::default())
    }

    pub fn with(behaviour: Behaviour, counters: HookCounters) -> Self {
        Self {
            sink: None,
            behaviour,
            counters,
            gate: None,
        }
    }

    /// Echoes, but blocks the whole network thread in each outgoing
    /// message hook until `gate` opens
    pub fn gated(gate: Arc<Gate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }
}

#[async_trait::async_trait]
impl Communicator for LoopbackCommunicator {
    fn attach(&mut self, sink: DeliverySink) {
        self.sink = Some(sink);
    }

    async fn connect(&mut self) -> TransportResult<()> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.behaviour == Behaviour::FailConnect {
            return Err(TransportError::ConnectionFailed {
                endpoint: "loopback".into(),
                reason: "refused by test".into(),
            });
        }
        Ok(())
    }

    async fn reactor_timed_out(&mut self) -> TransportResult<()> {
        self.counters.timeouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reactor_served_requests(&mut self) -> TransportResult<()> {
        self.counters.served.fetch_add(1, Ordering::SeqCst);
        if self.behaviour == Behaviour::FailServedRequests {
            return Err(TransportError::shutdown("flaky by test"));
        }
        if self.behaviour == Behaviour::StallServedRequests {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn handle_outgoing_message(&mut self, message: Message) -> TransportResult<()> {
        self.counters.outgoing.fetch_add(1, Ordering::SeqCst);
        if self.behaviour == Behaviour::PanicOnOutgoing {
            panic!("loopback communicator panicked by test");
        }
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| TransportError::shutdown("not attached"))?;
        sink.deliver(message);
        Ok(())
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.behaviour == Behaviour::FailDisconnect {
            return Err(TransportError::shutdown("teardown failed by test"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

pub fn test_worker(context: &PipeContext, identity: &str) -> WorkerApi {
    WorkerApi::new(context.clone(), WorkerConfig::testing(identity))
        .expect("testing configuration should be valid")
}

pub fn frames(parts: &[&[u8]]) -> Message {
    Message::from_frames(parts.iter().map(|p| p.to_vec()).collect())
}

/// A loopback port nothing is listening on
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind throwaway listener");
    listener.local_addr().expect("throwaway address").port()
}
