//! Inter-Thread Pipe
//!
//! The private, ordered, message-oriented channel between the application
//! thread and the network thread of one worker:
//!
//! - application → network: bounded, carries tagged messages and signals
//! - network → application: unbounded, carries tagged messages and wakes a
//!   receiver blocked in `wait_until`
//!
//! Values are moved through the pipe, never shared. Endpoint addresses live
//! in a [`PipeContext`] namespace so two workers with the same identity in
//! one context collide.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use distwork_core::{Message, Signal, WorkerError, WorkerResult};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};

/// Address of a worker's pipe endpoint, derived from its identity
pub fn worker_address(identity: &str) -> String {
    format!("inproc://W_API_{identity}")
}

// ----------------------------------------------------------------------------
// Endpoint Namespace
// ----------------------------------------------------------------------------

/// Namespace of bound pipe addresses shared by the workers created from it
#[derive(Debug, Clone, Default)]
pub struct PipeContext {
    bound: Arc<Mutex<HashSet<String>>>,
}

impl PipeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an address; fails while another binding holds it
    pub fn bind(&self, address: &str) -> WorkerResult<PipeBinding> {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        if !bound.insert(address.to_string()) {
            return Err(WorkerError::AddressInUse {
                address: address.to_string(),
            });
        }
        Ok(PipeBinding {
            address: address.to_string(),
            bound: Arc::clone(&self.bound),
        })
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(address)
    }
}

/// Claim on a pipe address, released on drop
#[derive(Debug)]
pub struct PipeBinding {
    address: String,
    bound: Arc<Mutex<HashSet<String>>>,
}

impl PipeBinding {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for PipeBinding {
    fn drop(&mut self) {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.address);
    }
}

// ----------------------------------------------------------------------------
// Pipe Endpoints
// ----------------------------------------------------------------------------

/// Item travelling from the application to the network thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeItem {
    Message(Message),
    Signal(Signal),
}

#[derive(Debug, Default)]
struct Arrival {
    lock: Mutex<()>,
    ready: Condvar,
}

/// Create a connected pair of pipe endpoints
pub fn pair(capacity: usize) -> (AppEndpoint, NetEndpoint) {
    let (to_net, from_app) = mpsc::channel(capacity.max(1));
    let (to_app, from_net) = mpsc::unbounded_channel();
    let arrival = Arc::new(Arrival::default());

    let app = AppEndpoint {
        outbound: to_net,
        inbound: from_net,
        arrival: Arc::clone(&arrival),
        capacity,
    };
    let net = NetEndpoint {
        inbound: Some(from_app),
        outbound: to_app,
        arrival,
    };
    (app, net)
}

/// Application-side endpoint
#[derive(Debug)]
pub struct AppEndpoint {
    outbound: mpsc::Sender<PipeItem>,
    inbound: mpsc::UnboundedReceiver<Message>,
    arrival: Arc<Arrival>,
    capacity: usize,
}

impl AppEndpoint {
    pub fn send_message(&self, message: Message) -> WorkerResult<()> {
        self.send(PipeItem::Message(message))
    }

    pub fn send_signal(&self, signal: Signal) -> WorkerResult<()> {
        self.send(PipeItem::Signal(signal))
    }

    fn send(&self, item: PipeItem) -> WorkerResult<()> {
        self.outbound.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WorkerError::PipeFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => WorkerError::PipeClosed,
        })
    }

    /// Take the next message already sitting in the pipe, without blocking
    pub fn try_recv(&mut self) -> Option<Message> {
        self.inbound.try_recv().ok()
    }

    /// Block until `ready` holds or `timeout` elapses
    ///
    /// `ready` is evaluated before the first wait and after every wakeup,
    /// so it should drain the pipe before deciding. Returns whether `ready`
    /// held; `false` means the full timeout elapsed.
    pub fn wait_until<F>(&mut self, timeout: Duration, mut ready: F) -> bool
    where
        F: FnMut(&mut AppEndpoint) -> bool,
    {
        let arrival = Arc::clone(&self.arrival);
        let guard = arrival.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (_guard, result) = arrival
            .ready
            .wait_timeout_while(guard, timeout, |_| !ready(self))
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }
}

/// Network-side endpoint
#[derive(Debug)]
pub struct NetEndpoint {
    inbound: Option<mpsc::Receiver<PipeItem>>,
    outbound: mpsc::UnboundedSender<Message>,
    arrival: Arc<Arrival>,
}

impl NetEndpoint {
    /// Stream of application items, for registration with the reactor
    ///
    /// Ends once the application endpoint is dropped and the buffer drained.
    pub fn take_source(&mut self) -> Option<BoxStream<'static, PipeItem>> {
        let mut inbound = self.inbound.take()?;
        Some(stream::poll_fn(move |cx| inbound.poll_recv(cx)).boxed())
    }

    /// Forward a tagged message to the application and wake any waiter
    pub fn deliver(&self, message: Message) -> WorkerResult<()> {
        self.outbound
            .send(message)
            .map_err(|_| WorkerError::PipeClosed)?;
        // Notify under the lock so a waiter between its check and its wait
        // cannot miss the wakeup
        let _guard = self.arrival.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.arrival.ready.notify_all();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Handshake Rendezvous
// ----------------------------------------------------------------------------

/// Create a one-shot handshake channel
pub fn rendezvous() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = oneshot::channel();
    (SignalSender(tx), SignalReceiver(rx))
}

/// Network-side half of a handshake; consumed by the single send
#[derive(Debug)]
pub struct SignalSender(oneshot::Sender<Signal>);

impl SignalSender {
    /// Returns false when the application side is gone
    pub fn send(self, signal: Signal) -> bool {
        self.0.send(signal).is_ok()
    }
}

/// Application-side half of a handshake
#[derive(Debug)]
pub struct SignalReceiver(oneshot::Receiver<Signal>);

impl SignalReceiver {
    /// Block until the signal arrives; `None` if the sender vanished without one
    pub fn wait(self) -> Option<Signal> {
        futures::executor::block_on(self.0).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distwork_core::PeerRole;
    use std::time::Instant;

    #[test]
    fn test_bind_conflict_and_release() {
        let context = PipeContext::new();
        let address = worker_address("w1");
        assert_eq!(address, "inproc://W_API_w1");

        let binding = context.bind(&address).unwrap();
        assert!(matches!(
            context.bind(&address),
            Err(WorkerError::AddressInUse { .. })
        ));

        // Distinct contexts never collide
        assert!(PipeContext::new().bind(&address).is_ok());

        drop(binding);
        assert!(!context.is_bound(&address));
        assert!(context.bind(&address).is_ok());
    }

    #[test]
    fn test_bounded_send_reports_full_and_closed() {
        let (app, mut net) = pair(1);
        app.send_signal(Signal::Stop).unwrap();
        assert!(matches!(
            app.send_message(Message::new()),
            Err(WorkerError::PipeFull { capacity: 1 })
        ));

        drop(net.take_source());
        assert!(matches!(
            app.send_signal(Signal::Stop),
            Err(WorkerError::PipeClosed)
        ));
    }

    #[test]
    fn test_delivery_wakes_waiter() {
        let (mut app, net) = pair(4);
        let msg = Message::from_frames(vec![vec![7]]).tagged(PeerRole::Broker);

        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            net.deliver(msg).unwrap();
            net
        });

        let mut received = None;
        let ready = app.wait_until(Duration::from_secs(5), |pipe| {
            if received.is_none() {
                received = pipe.try_recv();
            }
            received.is_some()
        });
        assert!(ready);
        assert_eq!(received.unwrap().peek_tag().unwrap(), PeerRole::Broker);
        producer.join().unwrap();
    }

    #[test]
    fn test_wait_never_returns_early() {
        let (mut app, _net) = pair(4);
        let started = Instant::now();
        let ready = app.wait_until(Duration::from_millis(60), |pipe| pipe.try_recv().is_some());
        assert!(!ready);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_rendezvous() {
        let (tx, rx) = rendezvous();
        assert!(tx.send(Signal::Ok));
        assert_eq!(rx.wait(), Some(Signal::Ok));

        let (tx, rx) = rendezvous();
        drop(tx);
        assert_eq!(rx.wait(), None);
    }
}
