//! Network Thread
//!
//! Owns every communicator after `start` and drives them from a reactor
//! running on a current-thread tokio runtime:
//!
//! ```text
//! Connecting ──ok──▶ Ready ──stop / violation──▶ ShuttingDown ──▶ Terminated
//!      └─────────────────fail──────────────────────────▲
//! ```
//!
//! Each loop iteration polls the reactor for one heartbeat interval, runs
//! the timeout hooks when nothing was ready, forwards pending peer messages
//! to the application, runs the served-requests hooks and collects fresh
//! reactor sources. Every hook runs under a deadline so a stalled
//! communicator cannot hold the loop past a stop request.

use core::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use distwork_core::{PeerRole, Signal, TransportError, TransportResult};
use futures::{FutureExt, StreamExt};
use tracing::{debug, error, info, warn};

use crate::communicator::{CommunicatorRegistry, PeerInput};
use crate::pipe::{NetEndpoint, PipeItem, SignalSender};
use crate::reactor::{Reactor, ReactorEvent};
use crate::shared::{describe, DeliverySink, SharedState};

// ----------------------------------------------------------------------------
// Loop State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Connecting,
    Ready,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Connecting => write!(f, "connecting"),
            LoopState::Ready => write!(f, "ready"),
            LoopState::ShuttingDown => write!(f, "shutting down"),
            LoopState::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Pipe,
    Peer(PeerRole),
}

enum NetworkInput {
    App(PipeItem),
    Peer(PeerRole, PeerInput),
}

enum HookOutcome {
    Done,
    Failed(TransportError),
    Panicked,
    Stalled,
}

/// Run one communicator hook, containing its errors, panics and stalls
async fn isolate<F>(role: PeerRole, hook: &'static str, deadline: Duration, future: F) -> HookOutcome
where
    F: core::future::Future<Output = TransportResult<()>>,
{
    match tokio::time::timeout(deadline, AssertUnwindSafe(future).catch_unwind()).await {
        Ok(Ok(Ok(()))) => HookOutcome::Done,
        Ok(Ok(Err(e))) => {
            warn!(%role, hook, error = %e, "Communicator hook failed");
            HookOutcome::Failed(e)
        }
        Ok(Err(_)) => {
            error!(%role, hook, "Communicator hook panicked");
            HookOutcome::Panicked
        }
        Err(_) => {
            error!(%role, hook, deadline_ms = deadline.as_millis() as u64, "Communicator hook stalled");
            HookOutcome::Stalled
        }
    }
}

// ----------------------------------------------------------------------------
// Network Task
// ----------------------------------------------------------------------------

/// State owned by the network thread for one start/stop bracket
pub(crate) struct NetworkTask {
    registry: CommunicatorRegistry,
    shared: Arc<SharedState>,
    pipe: NetEndpoint,
    heartbeat: Duration,
    hook_timeout: Duration,
    reactor: Reactor<Source, NetworkInput>,
    quarantined: Vec<PeerRole>,
    state: LoopState,
}

impl NetworkTask {
    pub fn new(
        registry: CommunicatorRegistry,
        shared: Arc<SharedState>,
        pipe: NetEndpoint,
        heartbeat: Duration,
        hook_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            shared,
            pipe,
            heartbeat,
            hook_timeout,
            reactor: Reactor::new(),
            quarantined: Vec::new(),
            state: LoopState::Connecting,
        }
    }

    /// Thread entry point: build the runtime and run the task to completion
    ///
    /// `ready` carries the startup handshake, `done` the shutdown one.
    pub fn run(self, ready: SignalSender, done: SignalSender) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.drive(ready, done)),
            Err(e) => {
                error!(error = %e, "Failed to build network runtime");
                self.shared.record_failure(format!("runtime: {e}"));
                ready.send(Signal::Ko);
                done.send(Signal::Ko);
            }
        }
    }

    fn transition(&mut self, next: LoopState) {
        debug!(identity = %self.shared.identity(), from = %self.state, to = %next, "Network loop transition");
        self.state = next;
    }

    async fn drive(mut self, ready: SignalSender, done: SignalSender) {
        let mut clean = match self.connect_all().await {
            Ok(()) => {
                self.refresh_sources();
                if let Some(source) = self.pipe.take_source() {
                    self.reactor
                        .add(Source::Pipe, source.map(NetworkInput::App).boxed());
                }
                self.transition(LoopState::Ready);
                info!(identity = %self.shared.identity(), peers = self.registry.len(), "Network thread ready");
                ready.send(Signal::Ok);
                self.poll_loop().await
            }
            Err(reason) => {
                error!(identity = %self.shared.identity(), %reason, "Network thread failed to start");
                self.shared.record_failure(reason);
                ready.send(Signal::Ko);
                true
            }
        };

        if !self.cleanup().await {
            clean = false;
        }
        done.send(if clean { Signal::Ok } else { Signal::Ko });
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    async fn connect_all(&mut self) -> Result<(), String> {
        let roles = self.registry.roles().to_vec();
        let deadline = self.hook_timeout;
        for role in roles {
            let sink = DeliverySink::new(role, Arc::clone(&self.shared));
            let Some(communicator) = self.registry.get_mut(role) else {
                continue;
            };
            communicator.attach(sink);
            match isolate(role, "connect", deadline, communicator.connect()).await {
                HookOutcome::Done => debug!(%role, "Communicator connected"),
                HookOutcome::Failed(e) => return Err(format!("{role} connect failed: {e}")),
                HookOutcome::Panicked => return Err(format!("{role} connect panicked")),
                HookOutcome::Stalled => return Err(format!("{role} connect stalled")),
            }
        }
        Ok(())
    }

    /// Register sources handed out by communicators since the last call
    fn refresh_sources(&mut self) {
        let roles = self.registry.roles().to_vec();
        for role in roles {
            let Some(communicator) = self.registry.get_mut(role) else {
                continue;
            };
            if let Some(source) = communicator.take_source() {
                let source = source.map(move |input| NetworkInput::Peer(role, input));
                self.reactor.add(Source::Peer(role), source.boxed());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Ready
    // ------------------------------------------------------------------------

    /// Returns false when the loop ended on a protocol violation
    async fn poll_loop(&mut self) -> bool {
        let mut clean = true;
        let deadline = self.hook_timeout;
        while !self.shared.is_interrupted() {
            let events = self.reactor.poll(self.heartbeat).await;

            if events.is_empty() {
                self.shared.stats().record_heartbeat_timeout();
                for role in self.registry.roles().to_vec() {
                    if let Some(communicator) = self.registry.get_mut(role) {
                        let outcome =
                            isolate(role, "reactor_timed_out", deadline, communicator.reactor_timed_out())
                                .await;
                        self.settle(role, outcome);
                    }
                }
            }

            for event in events {
                if !self.dispatch(event).await {
                    clean = false;
                }
            }

            if !self.forward_pending() {
                clean = false;
            }

            for role in self.registry.roles().to_vec() {
                if let Some(communicator) = self.registry.get_mut(role) {
                    let outcome = isolate(
                        role,
                        "reactor_served_requests",
                        deadline,
                        communicator.reactor_served_requests(),
                    )
                    .await;
                    self.settle(role, outcome);
                }
            }

            self.refresh_sources();
        }
        clean
    }

    async fn dispatch(&mut self, event: ReactorEvent<Source, NetworkInput>) -> bool {
        match event {
            ReactorEvent::Readable(_, NetworkInput::App(item)) => self.handle_app_item(item).await,
            ReactorEvent::Readable(_, NetworkInput::Peer(role, input)) => {
                let deadline = self.hook_timeout;
                if let Some(communicator) = self.registry.get_mut(role) {
                    let outcome =
                        isolate(role, "handle_input", deadline, communicator.handle_input(input)).await;
                    self.settle(role, outcome);
                }
                true
            }
            ReactorEvent::Closed(Source::Pipe) => {
                // The application endpoint went away without a stop signal
                warn!(identity = %self.shared.identity(), "Application pipe closed");
                self.shared.interrupt();
                true
            }
            ReactorEvent::Closed(Source::Peer(role)) => {
                debug!(%role, "Peer source closed");
                true
            }
        }
    }

    /// Handle one item from the application; false on a protocol violation
    async fn handle_app_item(&mut self, item: PipeItem) -> bool {
        let mut message = match item {
            PipeItem::Signal(Signal::Stop) => {
                info!(identity = %self.shared.identity(), "Shutdown requested");
                self.shared.interrupt();
                return true;
            }
            PipeItem::Signal(signal) => {
                warn!(%signal, "Ignoring unexpected signal from application");
                return true;
            }
            PipeItem::Message(message) => message,
        };

        let role = match message.take_tag() {
            Ok(role) => role,
            Err(e) => return self.protocol_violation(&e.to_string()),
        };
        if self.quarantined.contains(&role) {
            debug!(%role, "Dropping message for quarantined communicator");
            self.shared.stats().record_dropped();
            return true;
        }
        let deadline = self.hook_timeout;
        let Some(communicator) = self.registry.get_mut(role) else {
            return self.protocol_violation(&format!("no communicator registered for {role}"));
        };

        if self.shared.verbose() {
            debug!(%role, frames = %describe(&message), "Routing application message");
        }
        self.shared.stats().record_routed();
        let outcome = isolate(
            role,
            "handle_outgoing_message",
            deadline,
            communicator.handle_outgoing_message(message),
        )
        .await;
        self.settle(role, outcome);
        true
    }

    /// Move every pending peer message to the application; false on a violation
    fn forward_pending(&mut self) -> bool {
        let pending = self.shared.take_pending();
        for message in pending {
            match message.peek_tag() {
                Ok(role) if self.registry.contains(role) || self.quarantined.contains(&role) => {}
                Ok(role) => {
                    return self.protocol_violation(&format!("pending message from unregistered {role}"))
                }
                Err(e) => return self.protocol_violation(&e.to_string()),
            }
            match self.pipe.deliver(message) {
                Ok(()) => self.shared.stats().record_delivered(),
                Err(e) => warn!(error = %e, "Could not forward message to application"),
            }
        }
        true
    }

    fn protocol_violation(&mut self, reason: &str) -> bool {
        error!(identity = %self.shared.identity(), reason, "Protocol violation on the pipe");
        self.shared.record_failure(format!("protocol violation: {reason}"));
        self.shared.interrupt();
        false
    }

    fn settle(&mut self, role: PeerRole, outcome: HookOutcome) {
        match outcome {
            HookOutcome::Done => {}
            HookOutcome::Failed(_) => self.shared.stats().record_hook_failure(),
            HookOutcome::Panicked | HookOutcome::Stalled => self.quarantine(role),
        }
    }

    fn quarantine(&mut self, role: PeerRole) {
        if self.registry.remove(role).is_some() {
            warn!(%role, "Communicator quarantined");
            self.reactor.remove(&Source::Peer(role));
            self.quarantined.push(role);
            self.shared.stats().record_quarantine();
        }
    }

    // ------------------------------------------------------------------------
    // Shutting Down
    // ------------------------------------------------------------------------

    /// Release every communicator; false if any of them failed to disconnect
    async fn cleanup(&mut self) -> bool {
        self.transition(LoopState::ShuttingDown);
        let mut clean = true;
        let deadline = self.hook_timeout;

        for role in self.registry.roles().to_vec() {
            let Some(mut communicator) = self.registry.remove(role) else {
                continue;
            };
            match isolate(role, "disconnect", deadline, communicator.disconnect()).await {
                HookOutcome::Done => debug!(%role, "Communicator released"),
                HookOutcome::Failed(_) | HookOutcome::Panicked | HookOutcome::Stalled => {
                    self.shared.stats().record_hook_failure();
                    clean = false;
                }
            }
        }

        self.reactor.clear();
        self.transition(LoopState::Terminated);
        info!(identity = %self.shared.identity(), clean, "Network thread terminated");
        clean
    }
}
