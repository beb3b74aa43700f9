//! Worker API
//!
//! The synchronous facade used by the application thread. It owns the
//! application end of the pipe, the per-peer inbound queues and, until
//! `start`, the communicator registry. Everything network-facing runs on
//! the network thread spawned by `start`.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use distwork_core::{Message, PeerRole, WorkerConfig};
//! use distwork_runtime::{PipeContext, WorkerApi};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut worker = WorkerApi::new(PipeContext::new(), WorkerConfig::new("w1"))?;
//! worker.add_broker_communicator("tcp://127.0.0.1:5555")?;
//! worker.start()?;
//!
//! if let Some(request) = worker.receive_message_from(PeerRole::Broker, Duration::from_secs(1))? {
//!     worker.send_message(request, PeerRole::Broker)?;
//! }
//!
//! worker.stop()?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use distwork_core::{
    Endpoint, Message, NetworkStatsSnapshot, PeerRole, Signal, WorkerConfig, WorkerError,
    WorkerResult,
};
use tracing::{debug, error, info, warn};

use crate::communicator::{Communicator, CommunicatorRegistry};
use crate::communicators::{BrokerCommunicator, NeighbourCommunicator};
use crate::network::NetworkTask;
use crate::pipe::{self, AppEndpoint, PipeBinding, PipeContext, SignalReceiver};
use crate::shared::{describe, SharedState};

type InboundQueues = [VecDeque<Message>; PeerRole::COUNT];

/// Options for [`WorkerApi::stop_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Block until the network thread acknowledged and was joined
    pub wait: bool,
    /// Hard termination; not supported
    pub force: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            wait: true,
            force: false,
        }
    }
}

/// Resources of one start/stop bracket
struct Session {
    routes: Vec<PeerRole>,
    pipe: AppEndpoint,
    done: SignalReceiver,
    thread: JoinHandle<()>,
    _binding: PipeBinding,
}

// ----------------------------------------------------------------------------
// Worker API
// ----------------------------------------------------------------------------

/// Worker-side communication agent
pub struct WorkerApi {
    context: PipeContext,
    config: WorkerConfig,
    shared: Arc<SharedState>,
    registry: CommunicatorRegistry,
    /// Roles registered for the next start
    roles: Vec<PeerRole>,
    inbound: InboundQueues,
    session: Option<Session>,
    /// Session whose stop signal was sent without waiting for the ack
    stopping: Option<Session>,
}

impl WorkerApi {
    pub fn new(context: PipeContext, config: WorkerConfig) -> WorkerResult<Self> {
        config.validate().map_err(WorkerError::config_error)?;
        Ok(Self {
            context,
            shared: SharedState::new(&config),
            config,
            registry: CommunicatorRegistry::new(),
            roles: Vec::new(),
            inbound: Default::default(),
            session: None,
            stopping: None,
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Roles with a registered communicator, in registration order
    pub fn registered_roles(&self) -> &[PeerRole] {
        match &self.session {
            Some(session) => &session.routes,
            None => &self.roles,
        }
    }

    pub fn stats(&self) -> NetworkStatsSnapshot {
        self.shared.stats().snapshot()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    pub fn add_broker_communicator(&mut self, endpoint: &str) -> WorkerResult<()> {
        let endpoint = Endpoint::parse(endpoint)?;
        let communicator = BrokerCommunicator::new(endpoint, &self.config);
        self.add_communicator(PeerRole::Broker, communicator)
    }

    pub fn add_left_neighbour_communicator(&mut self, endpoint: &str) -> WorkerResult<()> {
        let endpoint = Endpoint::parse(endpoint)?;
        let communicator = NeighbourCommunicator::left(endpoint, &self.config);
        self.add_communicator(PeerRole::LeftNeighbour, communicator)
    }

    pub fn add_right_neighbour_communicator(&mut self, endpoint: &str) -> WorkerResult<()> {
        let endpoint = Endpoint::parse(endpoint)?;
        let communicator = NeighbourCommunicator::right(endpoint, &self.config);
        self.add_communicator(PeerRole::RightNeighbour, communicator)
    }

    /// Register any communicator at a role slot
    ///
    /// Must happen before `start`; each role takes at most one communicator.
    pub fn add_communicator<C: Communicator + 'static>(
        &mut self,
        role: PeerRole,
        communicator: C,
    ) -> WorkerResult<()> {
        if self.session.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }
        self.registry.register(role, Box::new(communicator))?;
        self.roles.push(role);
        debug!(identity = %self.config.identity, %role, "Communicator registered");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Spawn the network thread and block until every communicator connected
    ///
    /// A bind failure (`AddressInUse`) keeps the registered communicators.
    /// Any later failure consumes them: they were released by the network
    /// thread and must be registered again before retrying.
    pub fn start(&mut self) -> WorkerResult<()> {
        if self.session.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }
        if let Some(session) = self.stopping.take() {
            if let Err(e) = self.finish(session) {
                warn!(identity = %self.config.identity, error = %e, "Previous session ended uncleanly");
            }
        }

        let address = pipe::worker_address(&self.config.identity);
        let binding = self.context.bind(&address)?;
        let (app, net) = pipe::pair(self.config.pipe.capacity);
        let (ready_tx, ready_rx) = pipe::rendezvous();
        let (done_tx, done_rx) = pipe::rendezvous();

        self.shared.reset();
        let routes = std::mem::take(&mut self.roles);
        let registry = std::mem::take(&mut self.registry);
        let task = NetworkTask::new(
            registry,
            Arc::clone(&self.shared),
            net,
            self.config.heartbeat_interval(),
            self.config.heartbeat.hook_timeout(),
        );

        let thread = thread::Builder::new()
            .name(format!("distwork-net-{}", self.config.identity))
            .spawn(move || task.run(ready_tx, done_tx))
            .map_err(|e| WorkerError::startup_failed(format!("cannot spawn network thread: {e}")))?;

        match ready_rx.wait() {
            Some(Signal::Ok) => {
                info!(identity = %self.config.identity, %address, "Worker started");
                self.session = Some(Session {
                    routes,
                    pipe: app,
                    done: done_rx,
                    thread,
                    _binding: binding,
                });
                Ok(())
            }
            _ => {
                let cleanup = done_rx.wait();
                if thread.join().is_err() {
                    error!(identity = %self.config.identity, "Network thread panicked");
                }
                let mut reason = self
                    .shared
                    .take_failure()
                    .unwrap_or_else(|| "network thread exited before becoming ready".into());
                if cleanup != Some(Signal::Ok) {
                    warn!(identity = %self.config.identity, ?cleanup, "Cleanup after failed start was unclean");
                    reason.push_str(" (cleanup unclean)");
                }
                Err(WorkerError::startup_failed(reason))
            }
        }
    }

    /// Graceful stop, waiting for the network thread
    pub fn stop(&mut self) -> WorkerResult<()> {
        self.stop_with(StopOptions::default())
    }

    /// Send the shutdown signal and, with `wait`, collect the acknowledgement
    ///
    /// Without `wait` the acknowledgement is collected by the next `stop`,
    /// `start`, or on drop.
    pub fn stop_with(&mut self, options: StopOptions) -> WorkerResult<()> {
        if options.force {
            return Err(WorkerError::ForceStopUnsupported);
        }
        if let Some(session) = self.stopping.take() {
            return self.finish(session);
        }
        let Some(session) = self.session.take() else {
            return Err(WorkerError::NotStarted);
        };

        match session.pipe.send_signal(Signal::Stop) {
            Ok(()) => {}
            Err(WorkerError::PipeFull { capacity }) => {
                self.session = Some(session);
                return Err(WorkerError::PipeFull { capacity });
            }
            Err(_) => {
                // The network thread already left its loop
                return self.finish(session);
            }
        }

        if options.wait {
            self.finish(session)
        } else {
            debug!(identity = %self.config.identity, "Stop signalled, not waiting");
            self.stopping = Some(session);
            Ok(())
        }
    }

    /// Collect the shutdown acknowledgement and join the network thread
    fn finish(&mut self, session: Session) -> WorkerResult<()> {
        let Session {
            mut pipe,
            done,
            thread,
            _binding: binding,
            ..
        } = session;

        let ack = done.wait();
        if thread.join().is_err() {
            error!(identity = %self.config.identity, "Network thread panicked");
        }
        // Keep what was forwarded before the thread ended
        if let Err(e) = drain(&mut pipe, &mut self.inbound) {
            warn!(error = %e, "Discarding undeliverable messages after stop");
        }
        drop(pipe);
        drop(binding);

        match ack {
            Some(Signal::Ok) => {
                info!(identity = %self.config.identity, "Worker stopped");
                Ok(())
            }
            _ => {
                if let Some(reason) = self.shared.take_failure() {
                    warn!(identity = %self.config.identity, %reason, "Worker stopped uncleanly");
                }
                Err(WorkerError::UncleanShutdown)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Queue slot of `role`; while running the role must also be registered
    fn check_route(&self, role: PeerRole) -> WorkerResult<usize> {
        let slot = role
            .slot()
            .ok_or(WorkerError::InvalidRole { tag: role.tag() })?;
        match &self.session {
            Some(session) if !session.routes.contains(&role) => {
                Err(WorkerError::UnroutableRole { role })
            }
            _ => Ok(slot),
        }
    }

    /// Queue a message for the communicator registered at `to`
    pub fn send_message(&mut self, message: Message, to: PeerRole) -> WorkerResult<()> {
        self.check_route(to)?;
        let session = self.session.as_ref().ok_or(WorkerError::NotStarted)?;
        if self.config.verbose {
            debug!(role = %to, frames = %describe(&message), "Sending message");
        }
        session.pipe.send_message(message.tagged(to))
    }

    /// Oldest message from `from`, waiting up to `timeout` for one to arrive
    ///
    /// `Ok(None)` means nothing arrived before the deadline.
    pub fn receive_message_from(
        &mut self,
        from: PeerRole,
        timeout: Duration,
    ) -> WorkerResult<Option<Message>> {
        let slot = self.check_route(from)?;
        let ready = self.wait_for(timeout, |queues| !queues[slot].is_empty())?;
        if !ready {
            return Ok(None);
        }
        Ok(self.inbound[slot].pop_front())
    }

    /// Oldest message from any peer, scanning Broker, LeftNeighbour, RightNeighbour
    pub fn receive_message(&mut self, timeout: Duration) -> WorkerResult<Option<(PeerRole, Message)>> {
        let ready = self.wait_for(timeout, |queues| queues.iter().any(|q| !q.is_empty()))?;
        if !ready {
            return Ok(None);
        }
        for role in PeerRole::ADDRESSABLE {
            let Some(slot) = role.slot() else { continue };
            if let Some(message) = self.inbound[slot].pop_front() {
                return Ok(Some((role, message)));
            }
        }
        Ok(None)
    }

    /// Drain the pipe and wait until `ready` holds for the inbound queues
    fn wait_for<F>(&mut self, timeout: Duration, ready: F) -> WorkerResult<bool>
    where
        F: Fn(&InboundQueues) -> bool,
    {
        let inbound = &mut self.inbound;
        let Some(session) = self.session.as_mut() else {
            // Messages collected before the stop stay readable
            return if ready(&*inbound) {
                Ok(true)
            } else {
                Err(WorkerError::NotStarted)
            };
        };

        drain(&mut session.pipe, inbound)?;
        if ready(&*inbound) {
            return Ok(true);
        }

        let mut failure = None;
        let satisfied = session.pipe.wait_until(timeout, |pipe| match drain(pipe, inbound) {
            Ok(()) => ready(&*inbound),
            Err(e) => {
                failure = Some(e);
                true
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(satisfied),
        }
    }
}

/// Move every message sitting in the pipe to its peer queue
fn drain(pipe: &mut AppEndpoint, inbound: &mut InboundQueues) -> WorkerResult<()> {
    while let Some(mut message) = pipe.try_recv() {
        let role = message.take_tag()?;
        if let Some(slot) = role.slot() {
            inbound[slot].push_back(message);
        }
    }
    Ok(())
}

impl Drop for WorkerApi {
    fn drop(&mut self) {
        if self.session.is_none() && self.stopping.is_none() {
            return;
        }
        match self.stop() {
            Ok(()) => {}
            Err(WorkerError::PipeFull { .. }) => {
                // Closing the pipe ends the network loop once it drained
                if let Some(session) = self.session.take() {
                    drop(session.pipe);
                    if session.done.wait() != Some(Signal::Ok) {
                        warn!(identity = %self.config.identity, "Worker dropped uncleanly");
                    }
                    if session.thread.join().is_err() {
                        error!(identity = %self.config.identity, "Network thread panicked");
                    }
                }
            }
            Err(e) => warn!(identity = %self.config.identity, error = %e, "Worker dropped uncleanly"),
        }
    }
}

impl std::fmt::Debug for WorkerApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerApi")
            .field("identity", &self.config.identity)
            .field("roles", &self.registered_roles())
            .field("running", &self.is_running())
            .finish()
    }
}
