//! Echo worker application
//!
//! Sends every received message straight back to the role it came from.
//! The worker facade is synchronous, so the echo loop runs on a blocking
//! thread and polls a stop flag between receives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use distwork_core::{NetworkStatsSnapshot, WorkerError};
use distwork_runtime::{PipeContext, WorkerApi};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// How long one receive waits before the stop flag is checked again
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct EchoApp {
    worker: WorkerApi,
    echoed: u64,
}

impl EchoApp {
    /// Create the worker and register every configured peer
    pub fn new(config: &AppConfig) -> Result<Self> {
        let peers = &config.peers;
        if peers.broker.is_none() && peers.left.is_none() && peers.right.is_none() {
            return Err(CliError::Config(
                "At least one of broker, left or right must be configured".to_string(),
            ));
        }

        let mut worker = WorkerApi::new(PipeContext::new(), config.worker.clone())?;
        if let Some(endpoint) = &peers.broker {
            worker.add_broker_communicator(endpoint)?;
        }
        if let Some(endpoint) = &peers.left {
            worker.add_left_neighbour_communicator(endpoint)?;
        }
        if let Some(endpoint) = &peers.right {
            worker.add_right_neighbour_communicator(endpoint)?;
        }
        Ok(Self { worker, echoed: 0 })
    }

    pub fn worker(&self) -> &WorkerApi {
        &self.worker
    }

    pub fn start(&mut self) -> Result<()> {
        self.worker.start()?;
        info!(
            identity = %self.worker.identity(),
            roles = ?self.worker.registered_roles(),
            "Echo worker running"
        );
        Ok(())
    }

    /// Echo until `stop` is raised, then stop the worker and report its stats
    pub fn run(&mut self, stop: &AtomicBool) -> Result<NetworkStatsSnapshot> {
        let outcome = self.echo_until(stop);
        let stopped = self.worker.stop();
        outcome?;
        stopped?;
        info!(echoed = self.echoed, "Echo worker stopped");
        Ok(self.worker.stats())
    }

    fn echo_until(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::SeqCst) {
            let Some((role, message)) = self.worker.receive_message(POLL_INTERVAL)? else {
                continue;
            };
            debug!(%role, frames = message.len(), "Echoing message");
            match self.worker.send_message(message, role) {
                Ok(()) => self.echoed += 1,
                Err(WorkerError::PipeFull { capacity }) => {
                    warn!(%role, capacity, "Pipe full, dropping echo");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
