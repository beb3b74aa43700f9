//! Centralized Configuration Management
//!
//! All tunables of a worker live in [`WorkerConfig`]: the identity that names
//! the pipe endpoint, the heartbeat cadence shared by the reactor poll and
//! the timeout hooks, the pipe bound, and the TCP link limits used by the
//! broker and neighbour communicators.

use core::time::Duration;

// ----------------------------------------------------------------------------
// Heartbeat Configuration
// ----------------------------------------------------------------------------

/// Heartbeat cadence and liveness tolerance
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Reactor poll timeout, and interval between heartbeats sent to peers
    pub interval_ms: u64,
    /// Silent intervals tolerated before a link is declared dead
    pub liveness: u32,
    /// Longest a single communicator hook may run before it is abandoned
    pub hook_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2500,
            liveness: 3,
            hook_timeout_ms: 10_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Pipe Configuration
// ----------------------------------------------------------------------------

/// Configuration of the inter-thread pipe
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Messages the application can queue toward the network thread before
    /// sends fail with `PipeFull`
    pub capacity: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

// ----------------------------------------------------------------------------
// Link Configuration
// ----------------------------------------------------------------------------

/// Limits for the TCP links owned by communicators
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub connect_timeout_ms: u64,
    /// First delay before redialing a dropped link; doubles per failed attempt
    pub reconnect_interval_ms: u64,
    /// Upper bound of the reconnection backoff
    pub max_reconnect_interval_ms: u64,
    /// Longest a single frame write may block before the link is dropped
    pub write_timeout_ms: u64,
    /// Largest encoded message accepted on the wire
    pub max_frame_size: usize,
    /// Outbound messages kept while a link is down
    pub outbound_queue_limit: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            reconnect_interval_ms: 2500,
            max_reconnect_interval_ms: 30_000,
            write_timeout_ms: 1000,
            max_frame_size: 16 * 1024 * 1024,
            outbound_queue_limit: 10_000,
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms.max(self.reconnect_interval_ms))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Backoff before the next redial after `failures` consecutive failed
    /// attempts, capped at [`Self::max_reconnect_interval`]
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(31);
        self.reconnect_interval()
            .checked_mul(factor)
            .map_or(self.max_reconnect_interval(), |delay| {
                delay.min(self.max_reconnect_interval())
            })
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Complete configuration of one worker
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity; names the pipe endpoint and is announced to peers
    pub identity: String,
    /// Log every routed message at debug level
    pub verbose: bool,
    pub heartbeat: HeartbeatConfig,
    pub pipe: PipeConfig,
    pub link: LinkConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identity: "worker".into(),
            verbose: false,
            heartbeat: HeartbeatConfig::default(),
            pipe: PipeConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration with default values for the given identity
    pub fn new<T: Into<String>>(identity: T) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    /// Create configuration optimized for testing: short heartbeats and timeouts
    pub fn testing<T: Into<String>>(identity: T) -> Self {
        Self {
            identity: identity.into(),
            verbose: true,
            heartbeat: HeartbeatConfig {
                interval_ms: 50,
                liveness: 3,
                hook_timeout_ms: 2000,
            },
            pipe: PipeConfig { capacity: 100 },
            link: LinkConfig {
                connect_timeout_ms: 500,
                reconnect_interval_ms: 100,
                max_reconnect_interval_ms: 1000,
                write_timeout_ms: 200,
                ..LinkConfig::default()
            },
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe.capacity = capacity;
        self
    }

    /// Heartbeat interval shared by the reactor poll and the timeout hooks
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat.interval()
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.identity.is_empty() {
            return Err("Identity cannot be empty".into());
        }
        if self.heartbeat.interval_ms == 0 {
            return Err("Heartbeat interval cannot be zero".into());
        }
        if self.heartbeat.liveness == 0 {
            return Err("Heartbeat liveness cannot be zero".into());
        }
        if self.heartbeat.hook_timeout_ms == 0 {
            return Err("Hook timeout cannot be zero".into());
        }
        if self.pipe.capacity == 0 {
            return Err("Pipe capacity cannot be zero".into());
        }
        if self.link.max_frame_size == 0 {
            return Err("Max frame size cannot be zero".into());
        }
        if self.link.outbound_queue_limit == 0 {
            return Err("Outbound queue limit cannot be zero".into());
        }
        if self.link.write_timeout_ms == 0 {
            return Err("Write timeout cannot be zero".into());
        }
        Ok(())
    }
}
