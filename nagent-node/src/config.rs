//! Daemon configuration.

use crate::error::{NodeError, Result};
use crate::registry::RegistryLimits;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6818;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Datagram address for control messages.
    pub listen: SocketAddr,
    /// Receives every task exit report when set.
    pub controller: Option<SocketAddr>,
    pub node_name: String,
    pub limits: RegistryLimits,
    /// Circular buffer capacity per relay.
    pub buffer_size: usize,
    pub credential_file: Option<PathBuf>,
    /// Timeout for connecting task I/O streams to the client.
    pub connect_timeout: Duration,
    /// How often the control loop checks for shutdown while idle.
    pub poll_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            controller: None,
            node_name: "localhost".to_string(),
            limits: RegistryLimits {
                max_steps: 64,
                max_tasks: 256,
                max_tasks_per_step: 128,
            },
            buffer_size: 4096,
            credential_file: None,
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_steps == 0 || limits.max_tasks == 0 || limits.max_tasks_per_step == 0 {
            return Err(NodeError::Config("registry limits must be non-zero".into()));
        }
        if self.buffer_size == 0 {
            return Err(NodeError::Config("buffer size must be non-zero".into()));
        }
        if self.node_name.is_empty() {
            return Err(NodeError::Config("node name must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(NodeError::Config("poll interval must be non-zero".into()));
        }
        Ok(())
    }
}
