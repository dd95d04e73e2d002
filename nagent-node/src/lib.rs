//! nagent-node - Node Agent launching and supervising job step tasks.
//!
//! ## Threads
//!
//! - **control**: receives datagrams and dispatches requests ([`NodeAgent`])
//! - **supervisor**: one per task; error pipe, `waitpid`, exit report
//! - **relays**: four per task; stdout, stderr, stdin and client signals
//! - **reporter**: sends exit reports and frees registry slots
//! - **signals**: waits for SIGINT/SIGTERM
//!
//! The [`TaskRegistry`] is the only state shared between them.

pub mod agent;
pub mod cbuf;
pub mod config;
pub mod credential;
pub mod error;
pub mod launch;
pub mod lifecycle;
pub mod registry;
pub mod relay;
pub mod signals;

pub use agent::NodeAgent;
pub use cbuf::{CircularBuffer, CircularBufferError};
pub use config::NodeConfig;
pub use credential::{AcceptNonEmpty, CredentialVerifier, SharedSecret, load_verifier};
pub use error::{LaunchError, NodeError, RegistryError, Result};
pub use launch::{Launcher, TaskDescriptor};
pub use lifecycle::{TaskEvent, TaskExit, TaskReport, kill_tasks};
pub use registry::{RegistryLimits, StepHandle, TaskHandle, TaskRegistry};
