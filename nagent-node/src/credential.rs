//! Credential checks applied before a launch is honored.

use crate::error::{NodeError, Result};
use nagent_proto::LaunchTasksRequest;
use std::path::Path;
use tracing::{info, warn};

/// Decides whether a launch request carries a valid credential.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, req: &LaunchTasksRequest) -> bool;
}

impl<F> CredentialVerifier for F
where
    F: Fn(&LaunchTasksRequest) -> bool + Send + Sync,
{
    fn verify(&self, req: &LaunchTasksRequest) -> bool {
        self(req)
    }
}

/// Accepts any non-empty credential.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptNonEmpty;

impl CredentialVerifier for AcceptNonEmpty {
    fn verify(&self, req: &LaunchTasksRequest) -> bool {
        !req.credential.is_empty()
    }
}

/// Compares the credential against a secret shared with the controller.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl SharedSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Load a secret file; surrounding whitespace is ignored.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let secret = raw.trim_ascii();
        if secret.is_empty() {
            return Err(NodeError::Config(format!(
                "credential file {} is empty",
                path.display()
            )));
        }
        Ok(Self::new(secret))
    }
}

impl CredentialVerifier for SharedSecret {
    fn verify(&self, req: &LaunchTasksRequest) -> bool {
        let given = &req.credential;
        if given.len() != self.secret.len() {
            return false;
        }
        // Compare every byte regardless of where the first mismatch is.
        given
            .iter()
            .zip(&self.secret)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Verifier for the daemon: the shared secret when a file is configured,
/// otherwise any non-empty credential.
pub fn load_verifier(credential_file: Option<&Path>) -> Result<Box<dyn CredentialVerifier>> {
    match credential_file {
        Some(path) => {
            let verifier = SharedSecret::from_file(path)?;
            info!(path = %path.display(), "Using shared-secret credentials");
            Ok(Box::new(verifier))
        }
        None => {
            warn!("No credential file configured, accepting any non-empty credential");
            Ok(Box::new(AcceptNonEmpty))
        }
    }
}
