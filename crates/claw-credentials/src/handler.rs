//! Consumers of issued credentials.

use crate::error::Result;
use crate::types::{BindMount, Container, Credentials, EnvironmentVariable};

/// Receives credentials from the manager.
///
/// Handlers are called in registration order, one call at a time per
/// container. A handler may be shared by many supervision loops at once.
pub trait CredentialHandler: Send + Sync {
    /// Prepares per-container storage before the container starts.
    ///
    /// Returns the bind mounts and environment variables the container needs
    /// to find its credentials.
    fn create_dir(
        &self,
        container: &Container,
    ) -> Result<(Vec<BindMount>, Vec<EnvironmentVariable>)>;

    /// Removes per-container storage after the container is gone.
    fn remove_dir(&self, container: &Container) -> Result<()>;

    /// Hands over a freshly generated credential pair.
    fn update(&self, credentials: &Credentials, container: &Container) -> Result<()>;

    /// Hands over the final, invalidated credential pair.
    fn close(&self, credentials: &Credentials, container: &Container) -> Result<()>;
}

/// A handler that accepts everything and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl CredentialHandler for NoopHandler {
    fn create_dir(
        &self,
        _container: &Container,
    ) -> Result<(Vec<BindMount>, Vec<EnvironmentVariable>)> {
        Ok((Vec::new(), Vec::new()))
    }

    fn remove_dir(&self, _container: &Container) -> Result<()> {
        Ok(())
    }

    fn update(&self, _credentials: &Credentials, _container: &Container) -> Result<()> {
        Ok(())
    }

    fn close(&self, _credentials: &Credentials, _container: &Container) -> Result<()> {
        Ok(())
    }
}
