//! Credential manager error types.

use std::fmt;

use thiserror::Error;

/// Result type for credential operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Credential manager error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// The randomness source could not produce bytes.
    #[error("entropy source failed: {0}")]
    Entropy(String),

    /// Private key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed.
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// Certificate or key parsing failed.
    #[error("certificate parsing failed: {0}")]
    Parse(String),

    /// Certificate validation failed.
    #[error("certificate validation failed: {0}")]
    Validation(String),

    /// Subject Alternative Name error.
    #[error("SAN error: {0}")]
    San(String),

    /// A credential handler failed.
    #[error("credential handler failed: {0}")]
    Handler(String),

    /// Several credential handlers failed during teardown.
    #[error("{0}")]
    Handlers(HandlerErrors),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The supervision loop could not be driven to completion.
    #[error("runner failed: {0}")]
    Runner(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors collected from every handler that failed a fan-out call.
///
/// The message joins each handler's message with `"; "`, in handler order.
#[derive(Debug, Default)]
pub struct HandlerErrors(Vec<Error>);

impl HandlerErrors {
    /// Creates an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Records a handler failure.
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    /// Returns the collected errors.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Returns `true` if no handler failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts into `Ok(())` when empty, or a combined [`Error::Handlers`].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Handlers(self))
        }
    }
}

impl fmt::Display for HandlerErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
