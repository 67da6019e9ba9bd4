//! Per-container mTLS credentials for Clawbernetes executors.
//!
//! Every running container gets two short-lived certificates signed by a
//! shared CA: an instance identity certificate bound to its IP address and a
//! container-to-container (c2c) certificate bound to its internal routes.
//! The manager rotates both before they expire and, on shutdown, hands an
//! invalidated pair to every handler so consumers can drain cleanly.
//!
//! # Overview
//!
//! - A [`CredentialManager`] owns the CA, the rotation policy, the entropy
//!   source, the clock, the metrics sink and an ordered list of
//!   [`CredentialHandler`]s.
//! - [`CredManager::runner`] returns one supervision loop per container. Spawn
//!   it with [`Process::spawn`], wait for readiness, and send a [`Signal`] to
//!   stop it.
//! - [`CredManager::create_cred_dir`] and [`CredManager::remove_cred_dir`]
//!   bracket the container's lifetime.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use claw_credentials::{
//!     CertificateAuthority, Container, CredManager, CredentialManager, NoopHandler,
//! };
//!
//! let ca = Arc::new(CertificateAuthority::generate("Instance Identity CA").unwrap());
//! let manager = CredentialManager::builder(ca, Duration::from_secs(24 * 60 * 60))
//!     .handler(Arc::new(NoopHandler))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(
//!     manager.policy().rotation_interval(),
//!     Duration::from_secs(23 * 60 * 60 + 30 * 60)
//! );
//!
//! let (mounts, env) = manager.create_cred_dir(&Container::new("guid")).unwrap();
//! assert!(mounts.is_empty() && env.is_empty());
//! ```
//!
//! # Modules
//!
//! - [`manager`] - Credential manager and supervision loop
//! - [`factory`] - Certificate generation
//! - [`ca`] - Certificate authority loading
//! - [`handler`] - Handler trait
//! - [`identity`] - Filesystem instance identity handler
//! - [`rotation`] - Rotation schedule
//! - [`runner`] - Run-until-signalled contract
//! - [`clock`] - Time source and timers
//! - [`metrics`] - Metrics sink
//! - [`config`] - TOML configuration
//! - [`validation`] - Credential inspection
//! - [`types`] - Core types
//! - [`error`] - Error types

#![forbid(unsafe_code)]

pub mod ca;
pub mod clock;
pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
pub mod identity;
pub mod manager;
pub mod metrics;
pub mod rotation;
pub mod runner;
pub mod types;
pub mod validation;

pub use ca::CertificateAuthority;
pub use clock::{Clock, ManualClock, SystemClock, Timer};
pub use config::{CredentialConfig, InstanceIdentityConfig};
pub use error::{Error, HandlerErrors, Result};
pub use factory::{
    generate_credential, generate_credentials, CertificateSubject, ValidityWindow,
};
pub use handler::{CredentialHandler, NoopHandler};
pub use identity::InstanceIdentityHandler;
pub use manager::{
    CredManager, CredentialManager, CredentialManagerBuilder, GenerationIdentity,
    NoopCredManager,
};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use rotation::{rotation_interval, RotationPolicy};
pub use runner::{run_fn, Process, Runner, Signal};
pub use types::{
    BindMount, BindMountMode, Container, ContainerInfo, Credential, Credentials,
    EnvironmentVariable, InternalRoute, SharedContainer,
};
pub use validation::{parse_chain, verify_credential, IssuedCertificate};
