//! Credential lifecycle manager.
//!
//! One [`CredentialManager`] serves every container on an executor. For each
//! container it hands out a [`Runner`] that issues credentials, fans them out
//! to the registered handlers, rotates them before they expire, and hands
//! over an invalidated pair when the container is shut down.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::ca::CertificateAuthority;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, HandlerErrors, Result};
use crate::factory::{generate_credentials, EntropySource, ValidityWindow};
use crate::handler::CredentialHandler;
use crate::metrics::{
    InMemoryMetrics, MetricsSink, CRED_CREATION_FAILED_COUNT, CRED_CREATION_SUCCEEDED_COUNT,
    CRED_CREATION_SUCCEEDED_DURATION,
};
use crate::rotation::RotationPolicy;
use crate::runner::{run_fn, Ready, Runner, Signal, Signals};
use crate::types::{BindMount, Container, ContainerInfo, Credentials, EnvironmentVariable};

/// Per-container credential management as seen by the executor.
pub trait CredManager: Send + Sync {
    /// Prepares credential storage for a container and returns what it must mount.
    fn create_cred_dir(
        &self,
        container: &Container,
    ) -> Result<(Vec<BindMount>, Vec<EnvironmentVariable>)>;

    /// Tears down credential storage for a container.
    fn remove_cred_dir(&self, container: &Container) -> Result<()>;

    /// Returns the supervision loop for one container.
    fn runner(&self, provider: Arc<dyn ContainerInfo>) -> Box<dyn Runner>;
}

/// Common name source for rotated certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationIdentity {
    /// A fresh random UUID every cycle.
    #[default]
    Random,
    /// The container GUID.
    ContainerGuid,
}

/// Manager used when credential issuance is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCredManager;

impl CredManager for NoopCredManager {
    fn create_cred_dir(
        &self,
        _container: &Container,
    ) -> Result<(Vec<BindMount>, Vec<EnvironmentVariable>)> {
        Ok((Vec::new(), Vec::new()))
    }

    fn remove_cred_dir(&self, _container: &Container) -> Result<()> {
        Ok(())
    }

    fn runner(&self, _provider: Arc<dyn ContainerInfo>) -> Box<dyn Runner> {
        run_fn(|mut signals: Signals, ready: Ready| {
            Box::pin(async move {
                let _ = ready.send(());
                signals.recv().await;
                Ok(())
            })
        })
    }
}

/// Issues and rotates mTLS credentials for containers.
///
/// Cheap to clone; clones share the CA, handlers, clock, metrics and
/// entropy source. The shared source only seeds a generator per cycle, so
/// loops generate keys concurrently.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    ca: Arc<CertificateAuthority>,
    policy: RotationPolicy,
    entropy: Mutex<Box<EntropySource>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    handlers: Vec<Arc<dyn CredentialHandler>>,
    generation_identity: GenerationIdentity,
}

/// Builder for [`CredentialManager`].
pub struct CredentialManagerBuilder {
    ca: Arc<CertificateAuthority>,
    validity_period: Duration,
    entropy: Option<Box<EntropySource>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    handlers: Vec<Arc<dyn CredentialHandler>>,
    generation_identity: GenerationIdentity,
}

impl CredentialManagerBuilder {
    /// Sets the randomness source for keys, serial numbers and identifiers.
    #[must_use]
    pub fn entropy(mut self, entropy: impl rand_core::CryptoRngCore + Send + 'static) -> Self {
        self.entropy = Some(Box::new(entropy));
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Appends a handler. Handlers are called in the order they are added.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn CredentialHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Appends several handlers, in order.
    #[must_use]
    pub fn handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn CredentialHandler>>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Sets where certificate common names come from.
    #[must_use]
    pub const fn generation_identity(mut self, identity: GenerationIdentity) -> Self {
        self.generation_identity = identity;
        self
    }

    /// Builds the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the validity period is shorter than one second.
    pub fn build(self) -> Result<CredentialManager> {
        let policy = RotationPolicy::new(self.validity_period)?;

        debug!(
            validity = ?policy.validity_period(),
            rotation = ?policy.rotation_interval(),
            handlers = self.handlers.len(),
            "credential manager configured"
        );

        Ok(CredentialManager {
            inner: Arc::new(ManagerInner {
                ca: self.ca,
                policy,
                entropy: Mutex::new(self.entropy.unwrap_or_else(|| Box::new(OsRng))),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                metrics: self
                    .metrics
                    .unwrap_or_else(|| Arc::new(InMemoryMetrics::new())),
                handlers: self.handlers,
                generation_identity: self.generation_identity,
            }),
        })
    }
}

impl CredentialManager {
    /// Starts building a manager that signs with `ca` and issues
    /// certificates valid for `validity_period`.
    #[must_use]
    pub fn builder(ca: Arc<CertificateAuthority>, validity_period: Duration) -> CredentialManagerBuilder {
        CredentialManagerBuilder {
            ca,
            validity_period,
            entropy: None,
            clock: None,
            metrics: None,
            handlers: Vec::new(),
            generation_identity: GenerationIdentity::default(),
        }
    }

    /// Validity and rotation timing.
    #[must_use]
    pub fn policy(&self) -> RotationPolicy {
        self.inner.policy
    }

    /// The signing CA.
    #[must_use]
    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.inner.ca
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("ca", &self.inner.ca)
            .field("policy", &self.inner.policy)
            .field("handlers", &self.inner.handlers.len())
            .field("generation_identity", &self.inner.generation_identity)
            .finish_non_exhaustive()
    }
}

impl CredManager for CredentialManager {
    fn create_cred_dir(
        &self,
        container: &Container,
    ) -> Result<(Vec<BindMount>, Vec<EnvironmentVariable>)> {
        let mut mounts = Vec::new();
        let mut env = Vec::new();
        for handler in &self.inner.handlers {
            let (handler_mounts, handler_env) = handler.create_dir(container).inspect_err(|e| {
                error!(guid = %container.guid, error = %e, "failed to create credential directory");
            })?;
            mounts.extend(handler_mounts);
            env.extend(handler_env);
        }
        Ok((mounts, env))
    }

    fn remove_cred_dir(&self, container: &Container) -> Result<()> {
        let mut errors = HandlerErrors::new();
        for handler in &self.inner.handlers {
            if let Err(e) = handler.remove_dir(container) {
                error!(guid = %container.guid, error = %e, "failed to remove credential directory");
                errors.push(e);
            }
        }
        errors.into_result()
    }

    fn runner(&self, provider: Arc<dyn ContainerInfo>) -> Box<dyn Runner> {
        let inner = Arc::clone(&self.inner);
        run_fn(move |signals: Signals, ready: Ready| {
            Box::pin(inner.supervise(provider, signals, ready))
        })
    }
}

impl ManagerInner {
    async fn supervise(
        self: Arc<Self>,
        provider: Arc<dyn ContainerInfo>,
        signals: Signals,
        ready: Ready,
    ) -> Result<()> {
        let container = provider.info();
        let span = info_span!("cred_manager_runner", container = %container.guid);
        async move {
            info!("starting");
            let result = self
                .run_loop(provider.as_ref(), container, signals, ready)
                .await;
            info!("complete");
            result
        }
        .instrument(span)
        .await
    }

    /// Runs the loop, issuing the first pair for `container`.
    async fn run_loop(
        self: &Arc<Self>,
        provider: &dyn ContainerInfo,
        container: Container,
        mut signals: Signals,
        ready: Ready,
    ) -> Result<()> {
        let (credentials, elapsed) = self.generate_recorded(&container, false).await?;
        self.update_all(&credentials, &container)?;
        self.record_success(elapsed);

        let mut timer = self.clock.new_timer(self.policy.rotation_interval());
        let _ = ready.send(());

        loop {
            tokio::select! {
                () = timer.fired() => {
                    debug!("regenerating credentials");
                    let container = provider.info();
                    let (credentials, elapsed) = self.generate_recorded(&container, false).await?;
                    self.update_all(&credentials, &container)?;
                    self.record_success(elapsed);
                    timer.reset(self.policy.rotation_interval());
                    debug!("regenerated credentials");
                }
                signal = signals.recv() => {
                    let signal = signal.unwrap_or(Signal::Terminate);
                    info!(%signal, "signalled");
                    let container = provider.info();
                    let (credentials, _) = self.generate_recorded(&container, true).await?;
                    self.close_all(&credentials, &container);
                    return Ok(());
                }
            }
        }
    }

    /// Generates a credential pair off the async runtime and records failures.
    async fn generate_recorded(
        self: &Arc<Self>,
        container: &Container,
        invalidation: bool,
    ) -> Result<(Credentials, Duration)> {
        let start = self.clock.now();
        let inner = Arc::clone(self);
        let snapshot = container.clone();
        let span = Span::current();

        let result = tokio::task::spawn_blocking(move || {
            span.in_scope(|| inner.generate(&snapshot, invalidation))
        })
        .await
        .map_err(|e| Error::Runner(format!("credential generation task failed: {e}")))
        .and_then(std::convert::identity);

        match result {
            Ok(credentials) => {
                let elapsed = (self.clock.now() - start).to_std().unwrap_or_default();
                Ok((credentials, elapsed))
            }
            Err(e) => {
                error!(error = %e, "failed to generate credentials");
                self.increment(CRED_CREATION_FAILED_COUNT);
                Err(e)
            }
        }
    }

    fn generate(&self, container: &Container, invalidation: bool) -> Result<Credentials> {
        let window = ValidityWindow::starting_at(self.clock.now(), self.policy.validity_period())?;
        let mut rng = self.cycle_rng()?;

        let identifier = if invalidation {
            String::new()
        } else {
            match self.generation_identity {
                GenerationIdentity::Random => random_identifier(&mut rng)?,
                GenerationIdentity::ContainerGuid => container.guid.clone(),
            }
        };

        generate_credentials(&self.ca, &mut rng, &identifier, container, &window)
    }

    /// Seeds a generator for one cycle. The shared source is locked only for the draw.
    fn cycle_rng(&self) -> Result<StdRng> {
        let mut seed = <StdRng as SeedableRng>::Seed::default();
        self.entropy
            .lock()
            .try_fill_bytes(&mut seed)
            .map_err(|e| Error::Entropy(format!("failed to seed credential generation: {e}")))?;
        Ok(StdRng::from_seed(seed))
    }

    fn update_all(&self, credentials: &Credentials, container: &Container) -> Result<()> {
        for handler in &self.handlers {
            handler.update(credentials, container).inspect_err(|e| {
                error!(error = %e, "failed to update credential handler");
            })?;
        }
        Ok(())
    }

    fn close_all(&self, credentials: &Credentials, container: &Container) {
        for handler in &self.handlers {
            if let Err(e) = handler.close(credentials, container) {
                warn!(error = %e, "failed to close credential handler");
            }
        }
    }

    fn record_success(&self, elapsed: Duration) {
        self.increment(CRED_CREATION_SUCCEEDED_COUNT);
        if let Err(e) = self
            .metrics
            .send_duration(CRED_CREATION_SUCCEEDED_DURATION, elapsed)
        {
            warn!(metric = CRED_CREATION_SUCCEEDED_DURATION, error = %e, "failed to send metric");
        }
    }

    fn increment(&self, name: &str) {
        if let Err(e) = self.metrics.increment_counter(name) {
            warn!(metric = name, error = %e, "failed to send metric");
        }
    }
}

/// Draws a version 4 UUID from `entropy`.
fn random_identifier(entropy: &mut EntropySource) -> Result<String> {
    let mut bytes = [0u8; 16];
    entropy
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Entropy(format!("failed to generate identifier: {e}")))?;
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
}
