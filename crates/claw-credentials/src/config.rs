//! Credential manager configuration.
//!
//! Loaded from TOML, for example:
//!
//! ```toml
//! enabled = true
//! validity_period = "24h"
//! ca_cert_path = "/etc/claw/pki/instance-ca.crt"
//! ca_key_path = "/etc/claw/pki/instance-ca.key"
//! generation_identity = "random"
//!
//! [instance_identity]
//! cred_dir = "/var/lib/claw/instance-identity"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::handler::CredentialHandler;
use crate::identity::{InstanceIdentityHandler, DEFAULT_CONTAINER_PATH};
use crate::manager::{CredManager, CredentialManager, GenerationIdentity, NoopCredManager};
use crate::metrics::MetricsSink;
use crate::rotation::MIN_VALIDITY_PERIOD;

/// Default certificate lifetime.
pub const DEFAULT_VALIDITY_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings for the filesystem instance identity handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceIdentityConfig {
    /// Host directory under which per-container directories are created.
    pub cred_dir: PathBuf,
    /// Mount point inside the container.
    #[serde(default = "default_container_path")]
    pub container_path: PathBuf,
}

fn default_container_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONTAINER_PATH)
}

/// Credential manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialConfig {
    /// Whether credentials are issued at all.
    pub enabled: bool,
    /// Lifetime of each issued certificate.
    #[serde(with = "humantime_serde")]
    pub validity_period: Duration,
    /// PEM file holding the CA certificate.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM file holding the CA private key.
    pub ca_key_path: Option<PathBuf>,
    /// Where certificate common names come from.
    pub generation_identity: GenerationIdentity,
    /// Filesystem handler settings; no filesystem handler when absent.
    pub instance_identity: Option<InstanceIdentityConfig>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            validity_period: DEFAULT_VALIDITY_PERIOD,
            ca_cert_path: None,
            ca_key_path: None,
            generation_identity: GenerationIdentity::default(),
            instance_identity: None,
        }
    }
}

impl CredentialConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.validity_period < MIN_VALIDITY_PERIOD {
            return Err(Error::Config(format!(
                "validity_period must be at least {MIN_VALIDITY_PERIOD:?}"
            )));
        }

        if self.enabled {
            if self.ca_cert_path.is_none() {
                return Err(Error::Config(
                    "ca_cert_path is required when credentials are enabled".to_string(),
                ));
            }
            if self.ca_key_path.is_none() {
                return Err(Error::Config(
                    "ca_key_path is required when credentials are enabled".to_string(),
                ));
            }
        }

        if let Some(identity) = &self.instance_identity {
            if identity.cred_dir.as_os_str().is_empty() {
                return Err(Error::Config(
                    "instance_identity.cred_dir cannot be empty".to_string(),
                ));
            }
            if !identity.container_path.is_absolute() {
                return Err(Error::Config(
                    "instance_identity.container_path must be absolute".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Loads the CA named by `ca_cert_path` and `ca_key_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if either path is unset or the CA cannot be loaded.
    pub fn load_authority(&self) -> Result<CertificateAuthority> {
        let (Some(cert_path), Some(key_path)) = (&self.ca_cert_path, &self.ca_key_path) else {
            return Err(Error::Config(
                "ca_cert_path and ca_key_path must both be set".to_string(),
            ));
        };
        CertificateAuthority::from_files(cert_path, key_path)
    }

    /// Builds the manager this configuration describes.
    ///
    /// A disabled configuration yields a [`NoopCredManager`]. Otherwise the
    /// filesystem handler, when configured, runs before `extra_handlers`.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails or the CA cannot be loaded.
    pub fn build_manager(
        &self,
        metrics: Arc<dyn MetricsSink>,
        extra_handlers: Vec<Arc<dyn CredentialHandler>>,
    ) -> Result<Arc<dyn CredManager>> {
        self.validate()?;

        if !self.enabled {
            info!("credential issuance disabled");
            return Ok(Arc::new(NoopCredManager));
        }

        let ca = Arc::new(self.load_authority()?);
        let mut builder = CredentialManager::builder(ca, self.validity_period)
            .metrics(metrics)
            .generation_identity(self.generation_identity);

        if let Some(identity) = &self.instance_identity {
            builder = builder.handler(Arc::new(InstanceIdentityHandler::new(
                &identity.cred_dir,
                &identity.container_path,
            )));
        }

        let manager = builder.handlers(extra_handlers).build()?;
        info!(
            handlers = manager.handler_count(),
            validity = ?self.validity_period,
            "credential issuance enabled"
        );
        Ok(Arc::new(manager))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::types::Container;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn write_ca(dir: &Path) -> (PathBuf, PathBuf) {
        let ca = CertificateAuthority::generate("Config CA").unwrap();
        let cert_path = dir.join("ca.crt");
        let key_path = dir.join("ca.key");
        std::fs::write(&cert_path, ca.certificate_pem()).unwrap();
        std::fs::write(&key_path, ca.private_key_pem().as_bytes()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn empty_config_is_disabled_with_defaults() {
        let config = CredentialConfig::from_toml("").unwrap();
        assert_eq!(config, CredentialConfig::default());
        assert!(!config.enabled);
        assert_eq!(config.validity_period, DEFAULT_VALIDITY_PERIOD);
        assert_eq!(config.generation_identity, GenerationIdentity::Random);
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
            enabled = true
            validity_period = "1h 30m"
            ca_cert_path = "/etc/ca.crt"
            ca_key_path = "/etc/ca.key"
            generation_identity = "container_guid"

            [instance_identity]
            cred_dir = "/var/creds"
        "#;

        let config = CredentialConfig::from_toml(toml).unwrap();
        assert!(config.enabled);
        assert_eq!(config.validity_period, Duration::from_secs(90 * 60));
        assert_eq!(config.ca_cert_path, Some(PathBuf::from("/etc/ca.crt")));
        assert_eq!(config.generation_identity, GenerationIdentity::ContainerGuid);
        let identity = config.instance_identity.unwrap();
        assert_eq!(identity.cred_dir, PathBuf::from("/var/creds"));
        assert_eq!(identity.container_path, PathBuf::from(DEFAULT_CONTAINER_PATH));
    }

    #[test]
    fn short_validity_is_rejected() {
        let err = CredentialConfig::from_toml(r#"validity_period = "500ms""#).unwrap_err();
        assert!(err.to_string().contains("validity_period"));
    }

    #[test]
    fn enabled_requires_ca_paths() {
        let err = CredentialConfig::from_toml("enabled = true").unwrap_err();
        assert!(err.to_string().contains("ca_cert_path"));

        let err = CredentialConfig::from_toml(
            r#"
            enabled = true
            ca_cert_path = "/etc/ca.crt"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ca_key_path"));
    }

    #[test]
    fn relative_container_path_is_rejected() {
        let toml = r#"
            [instance_identity]
            cred_dir = "/var/creds"
            container_path = "relative/path"
        "#;
        let err = CredentialConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("container_path"));
    }

    #[test]
    fn unknown_identity_mode_is_rejected() {
        let err = CredentialConfig::from_toml(r#"generation_identity = "serial""#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let file = create_temp_config(r#"validity_period = "2h""#);
        let config = CredentialConfig::from_file(file.path()).unwrap();
        assert_eq!(config.validity_period, Duration::from_secs(2 * 60 * 60));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = CredentialConfig::from_file("/nonexistent/credentials.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn disabled_config_builds_noop_manager() {
        let manager = CredentialConfig::default()
            .build_manager(Arc::new(InMemoryMetrics::new()), Vec::new())
            .unwrap();
        let (mounts, env) = manager.create_cred_dir(&Container::new("guid")).unwrap();
        assert!(mounts.is_empty());
        assert!(env.is_empty());
    }

    #[test]
    fn enabled_config_wires_filesystem_handler() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_ca(dir.path());
        let config = CredentialConfig {
            enabled: true,
            ca_cert_path: Some(cert_path),
            ca_key_path: Some(key_path),
            instance_identity: Some(InstanceIdentityConfig {
                cred_dir: dir.path().join("creds"),
                container_path: default_container_path(),
            }),
            ..CredentialConfig::default()
        };

        let manager = config
            .build_manager(Arc::new(InMemoryMetrics::new()), Vec::new())
            .unwrap();
        let (mounts, env) = manager.create_cred_dir(&Container::new("guid")).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].src_path, dir.path().join("creds").join("guid"));
        assert_eq!(env.len(), 2);
        assert!(dir.path().join("creds").join("guid").is_dir());
    }

    #[test]
    fn missing_ca_files_fail_build() {
        let config = CredentialConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            ca_key_path: Some(PathBuf::from("/nonexistent/ca.key")),
            ..CredentialConfig::default()
        };
        let result = config.build_manager(Arc::new(InMemoryMetrics::new()), Vec::new());
        assert!(matches!(result.err(), Some(Error::Io(_))));
    }
}
