//! Core types shared by the manager, the factory and the handlers.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// One PEM-encoded certificate chain and private key.
///
/// `cert` holds the leaf certificate immediately followed by the CA
/// certificate, so it can be used directly as a chain file.
#[derive(Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    /// PEM certificate chain (leaf, then CA).
    pub cert: String,
    /// PEM private key.
    pub key: String,
}

impl Credential {
    /// Creates a credential from PEM strings.
    #[must_use]
    pub const fn new(cert: String, key: String) -> Self {
        Self { cert, key }
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self {
            cert: self.cert.clone(),
            key: self.key.clone(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("cert", &self.cert)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// The pair of credentials issued for a container in one generation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Certificate bound to the container's IP address.
    pub instance_identity: Credential,
    /// Certificate bound to the container's internal routes.
    pub c2c: Credential,
}

/// An internal (container-to-container) route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalRoute {
    /// Hostname the route answers to.
    pub hostname: String,
}

impl InternalRoute {
    /// Creates a route for `hostname`.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

/// Point-in-time view of a container, as seen by the credential manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Container instance GUID.
    pub guid: String,
    /// Address on the container network. May be empty.
    #[serde(default)]
    pub internal_ip: String,
    /// Address on the host network. Used when `internal_ip` is empty.
    #[serde(default)]
    pub external_ip: String,
    /// Internal routes pointing at this container.
    #[serde(default)]
    pub internal_routes: Vec<InternalRoute>,
    /// Organizational units stamped into the certificate subject.
    #[serde(default)]
    pub organizational_units: Vec<String>,
}

impl Container {
    /// Creates a container snapshot with only a GUID set.
    #[must_use]
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            ..Self::default()
        }
    }

    /// Returns the address the instance identity certificate is issued for.
    #[must_use]
    pub fn certificate_ip(&self) -> &str {
        if self.internal_ip.is_empty() {
            &self.external_ip
        } else {
            &self.internal_ip
        }
    }
}

/// Supplies the current container snapshot.
///
/// Called once per generation cycle so rotated certificates reflect
/// the container's current addresses and routes.
pub trait ContainerInfo: Send + Sync {
    /// Returns the current snapshot.
    fn info(&self) -> Container;
}

impl ContainerInfo for Container {
    fn info(&self) -> Container {
        self.clone()
    }
}

/// A container snapshot that can be replaced while loops are reading it.
#[derive(Debug, Clone, Default)]
pub struct SharedContainer {
    inner: Arc<RwLock<Container>>,
}

impl SharedContainer {
    /// Wraps an initial snapshot.
    #[must_use]
    pub fn new(container: Container) -> Self {
        Self {
            inner: Arc::new(RwLock::new(container)),
        }
    }

    /// Replaces the snapshot.
    pub fn set(&self, container: Container) {
        *self.inner.write() = container;
    }

    /// Mutates the snapshot in place.
    pub fn update(&self, f: impl FnOnce(&mut Container)) {
        f(&mut self.inner.write());
    }
}

impl ContainerInfo for SharedContainer {
    fn info(&self) -> Container {
        self.inner.read().clone()
    }
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    /// Read-only inside the container.
    ReadOnly,
    /// Writable inside the container.
    ReadWrite,
}

/// A host directory to expose inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Path on the host.
    pub src_path: PathBuf,
    /// Path inside the container.
    pub dst_path: PathBuf,
    /// Access mode.
    pub mode: BindMountMode,
}

/// An environment variable to set in the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl EnvironmentVariable {
    /// Creates a variable.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// PEM label for X.509 certificates.
pub(crate) const CERTIFICATE_PEM_LABEL: &str = "CERTIFICATE";

/// PEM label for PKCS#1 RSA private keys.
pub(crate) const RSA_PRIVATE_KEY_PEM_LABEL: &str = "RSA PRIVATE KEY";

/// PEM label for PKCS#8 private keys.
pub(crate) const PRIVATE_KEY_PEM_LABEL: &str = "PRIVATE KEY";

/// Encodes DER bytes as a PEM block with the given label.
pub(crate) fn encode_pem(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        b64.as_bytes()
            .chunks(64)
            .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_redacts_key() {
        let cred = Credential::new("cert-pem".into(), "secret-key".into());
        let debug = format!("{cred:?}");
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("cert-pem"));
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn credential_clone_is_equal() {
        let cred = Credential::new("a".into(), "b".into());
        assert_eq!(cred.clone(), cred);
    }

    #[test]
    fn default_credentials_are_empty() {
        let creds = Credentials::default();
        assert!(creds.instance_identity.cert.is_empty());
        assert!(creds.c2c.key.is_empty());
    }

    #[test]
    fn certificate_ip_prefers_internal() {
        let container = Container {
            internal_ip: "10.0.0.5".into(),
            external_ip: "192.168.1.2".into(),
            ..Container::new("guid")
        };
        assert_eq!(container.certificate_ip(), "10.0.0.5");
    }

    #[test]
    fn certificate_ip_falls_back_to_external() {
        let container = Container {
            external_ip: "192.168.1.2".into(),
            ..Container::new("guid")
        };
        assert_eq!(container.certificate_ip(), "192.168.1.2");
    }

    #[test]
    fn shared_container_reflects_updates() {
        let shared = SharedContainer::new(Container::new("guid"));
        assert!(shared.info().internal_routes.is_empty());

        shared.update(|c| c.internal_routes.push(InternalRoute::new("a.apps.internal")));
        assert_eq!(shared.info().internal_routes.len(), 1);

        shared.set(Container::new("other"));
        assert_eq!(shared.info().guid, "other");
    }

    #[test]
    fn container_deserializes_with_defaults() {
        let container: Container = serde_json::from_str(r#"{"guid":"abc"}"#).unwrap();
        assert_eq!(container, Container::new("abc"));
    }

    #[test]
    fn bind_mount_mode_serialization() {
        let json = serde_json::to_string(&BindMountMode::ReadOnly).unwrap();
        assert_eq!(json, "\"read_only\"");
    }

    #[test]
    fn pem_lines_are_wrapped_at_64() {
        let pem = encode_pem(CERTIFICATE_PEM_LABEL, &[7u8; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        for line in pem.lines() {
            assert!(line.len() <= 64);
        }
    }
}
