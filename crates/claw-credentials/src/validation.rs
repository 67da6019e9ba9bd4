//! Inspection and verification of issued credentials.
//!
//! Handlers and operators use these helpers to look inside a [`Credential`]
//! before trusting it: parse the PEM chain, check that the leaf was signed by
//! the expected CA, and check that the private key belongs to the leaf.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::EncodePublicKey;
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;
use x509_parser::prelude::*;

use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::types::{Credential, CERTIFICATE_PEM_LABEL};

/// A parsed certificate from a credential chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// DER-encoded certificate bytes.
    pub der: Vec<u8>,
    /// Subject common name.
    pub subject: String,
    /// Subject organizational units.
    pub organizational_units: Vec<String>,
    /// Issuer common name.
    pub issuer: String,
    /// Serial number, big-endian.
    pub serial: Vec<u8>,
    /// Validity start.
    pub not_before: DateTime<Utc>,
    /// Validity end.
    pub not_after: DateTime<Utc>,
    /// DNS subject alternative names, in certificate order.
    pub dns_names: Vec<String>,
    /// IP subject alternative names, in certificate order.
    pub ip_addresses: Vec<IpAddr>,
    /// Key usage flags.
    pub key_usage: KeyUsageFlags,
    /// Whether the certificate is a CA.
    pub is_ca: bool,
    /// DER-encoded SubjectPublicKeyInfo.
    pub public_key_der: Vec<u8>,
}

/// Key usages relevant to mutual TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyUsageFlags {
    /// `digitalSignature`.
    pub digital_signature: bool,
    /// `keyEncipherment`.
    pub key_encipherment: bool,
    /// `keyAgreement`.
    pub key_agreement: bool,
    /// Extended usage `serverAuth`.
    pub server_auth: bool,
    /// Extended usage `clientAuth`.
    pub client_auth: bool,
}

impl IssuedCertificate {
    /// Parses a certificate from DER-encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Parse(format!("failed to parse certificate: {e}")))?;

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| Error::Parse("invalid not_before timestamp".into()))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::Parse("invalid not_after timestamp".into()))?;

        let organizational_units = cert
            .subject()
            .iter_organizational_unit()
            .map(|attr| {
                attr.as_str()
                    .map(String::from)
                    .map_err(|e| Error::Parse(format!("failed to parse OU: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let (dns_names, ip_addresses) = extract_san(&cert);

        Ok(Self {
            der: der.to_vec(),
            subject: find_common_name(cert.subject())?.unwrap_or_default(),
            organizational_units,
            issuer: extract_common_name(cert.issuer())?,
            serial: cert.raw_serial().to_vec(),
            not_before,
            not_after,
            dns_names,
            ip_addresses,
            key_usage: extract_key_usage(&cert),
            is_ca: cert.is_ca(),
            public_key_der: cert.public_key().raw.to_vec(),
        })
    }
}

/// Parses every certificate in a PEM buffer, in order.
///
/// # Errors
///
/// Returns an error if the buffer is not valid PEM, contains a block that is
/// not a certificate, or contains no certificate at all.
pub fn parse_chain(pem: &str) -> Result<Vec<IssuedCertificate>> {
    let mut chain = Vec::new();
    for block in Pem::iter_from_buffer(pem.as_bytes()) {
        let block = block.map_err(|e| Error::Parse(format!("invalid PEM: {e}")))?;
        if block.label != CERTIFICATE_PEM_LABEL {
            return Err(Error::Parse(format!("unexpected PEM block: {}", block.label)));
        }
        chain.push(IssuedCertificate::from_der(&block.contents)?);
    }

    if chain.is_empty() {
        return Err(Error::Parse("no certificate found".into()));
    }
    Ok(chain)
}

/// Verifies a credential against the CA that should have issued it.
///
/// Checks that the chain is exactly leaf then CA, that the appended CA is
/// `ca`, that the leaf signature verifies with the CA key, and that the
/// private key belongs to the leaf. Returns the parsed chain.
///
/// # Errors
///
/// Returns an error describing the first failed check.
pub fn verify_credential(
    credential: &Credential,
    ca: &CertificateAuthority,
) -> Result<Vec<IssuedCertificate>> {
    let chain = parse_chain(&credential.cert)?;
    let [leaf, appended_ca] = chain.as_slice() else {
        return Err(Error::Validation(format!(
            "expected leaf and CA certificate, found {} certificates",
            chain.len()
        )));
    };

    if appended_ca.der != ca.certificate_der() {
        return Err(Error::Validation(
            "appended CA certificate does not match the issuing CA".into(),
        ));
    }
    if leaf.issuer != ca.subject() {
        return Err(Error::Validation(format!(
            "issuer '{}' does not match CA subject '{}'",
            leaf.issuer,
            ca.subject()
        )));
    }

    verify_signature(&leaf.der, ca.certificate_der())?;

    if private_key_spki(credential)? != leaf.public_key_der {
        return Err(Error::Validation(
            "private key does not match leaf certificate".into(),
        ));
    }

    debug!(subject = %leaf.subject, "credential verified");
    Ok(chain)
}

/// Returns the SubjectPublicKeyInfo DER of the credential's private key.
fn private_key_spki(credential: &Credential) -> Result<Vec<u8>> {
    let key = rsa::RsaPrivateKey::from_pkcs1_pem(&credential.key)
        .map_err(|e| Error::Parse(format!("failed to parse private key: {e}")))?;
    let spki = key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| Error::Parse(format!("failed to encode public key: {e}")))?;
    Ok(spki.as_bytes().to_vec())
}

/// Verifies that `cert_der` was signed by the key of `issuer_der`.
fn verify_signature(cert_der: &[u8], issuer_der: &[u8]) -> Result<()> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::Parse(format!("failed to parse certificate: {e}")))?;
    let (_, issuer) = X509Certificate::from_der(issuer_der)
        .map_err(|e| Error::Parse(format!("failed to parse issuer certificate: {e}")))?;

    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|e| Error::Validation(format!("signature verification failed: {e:?}")))
}

/// Extracts the common name from an X.509 name.
pub(crate) fn extract_common_name(name: &X509Name) -> Result<String> {
    find_common_name(name)?.ok_or_else(|| Error::Parse("common name not found".into()))
}

/// Returns the common name, or `None` when the name carries no CN.
///
/// Invalidation certificates are issued without one.
fn find_common_name(name: &X509Name) -> Result<Option<String>> {
    name.iter_common_name()
        .next()
        .map(|attr| {
            attr.as_str()
                .map(String::from)
                .map_err(|e| Error::Parse(format!("failed to parse CN: {e}")))
        })
        .transpose()
}

/// Extracts DNS and IP SANs from a certificate.
fn extract_san(cert: &X509Certificate) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            match name {
                GeneralName::DNSName(dns) => dns_names.push((*dns).to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = parse_ip_bytes(bytes) {
                        ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    (dns_names, ip_addresses)
}

fn extract_key_usage(cert: &X509Certificate) -> KeyUsageFlags {
    let mut flags = KeyUsageFlags::default();
    if let Ok(Some(ku)) = cert.key_usage() {
        flags.digital_signature = ku.value.digital_signature();
        flags.key_encipherment = ku.value.key_encipherment();
        flags.key_agreement = ku.value.key_agreement();
    }
    if let Ok(Some(eku)) = cert.extended_key_usage() {
        flags.server_auth = eku.value.server_auth;
        flags.client_auth = eku.value.client_auth;
    }
    flags
}

/// Parses IP address bytes into an `IpAddr`.
fn parse_ip_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}
