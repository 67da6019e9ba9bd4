//! Certificate factory: builds and signs per-container leaf certificates.
//!
//! Every function here is stateless. Randomness comes from the caller's
//! entropy source and signing from the shared [`CertificateAuthority`].

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rand_core::{CryptoRngCore, RngCore};
use rsa::pkcs1::EncodeRsaPrivateKey;
use sha2::{Digest, Sha256};
use tracing::{debug, debug_span};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::der::asn1::{
    BitString, GeneralizedTime, Ia5String, OctetString, UtcTime, Utf8StringRef,
};
use x509_cert::der::oid::db::{rfc4519, rfc5280::ID_KP_CLIENT_AUTH, rfc5280::ID_KP_SERVER_AUTH};
use x509_cert::der::oid::{AssociatedOid, ObjectIdentifier};
use x509_cert::der::{Any, Encode};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectAltName, SubjectKeyIdentifier,
};
use x509_cert::ext::Extension;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::{Time, Validity};

use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::types::{
    encode_pem, Container, Credential, Credentials, InternalRoute, CERTIFICATE_PEM_LABEL,
    RSA_PRIVATE_KEY_PEM_LABEL,
};

/// Size of every leaf RSA key.
pub const KEY_BITS: usize = 2048;

/// Number of random bytes in a certificate serial number.
pub const SERIAL_BYTES: usize = 16;

/// Source of randomness for key generation, serial numbers and identifiers.
pub type EntropySource = dyn CryptoRngCore + Send;

/// Identity fields for one certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateSubject {
    /// IP SAN, if any.
    pub ip_address: Option<IpAddr>,
    /// Routes whose hostnames become DNS SANs.
    pub internal_routes: Vec<InternalRoute>,
    /// Subject organizational units.
    pub organizational_units: Vec<String>,
}

impl CertificateSubject {
    /// Subject of the instance identity certificate: bound to the container IP.
    ///
    /// # Errors
    ///
    /// Returns an error if the container's address is set but not an IP.
    pub fn instance_identity(container: &Container) -> Result<Self> {
        let ip = container.certificate_ip();
        let ip_address = if ip.is_empty() {
            None
        } else {
            Some(
                ip.parse()
                    .map_err(|e| Error::San(format!("invalid IP address '{ip}': {e}")))?,
            )
        };

        Ok(Self {
            ip_address,
            internal_routes: Vec::new(),
            organizational_units: container.organizational_units.clone(),
        })
    }

    /// Subject of the container-to-container certificate: bound to internal routes.
    #[must_use]
    pub fn c2c(container: &Container) -> Self {
        Self {
            ip_address: None,
            internal_routes: container.internal_routes.clone(),
            organizational_units: container.organizational_units.clone(),
        }
    }
}

/// Half-open validity window `[not_before, not_after)`, second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityWindow {
    /// Validity start.
    pub not_before: DateTime<Utc>,
    /// Validity end.
    pub not_after: DateTime<Utc>,
}

impl ValidityWindow {
    /// Window of length `validity` starting at `start`, truncated to whole seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the end of the window is not representable.
    pub fn starting_at(start: DateTime<Utc>, validity: std::time::Duration) -> Result<Self> {
        let not_before = DateTime::from_timestamp(start.timestamp(), 0)
            .ok_or_else(|| Error::Generation("invalid validity start".into()))?;
        let not_after = chrono::Duration::from_std(validity)
            .ok()
            .and_then(|validity| not_before.checked_add_signed(validity))
            .ok_or_else(|| Error::Generation(format!("validity period {validity:?} out of range")))?;

        Ok(Self {
            not_before,
            not_after,
        })
    }
}

/// Builds the subject name: one OU attribute per unit in order, then the CN.
///
/// The CN is omitted when `identifier` is empty, which is how invalidation
/// certificates are issued.
///
/// # Errors
///
/// Returns an error if an attribute cannot be encoded.
pub fn subject_name(identifier: &str, units: &[String]) -> Result<Name> {
    let mut rdns = Vec::with_capacity(units.len() + 1);
    for unit in units {
        rdns.push(rdn(rfc4519::OU, unit)?);
    }
    if !identifier.is_empty() {
        rdns.push(rdn(rfc4519::CN, identifier)?);
    }
    Ok(RdnSequence(rdns))
}

/// Builds the SAN list: the IP first, then `identifier`, then each route.
///
/// # Errors
///
/// Returns an error if a hostname is not a valid IA5 string.
pub fn subject_alt_names(identifier: &str, subject: &CertificateSubject) -> Result<SubjectAltName> {
    let mut names = Vec::with_capacity(2 + subject.internal_routes.len());
    if let Some(ip) = subject.ip_address {
        names.push(GeneralName::from(ip));
    }
    names.push(dns_name(identifier)?);
    for route in &subject.internal_routes {
        names.push(dns_name(&route.hostname)?);
    }
    Ok(SubjectAltName(names))
}

/// Generates one signed credential.
///
/// The serial number is drawn first, then a fresh RSA key, both from
/// `entropy`. Nothing is returned unless every step succeeds.
///
/// # Errors
///
/// Returns an error if the entropy source fails, key generation fails, or
/// signing fails.
pub fn generate_credential(
    ca: &CertificateAuthority,
    entropy: &mut EntropySource,
    identifier: &str,
    subject: &CertificateSubject,
    window: &ValidityWindow,
) -> Result<Credential> {
    debug!("generating serial number");
    let mut serial = [0u8; SERIAL_BYTES];
    entropy
        .try_fill_bytes(&mut serial)
        .map_err(|e| Error::Entropy(format!("failed to generate serial number: {e}")))?;

    debug!("generating private key");
    let mut rng = &mut *entropy;
    let private_key = rsa::RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| Error::KeyGeneration(format!("failed to generate RSA key: {e}")))?;
    let public_key_info = SubjectPublicKeyInfoOwned::from_key(private_key.to_public_key())
        .map_err(|e| Error::KeyGeneration(format!("failed to encode public key: {e}")))?;

    debug!("signing certificate");
    let subject_name = subject_name(identifier, &subject.organizational_units)?;
    let extensions = leaf_extensions(
        ca,
        &subject_name,
        subject_alt_names(identifier, subject)?,
        &key_identifier(public_key_info.subject_public_key.raw_bytes()),
    )?;
    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(&serial).map_err(encoding_error)?,
        signature: ca.signature_algorithm(),
        issuer: ca.issuer_name().clone(),
        validity: Validity {
            not_before: to_x509_time(window.not_before)?,
            not_after: to_x509_time(window.not_after)?,
        },
        subject: subject_name,
        subject_public_key_info: public_key_info,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };
    let signature = ca.sign(&tbs_certificate.to_der().map_err(encoding_error)?)?;
    let cert = Certificate {
        tbs_certificate,
        signature_algorithm: ca.signature_algorithm(),
        signature: BitString::from_bytes(&signature).map_err(encoding_error)?,
    };
    let cert_der = cert.to_der().map_err(encoding_error)?;

    let key_der = private_key
        .to_pkcs1_der()
        .map_err(|e| Error::KeyGeneration(format!("failed to encode private key: {e}")))?;

    let mut chain = encode_pem(CERTIFICATE_PEM_LABEL, &cert_der);
    chain.push_str(&encode_pem(CERTIFICATE_PEM_LABEL, ca.certificate_der()));

    Ok(Credential::new(
        chain,
        encode_pem(RSA_PRIVATE_KEY_PEM_LABEL, key_der.as_bytes()),
    ))
}

/// Generates the instance identity and c2c credentials for one cycle.
///
/// # Errors
///
/// Returns the first generation error; no partial [`Credentials`] is returned.
pub fn generate_credentials(
    ca: &CertificateAuthority,
    entropy: &mut EntropySource,
    identifier: &str,
    container: &Container,
    window: &ValidityWindow,
) -> Result<Credentials> {
    let span = debug_span!("generating_credentials", identifier = %identifier);
    let _guard = span.enter();

    debug!("generating instance identity credential");
    let instance_identity = generate_credential(
        ca,
        entropy,
        identifier,
        &CertificateSubject::instance_identity(container)?,
        window,
    )?;

    debug!("generating c2c credential");
    let c2c = generate_credential(
        ca,
        entropy,
        identifier,
        &CertificateSubject::c2c(container),
        window,
    )?;

    Ok(Credentials {
        instance_identity,
        c2c,
    })
}

/// Key identifier of a public key: the leading 20 bytes of its SHA-256.
pub(crate) fn key_identifier(public_key_bits: &[u8]) -> Vec<u8> {
    Sha256::digest(public_key_bits)[..20].to_vec()
}

/// mTLS leaf extensions, critical where a Go `crypto/x509` issuer marks them.
fn leaf_extensions(
    ca: &CertificateAuthority,
    subject: &Name,
    alt_names: SubjectAltName,
    subject_key_id: &[u8],
) -> Result<Vec<Extension>> {
    let usage = KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment | KeyUsages::KeyAgreement;
    Ok(vec![
        extension(&KeyUsage(usage), true)?,
        extension(
            &ExtendedKeyUsage(vec![ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH]),
            false,
        )?,
        extension(
            &BasicConstraints {
                ca: false,
                path_len_constraint: None,
            },
            true,
        )?,
        extension(
            &SubjectKeyIdentifier(OctetString::new(subject_key_id).map_err(encoding_error)?),
            false,
        )?,
        extension(
            &AuthorityKeyIdentifier {
                key_identifier: Some(
                    OctetString::new(ca.key_identifier()).map_err(encoding_error)?,
                ),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            },
            false,
        )?,
        // RFC 5280 requires a critical SAN when the subject is empty.
        extension(&alt_names, subject.0.is_empty())?,
    ])
}

fn extension<T: AssociatedOid + Encode>(value: &T, critical: bool) -> Result<Extension> {
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(value.to_der().map_err(encoding_error)?)
            .map_err(encoding_error)?,
    })
}

fn rdn(oid: ObjectIdentifier, value: &str) -> Result<RelativeDistinguishedName> {
    let value = Utf8StringRef::new(value).map_err(encoding_error)?;
    RelativeDistinguishedName::try_from(vec![AttributeTypeAndValue {
        oid,
        value: Any::from(value),
    }])
    .map_err(encoding_error)
}

fn dns_name(name: &str) -> Result<GeneralName> {
    let ia5 = Ia5String::new(name)
        .map_err(|e| Error::San(format!("invalid DNS name '{name}': {e}")))?;
    Ok(GeneralName::DnsName(ia5))
}

/// UTCTime through 2049, GeneralizedTime after, as RFC 5280 requires.
fn to_x509_time(dt: DateTime<Utc>) -> Result<Time> {
    let since_epoch = u64::try_from(dt.timestamp())
        .map(std::time::Duration::from_secs)
        .map_err(|_| Error::Generation(format!("timestamp {dt} predates the epoch")))?;
    UtcTime::from_unix_duration(since_epoch)
        .map(Time::UtcTime)
        .or_else(|_| GeneralizedTime::from_unix_duration(since_epoch).map(Time::GeneralTime))
        .map_err(|e| Error::Generation(format!("invalid timestamp: {e}")))
}

#[allow(clippy::needless_pass_by_value)]
fn encoding_error(e: x509_cert::der::Error) -> Error {
    Error::Generation(format!("failed to encode certificate: {e}"))
}
