use crate::config::RadiusConfig;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use openssl::{hash::MessageDigest, x509::X509};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// TLS material for radiusd, as served by the API and stored in the disk cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateBundle {
    pub signature_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ca: String,
    pub certificate: String,
    #[serde(serialize_with = "expose", deserialize_with = "secret")]
    pub key: SecretString,
}

fn expose<S>(key: &SecretString, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(key.expose_secret())
}

fn secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

impl CertificateBundle {
    /// Bundle from the PEM material embedded in a configuration, dated by the
    /// certificate's not-before.
    ///
    /// # Errors
    /// Returns an error if the certificate or key is missing or the certificate
    /// cannot be parsed.
    pub fn from_config(config: &RadiusConfig) -> Result<Self> {
        if config.certificate.is_empty() {
            bail!("no certificate in radius configuration");
        }
        if config.key.expose_secret().is_empty() {
            bail!("no private key in radius configuration");
        }

        Ok(Self {
            signature_date: Some(not_before(&config.certificate)?),
            ca: config.ca.clone(),
            certificate: config.certificate.clone(),
            key: config.key.clone(),
        })
    }

    /// Check the certificate parses and fill a missing signature date.
    ///
    /// # Errors
    /// Returns an error if the certificate is not a PEM encoded X.509 certificate
    /// or the key is empty.
    pub fn validate(&mut self) -> Result<()> {
        if self.key.expose_secret().is_empty() {
            bail!("certificate bundle has no private key");
        }

        let issued = not_before(&self.certificate)?;
        if self.signature_date.is_none() {
            self.signature_date = Some(issued);
        }

        Ok(())
    }

    /// Copy of `base` using this bundle's TLS material.
    #[must_use]
    pub fn apply_to(&self, base: &RadiusConfig) -> RadiusConfig {
        RadiusConfig {
            ca: self.ca.clone(),
            certificate: self.certificate.clone(),
            key: self.key.clone(),
            ..base.clone()
        }
    }

    /// Whether `config` already runs with this material.
    #[must_use]
    pub fn is_applied_to(&self, config: &RadiusConfig) -> bool {
        self.ca == config.ca
            && self.certificate == config.certificate
            && self.key.expose_secret() == config.key.expose_secret()
    }
}

/// `notBefore` of the first certificate in `certificate`.
///
/// # Errors
/// Returns an error if the PEM or the X.509 structure cannot be decoded.
pub fn not_before(certificate: &str) -> Result<DateTime<Utc>> {
    let pem = pem::parse(certificate).context("cannot decode certificate")?;
    if pem.tag() != "CERTIFICATE" {
        bail!("expected a CERTIFICATE PEM block, got {}", pem.tag());
    }

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents())
        .map_err(|e| anyhow!("cannot parse certificate: {e}"))?;

    let timestamp = cert.validity().not_before.timestamp();

    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| anyhow!("certificate not-before out of range: {timestamp}"))
}

/// SHA-256 fingerprint of the certificate, colon separated hex.
///
/// # Errors
/// Returns an error if the certificate cannot be parsed.
pub fn fingerprint(certificate: &str) -> Result<String> {
    let digest = X509::from_pem(certificate.as_bytes())?.digest(MessageDigest::sha256())?;

    Ok(digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}
