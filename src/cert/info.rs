//! Certificate metadata extraction.
//!
//! Turns PEM material into the descriptive record persisted next to a
//! listen configuration (fingerprint, subject, validity window, key size).

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::objects::{oid2sn, oid_registry};
use x509_parser::parse_x509_certificate;
use x509_parser::public_key::PublicKey;

/// Errors raised while reading certificate material.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("no certificate found in PEM input")]
    NoCertificate,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("malformed PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("invalid X.509 certificate: {0}")]
    Parse(String),
}

/// Descriptive metadata for the leaf certificate of a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CertificateInfo {
    pub fingerprint: String,
    pub common_name: String,
    pub version: u32,
    pub expires_at: String,
    pub issuer: String,
    pub issued_at: String,
    pub algorithm: String,
    pub serial_number: String,
    pub key_size: u32,
    pub subject_alternative_names: Vec<String>,
}

/// Extracts [`CertificateInfo`] from certificate and key material.
pub trait CertificateInspector: Send + Sync {
    /// `chain_pem` holds the leaf first, optionally followed by CA certificates.
    fn inspect(&self, chain_pem: &str, key_pem: &str) -> Result<CertificateInfo, CertError>;
}

/// Default inspector backed by `x509-parser`.
#[derive(Debug, Clone, Copy, Default)]
pub struct X509Inspector;

impl CertificateInspector for X509Inspector {
    fn inspect(&self, chain_pem: &str, key_pem: &str) -> Result<CertificateInfo, CertError> {
        rustls_pemfile::private_key(&mut key_pem.as_bytes())?.ok_or(CertError::NoPrivateKey)?;

        let leaf = leaf_certificate(chain_pem)?;
        let (_, cert) =
            parse_x509_certificate(leaf.as_ref()).map_err(|e| CertError::Parse(e.to_string()))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let issuer = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| cert.issuer().to_string());

        let algorithm_oid = &cert.signature_algorithm.algorithm;
        let algorithm = oid2sn(algorithm_oid, oid_registry())
            .map(|name| name.to_string())
            .unwrap_or_else(|_| algorithm_oid.to_id_string());

        let key_size = match cert.public_key().parsed() {
            Ok(PublicKey::RSA(rsa)) => rsa.key_size() as u32,
            Ok(PublicKey::EC(point)) => point.key_size() as u32,
            _ => (cert.public_key().subject_public_key.data.len() * 8) as u32,
        };

        let mut subject_alternative_names = Vec::new();
        let san = cert
            .subject_alternative_name()
            .map_err(|e| CertError::Parse(e.to_string()))?;
        if let Some(san) = san {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => subject_alternative_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_octets(bytes) {
                            subject_alternative_names.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(CertificateInfo {
            fingerprint: fingerprint(leaf.as_ref()),
            common_name,
            version: cert.version().0 + 1,
            expires_at: rfc3339(cert.validity().not_after.timestamp()),
            issuer,
            issued_at: rfc3339(cert.validity().not_before.timestamp()),
            algorithm,
            serial_number: cert.tbs_certificate.serial.to_string(),
            key_size,
            subject_alternative_names,
        })
    }
}

/// Expiry of the leaf certificate in a PEM chain.
pub fn not_after(chain_pem: &str) -> Result<DateTime<Utc>, CertError> {
    let leaf = leaf_certificate(chain_pem)?;
    let (_, cert) =
        parse_x509_certificate(leaf.as_ref()).map_err(|e| CertError::Parse(e.to_string()))?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| CertError::Parse("expiry out of range".into()))
}

fn leaf_certificate(chain_pem: &str) -> Result<CertificateDer<'static>, CertError> {
    rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .next()
        .ok_or(CertError::NoCertificate)?
        .map_err(CertError::Pem)
}

fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn rfc3339(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

fn ip_from_octets(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use rcgen::{CertificateParams, DnType, KeyPair};

    /// Self-signed certificate for `names`, returned as (cert PEM, key PEM).
    pub fn self_signed(names: &[&str]) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.distinguished_name.push(DnType::CommonName, names[0]);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::self_signed;
    use super::*;

    #[test]
    fn inspects_self_signed_certificate() {
        let (cert, key) = self_signed(&["example.com", "www.example.com"]);
        let chain = format!("{}\n{}", cert, cert);

        let info = X509Inspector.inspect(&chain, &key).unwrap();
        assert_eq!(info.common_name, "example.com");
        assert_eq!(info.issuer, "example.com");
        assert_eq!(info.version, 3);
        assert!(!info.serial_number.is_empty());
        assert!(info.key_size > 0);
        assert!(!info.algorithm.is_empty());
        assert_eq!(
            info.subject_alternative_names,
            vec!["example.com".to_string(), "www.example.com".to_string()]
        );
        // 32 bytes rendered as XX joined by colons
        assert_eq!(info.fingerprint.len(), 32 * 3 - 1);
        assert!(DateTime::parse_from_rfc3339(&info.expires_at).is_ok());
    }

    #[test]
    fn distinct_certificates_have_distinct_serials() {
        let (cert_a, key_a) = self_signed(&["a.example.com"]);
        let (cert_b, key_b) = self_signed(&["b.example.com"]);
        let a = X509Inspector.inspect(&cert_a, &key_a).unwrap();
        let b = X509Inspector.inspect(&cert_b, &key_b).unwrap();
        assert_ne!(a.serial_number, b.serial_number);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn missing_key_is_an_error() {
        let (cert, _) = self_signed(&["example.com"]);
        assert!(matches!(
            X509Inspector.inspect(&cert, "not a key"),
            Err(CertError::NoPrivateKey)
        ));
    }

    #[test]
    fn missing_certificate_is_an_error() {
        let (_, key) = self_signed(&["example.com"]);
        assert!(matches!(
            X509Inspector.inspect("garbage", &key),
            Err(CertError::NoCertificate)
        ));
    }

    #[test]
    fn expiry_is_in_the_future_for_fresh_certificates() {
        let (cert, _) = self_signed(&["example.com"]);
        assert!(not_after(&cert).unwrap() > Utc::now());
    }
}
