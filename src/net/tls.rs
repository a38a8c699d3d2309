//! TLS configuration and certificate loading.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;

/// ALPN protocols offered on TLS sockets.
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Errors raised while turning PEM material into rustls types.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("malformed PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("certificate PEM contains no certificates")]
    NoCertificate,

    #[error("key PEM contains no private key")]
    NoPrivateKey,

    #[error("unsupported private key: {0}")]
    Key(rustls::Error),

    #[error("private key does not match the certificate: {0}")]
    KeyMismatch(rustls::Error),

    #[error("invalid TLS configuration: {0}")]
    Config(rustls::Error),
}

/// The crypto provider used by every TLS socket.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Parse a PEM certificate chain and private key into a servable key pair.
pub fn load_key_pair(cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>, TlsError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes()).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?.ok_or(TlsError::NoPrivateKey)?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key).map_err(TlsError::Key)?;

    let pair = CertifiedKey::new(certs, signing_key);
    pair.keys_match().map_err(TlsError::KeyMismatch)?;
    Ok(Arc::new(pair))
}

/// Build a server config whose certificate is chosen per handshake.
pub fn server_config(
    resolver: Arc<dyn ResolvesServerCert>,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>, TlsError> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(TlsError::Config)?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Resolver that always presents the same key pair.
#[derive(Debug)]
pub struct FixedCertResolver(pub Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}
