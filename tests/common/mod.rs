//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use listen_controller::acme::{AcmeError, AcmePolicy, CertificateIssuer, ChallengeManager, StoredCertificate};
use listen_controller::controller::{AcmeSettings, ListenerManager, ListenerSettings};
use listen_controller::http::{HandlerSlot, SocketRole};
use listen_controller::net::tls::crypto_provider;

/// Self-signed certificate and key PEM for `names`.
pub fn self_signed(names: &[&str]) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let mut params =
        CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
    params.distinguished_name.push(DnType::CommonName, names[0]);
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// DER of the first certificate in a PEM chain.
pub fn leaf_der(chain_pem: &str) -> CertificateDer<'static> {
    rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .next()
        .unwrap()
        .unwrap()
}

/// Issuer that hands out self-signed certificates and counts calls.
#[derive(Default)]
pub struct FakeIssuer {
    pub calls: AtomicUsize,
}

impl FakeIssuer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn issue(
        &self,
        domain: &str,
        _challenges: &ChallengeManager,
        _policy: &dyn AcmePolicy,
    ) -> Result<StoredCertificate, AcmeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (chain_pem, key_pem) = self_signed(&[domain]);
        Ok(StoredCertificate { chain_pem, key_pem })
    }
}

pub struct Harness {
    pub listeners: Arc<ListenerManager>,
    pub handler: HandlerSlot,
    pub issuer: Arc<FakeIssuer>,
    _cache: tempfile::TempDir,
}

impl Harness {
    /// A listener manager on ephemeral loopback ports.
    pub fn new() -> Self {
        let cache = tempfile::tempdir().unwrap();
        let handler = HandlerSlot::new();
        let issuer = Arc::new(FakeIssuer::default());
        let listeners = Arc::new(ListenerManager::new(
            ListenerSettings {
                http_address: "127.0.0.1:0".into(),
                https_address: "127.0.0.1:0".into(),
                max_connections: 64,
                drain_timeout: Duration::from_millis(500),
            },
            handler.clone(),
            AcmeSettings {
                issuer: issuer.clone(),
                cache_dir: cache.path().to_path_buf(),
                renew_before: chrono::Duration::days(30),
            },
        ));
        Self {
            listeners,
            handler,
            issuer,
            _cache: cache,
        }
    }

    pub async fn addr(&self, role: SocketRole) -> SocketAddr {
        self.listeners
            .local_addrs()
            .await
            .into_iter()
            .find(|(r, _)| *r == role)
            .map(|(_, addr)| addr)
            .unwrap_or_else(|| panic!("no {} socket", role))
    }

    pub async fn roles(&self) -> Vec<SocketRole> {
        self.listeners
            .local_addrs()
            .await
            .into_iter()
            .map(|(role, _)| role)
            .collect()
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

async fn send<IO>(io: IO, method: Method, host: &str, path: &str) -> Reply
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, host)
        .body(Body::empty())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = to_bytes(Body::new(body), 1 << 20).await.unwrap();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

/// Plain HTTP request.
pub async fn http_request(addr: SocketAddr, method: Method, host: &str, path: &str) -> Reply {
    let stream = TcpStream::connect(addr).await.unwrap();
    send(stream, method, host, path).await
}

/// TLS request with `server_name` as SNI. Returns the reply and the
/// certificate chain the server presented, or the handshake error.
pub async fn https_get(
    addr: SocketAddr,
    server_name: &str,
    path: &str,
) -> std::io::Result<(Reply, Vec<CertificateDer<'static>>)> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    let tls = connector.connect(name, stream).await?;
    let presented = tls
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.to_vec())
        .unwrap_or_default();

    Ok((send(tls, Method::GET, server_name, path).await, presented))
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &crypto_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &crypto_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        crypto_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
