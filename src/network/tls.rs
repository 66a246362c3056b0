//! TLS transport with certificate pinning.
//!
//! There are no CA chains here. Against an unpaired peer any certificate is
//! accepted so that pairing can capture and pin it; against a paired peer the
//! presented certificate must match the pinned copy byte for byte. Both sides
//! always present their own self-signed certificate, so the peer certificate
//! is available after every handshake.
//!
//! Direction quirk inherited from the protocol: the side that initiated the
//! TCP connection performs the TLS handshake as *server*, the accepting side
//! as *client*.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::truststore::HostIdentity;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] std::io::Error),

    #[error("Peer presented no certificate")]
    NoPeerCertificate,
}

/// Builds pinning-aware TLS configs from the host identity.
pub struct TlsStack {
    identity: HostIdentity,
}

impl TlsStack {
    pub fn new(identity: HostIdentity) -> Self {
        Self { identity }
    }

    /// TLS-upgrade as server (we initiated the TCP connection).
    pub async fn upgrade_server(
        &self,
        stream: TcpStream,
        pinned: Option<CertificateDer<'static>>,
    ) -> Result<LinkStream, TlsError> {
        let verifier = Arc::new(PinnedClientVerifier { pinned });
        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.identity.cert.clone()], self.identity.key.clone_key())?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let tls = acceptor.accept(stream).await?;
        Ok(LinkStream::ServerTls(Box::new(tls)))
    }

    /// TLS-upgrade as client (we accepted the TCP connection).
    pub async fn upgrade_client(
        &self,
        stream: TcpStream,
        pinned: Option<CertificateDer<'static>>,
    ) -> Result<LinkStream, TlsError> {
        let verifier = Arc::new(PinnedServerVerifier { pinned });
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(
                vec![self.identity.cert.clone()],
                self.identity.key.clone_key(),
            )?;
        let connector = TlsConnector::from(Arc::new(config));
        // Peers are addressed by IP; the name is never verified.
        let name = ServerName::try_from("tether.peer".to_string())
            .map_err(|_| TlsError::NoPeerCertificate)?;
        let tls = connector.connect(name, stream).await?;
        Ok(LinkStream::ClientTls(Box::new(tls)))
    }
}

fn check_pin(
    end_entity: &CertificateDer<'_>,
    pinned: &Option<CertificateDer<'static>>,
) -> Result<(), rustls::Error> {
    match pinned {
        Some(expected) if expected.as_ref() != end_entity.as_ref() => Err(
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure),
        ),
        _ => Ok(()),
    }
}

const SUPPORTED_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ED25519,
];

/// Verifies the certificate the accepting side presents to us.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: Option<CertificateDer<'static>>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        check_pin(end_entity, &self.pinned)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SCHEMES.to_vec()
    }
}

/// Verifies the certificate the connecting side presents to us.
#[derive(Debug)]
struct PinnedClientVerifier {
    pinned: Option<CertificateDer<'static>>,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        check_pin(end_entity, &self.pinned)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SCHEMES.to_vec()
    }
}

/// A control or payload stream, plain or upgraded.
pub enum LinkStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl LinkStream {
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            LinkStream::Plain(s) => s.peer_addr(),
            LinkStream::ServerTls(s) => s.get_ref().0.peer_addr(),
            LinkStream::ClientTls(s) => s.get_ref().0.peer_addr(),
        }
    }

    /// The certificate presented by the remote side, if upgraded.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let certs = match self {
            LinkStream::Plain(_) => return None,
            LinkStream::ServerTls(s) => s.get_ref().1.peer_certificates(),
            LinkStream::ClientTls(s) => s.get_ref().1.peer_certificates(),
        };
        certs.and_then(|c| c.first()).map(|c| c.clone().into_owned())
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, LinkStream::Plain(_))
    }
}

impl AsyncRead for LinkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LinkStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            LinkStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LinkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LinkStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            LinkStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LinkStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            LinkStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LinkStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LinkStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            LinkStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
