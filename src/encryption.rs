//! Encryption for incoming traffic, implemented through streams.
//!
//! [`Encryption`] wraps a TCP stream with or without TLS and implements
//! both [`AsyncRead`] and [`AsyncWrite`], so the HTTP layer reads one type
//! regardless of transport. TLS acceptance is [`tokio_rustls`];
//! [`server_config`] assembles the [`rustls::ServerConfig`] from PEM
//! material, with an optional client CA bundle for client-certificate
//! validation.

use crate::host::TlsMaterial;
use crate::prelude::*;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::ReadBuf;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// An accepted client stream.
#[derive(Debug)]
pub enum Encryption {
    /// A TLS encrypted TCP stream.
    TcpTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// An unencrypted TCP stream for non-secure HTTP.
    Tcp(TcpStream),
}

impl Encryption {
    /// Wraps `stream`, running the TLS handshake when `acceptor` is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    pub async fn new_tcp(stream: TcpStream, acceptor: Option<&TlsAcceptor>) -> io::Result<Self> {
        match acceptor {
            None => Ok(Self::Tcp(stream)),
            Some(acceptor) => Ok(Self::TcpTls(Box::new(acceptor.accept(stream).await?))),
        }
    }

    /// Whether the stream is TLS protected.
    #[inline]
    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::TcpTls(_))
    }
}

impl AsyncRead for Encryption {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::TcpTls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Encryption {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::TcpTls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::TcpTls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::TcpTls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An error assembling the TLS configuration.
#[derive(Debug)]
pub enum TlsError {
    /// An error occurred while reading the material from the filesystem.
    Io(io::Error),
    /// The certificate file held no certificates.
    NoCertificate,
    /// The key file held no usable private key.
    NoPrivateKey,
    /// The client CA bundle could not be used for verification.
    InvalidClientCa(String),
    /// The material was rejected, commonly a key not matching the chain.
    Rejected(rustls::Error),
}

impl From<io::Error> for TlsError {
    #[inline]
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl Display for TlsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::NoCertificate => f.write_str("no certificate found"),
            Self::NoPrivateKey => f.write_str("no private key found"),
            Self::InvalidClientCa(err) => write!(f, "client CA bundle rejected: {err}"),
            Self::Rejected(err) => write!(f, "material rejected: {err}"),
        }
    }
}

impl std::error::Error for TlsError {}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Io)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(TlsError::Io)?
        .ok_or(TlsError::NoPrivateKey)
}

/// Builds a [`rustls::ServerConfig`] from `material`.
///
/// # Errors
///
/// Any [`TlsError`]; the caller logs the diagnostic and leaves the HTTPS
/// endpoints unbound.
pub fn server_config(material: &TlsMaterial) -> Result<rustls::ServerConfig, TlsError> {
    let certificates = read_certificates(&material.certificate)?;
    if certificates.is_empty() {
        return Err(TlsError::NoCertificate);
    }
    let key = read_private_key(&material.private_key)?;

    let builder = match &material.client_ca {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for certificate in read_certificates(ca_path)? {
                roots
                    .add(certificate)
                    .map_err(|err| TlsError::InvalidClientCa(err.to_string()))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|err| TlsError::InvalidClientCa(err.to_string()))?;
            rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => rustls::ServerConfig::builder().with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certificates, key)
        .map_err(TlsError::Rejected)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_files_are_io_errors() {
        let material = TlsMaterial::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(server_config(&material), Err(TlsError::Io(_))));
    }

    #[test]
    fn empty_pem_is_incomplete_material() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, b"").unwrap();
        std::fs::write(&key, b"").unwrap();
        let material = TlsMaterial::new(&cert, &key);
        assert!(matches!(
            server_config(&material),
            Err(TlsError::NoCertificate)
        ));
    }
}
