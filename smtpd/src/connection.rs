//! The transport wrapper: buffered reads over a plain or TLS-upgraded
//! stream, and the in-place STARTTLS upgrade.

use std::fmt::Write as _;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ProtocolVersion, ServerConfig, ServerConnection, SupportedCipherSuite};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::error::{ConnectionResult, TlsError, TlsResult};

const READ_BUFFER_SIZE: usize = 8192;

/// Filesystem paths to a TLS certificate/key pair; `STARTTLS` is only
/// advertised and accepted when this is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Negotiated protocol/cipher, surfaced to logging and to `mailFrom`/
/// `rcptTo`/`data` callbacks that want to condition on transport security.
#[derive(Debug)]
pub struct TlsInfo {
    version: ProtocolVersion,
    ciphers: SupportedCipherSuite,
}

impl TlsInfo {
    fn of(conn: &ServerConnection) -> TlsResult<Self> {
        Ok(Self {
            version: conn
                .protocol_version()
                .ok_or_else(|| TlsError::Rustls("protocol version unavailable".into()))?,
            ciphers: conn
                .negotiated_cipher_suite()
                .ok_or_else(|| TlsError::Rustls("cipher suite unavailable".into()))?,
        })
    }

    #[must_use]
    pub fn protocol(&self) -> &'static str {
        self.version.as_str().unwrap_or("unknown")
    }

    #[must_use]
    pub fn cipher(&self) -> &'static str {
        self.ciphers.suite().as_str().unwrap_or("unknown")
    }
}

struct ReadBuf {
    buf: Vec<u8>,
    pos: usize,
    len: usize,
}

impl Default for ReadBuf {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            len: 0,
        }
    }
}

impl ReadBuf {
    fn take_buffered(&mut self, out: &mut [u8]) -> Option<usize> {
        if self.pos >= self.len {
            return None;
        }
        let available = self.len - self.pos;
        let to_copy = available.min(out.len());
        out[..to_copy].copy_from_slice(&self.buf[self.pos..self.pos + to_copy]);
        self.pos += to_copy;
        Some(to_copy)
    }

    fn refill_target(&mut self) -> &mut [u8] {
        if self.buf.is_empty() {
            self.buf.resize(READ_BUFFER_SIZE, 0);
        }
        &mut self.buf
    }

    fn set_filled(&mut self, len: usize) {
        self.pos = 0;
        self.len = len;
    }
}

/// The per-connection transport: plain TCP until (and unless) the client
/// issues `STARTTLS`, at which point [`Connection::upgrade`] swaps the
/// inner stream in place.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain { stream: Stream, read: ReadBuf },
    Tls { stream: Box<TlsStream<Stream>>, read: ReadBuf },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    #[must_use]
    pub fn plain(stream: Stream) -> Self {
        Self::Plain {
            stream,
            read: ReadBuf::default(),
        }
    }

    /// Wraps an already-established TLS stream, for implicit-TLS listeners
    /// that complete the handshake before a session exists at all, as
    /// opposed to the in-conversation `STARTTLS` upgrade.
    #[must_use]
    pub fn tls(stream: TlsStream<Stream>) -> Self {
        Self::Tls {
            stream: Box::new(stream),
            read: ReadBuf::default(),
        }
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    /// Writes a single reply line (or multi-line block) followed by
    /// CRLF. Uses a stack-allocated buffer for the common case, falling
    /// back to a heap-allocated one for longer lines.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn send(&mut self, line: &str) -> ConnectionResult<usize> {
        let mut buffer = arrayvec::ArrayString::<512>::new();
        let written = if write!(&mut buffer, "{line}\r\n").is_ok() {
            match self {
                Self::Plain { stream, .. } => stream.write_all(buffer.as_bytes()).await,
                Self::Tls { stream, .. } => stream.write_all(buffer.as_bytes()).await,
            }?;
            buffer.len()
        } else {
            let mut owned = line.to_string();
            owned.push_str("\r\n");
            match self {
                Self::Plain { stream, .. } => stream.write_all(owned.as_bytes()).await,
                Self::Tls { stream, .. } => stream.write_all(owned.as_bytes()).await,
            }?;
            owned.len()
        };
        Ok(written)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn receive(&mut self, out: &mut [u8]) -> ConnectionResult<usize> {
        match self {
            Self::Plain { stream, read } => {
                if let Some(n) = read.take_buffered(out) {
                    return Ok(n);
                }
                let bytes_read = stream.read(read.refill_target()).await?;
                read.set_filled(bytes_read);
                Ok(read.take_buffered(out).unwrap_or(0))
            }
            Self::Tls { stream, read } => {
                if let Some(n) = read.take_buffered(out) {
                    return Ok(n);
                }
                let bytes_read = stream.read(read.refill_target()).await?;
                read.set_filled(bytes_read);
                Ok(read.take_buffered(out).unwrap_or(0))
            }
        }
    }

    /// Builds a reusable [`TlsAcceptor`] from a certificate/key pair.
    /// Exposed so a listener that terminates TLS implicitly on accept
    /// can build one acceptor per listener instead
    /// of reloading the certificate on every connection, the way
    /// [`Connection::upgrade`] does for the much rarer `STARTTLS` path.
    pub fn build_acceptor(tls_context: &TlsContext) -> TlsResult<TlsAcceptor> {
        let certs = Self::load_certs(&tls_context.certificate).map_err(|e| TlsError::CertificateLoad {
            path: tls_context.certificate.display().to_string(),
            source: e,
        })?;
        let keys = Self::load_keys(&tls_context.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, keys)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    fn load_certs<P: AsRef<Path>>(path: &P) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_keys<P: AsRef<Path>>(path: &P) -> TlsResult<PrivateKeyDer<'static>> {
        let path_str = path.as_ref().display().to_string();
        let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path_str,
                reason: "unrecognized key format (expected PKCS1, PKCS8, or SEC1)".to_string(),
            }),
        }
    }

    /// Swaps the plaintext stream for a TLS-wrapped one in place. The
    /// caller is responsible for resetting all EHLO-derived session state
    /// afterward.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn upgrade(self, tls_context: &TlsContext) -> TlsResult<(Self, TlsInfo)> {
        let acceptor = Self::build_acceptor(tls_context)?;

        match self {
            Self::Plain { stream, .. } => {
                let stream = acceptor.accept(stream).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;
                Ok((
                    Self::Tls {
                        stream: Box::new(stream),
                        read: ReadBuf::default(),
                    },
                    info,
                ))
            }
            Self::Tls { stream, .. } => {
                let (inner, _) = stream.into_inner();
                let stream = acceptor.accept(inner).await?;
                let info = TlsInfo::of(stream.get_ref().1)?;
                Ok((
                    Self::Tls {
                        stream: Box::new(stream),
                        read: ReadBuf::default(),
                    },
                    info,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_formats_with_crlf() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::plain(server);
        conn.send("220 hello").await.unwrap();
        drop(conn);

        let mut buf = Vec::new();
        let mut client = client;
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"220 hello\r\n");
    }

    #[tokio::test]
    async fn receive_reads_bytes_written_by_peer() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"EHLO foo\r\n").await.unwrap();
        let mut conn = Connection::plain(server);
        let mut out = [0u8; 64];
        let n = conn.receive(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"EHLO foo\r\n");
    }

    #[tokio::test]
    async fn receive_serves_buffered_bytes_before_next_syscall() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"0123456789").await.unwrap();
        let mut conn = Connection::plain(server);
        let mut small = [0u8; 4];
        let n = conn.receive(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"0123");
        let mut rest = [0u8; 16];
        let n = conn.receive(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"456789");
    }

    #[tokio::test]
    async fn plain_connection_is_not_secure() {
        let (_client, server) = tokio::io::duplex(64);
        let conn = Connection::plain(server);
        assert!(!conn.is_secure());
    }
}
