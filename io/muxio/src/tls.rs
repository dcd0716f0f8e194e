//! TLS session glue over rustls.
//!
//! A [`TlsSession`] sits between the socket and a connection's buffers:
//! ciphertext read from the socket is fed in, decrypted plaintext is drained
//! into the receive buffer, and plaintext writes come back out as ciphertext
//! staged for the socket. Handshake progress is driven by the same feed and
//! flush calls; completion is observable through [`TlsSession::is_handshaking`].

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::buffer::IoBuf;
use crate::error::Error;

/// TLS configuration paths for [`Manager::set_tls`].
///
/// For a listener, `cert` names a PEM file holding the certificate chain and
/// the private key concatenated. For a client connection, `ca` optionally
/// names a PEM bundle of trust anchors (the webpki root set is used
/// otherwise) and `server_name` overrides the SNI name taken from the
/// connect host.
///
/// [`Manager::set_tls`]: crate::Manager::set_tls
#[derive(Debug, Default)]
pub struct TlsSettings {
    pub cert: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub server_name: Option<String>,
}

/// One TLS session and its ciphertext staging buffers.
pub(crate) struct TlsSession {
    conn: rustls::Connection,
    /// Ciphertext from the socket not yet consumed by rustls.
    incoming: BytesMut,
    /// Ciphertext produced by rustls awaiting the socket.
    outgoing: BytesMut,
    outgoing_pos: usize,
    peer_closed: bool,
}

impl TlsSession {
    pub fn new_client(
        config: Arc<rustls::ClientConfig>,
        name: rustls::pki_types::ServerName<'static>,
    ) -> Result<Self, Error> {
        let conn = rustls::ClientConnection::new(config, name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        let mut session = Self::wrap(rustls::Connection::Client(conn));
        // Stage the initial client hello.
        session.flush_output();
        Ok(session)
    }

    pub fn new_server(config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let conn =
            rustls::ServerConnection::new(config).map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self::wrap(rustls::Connection::Server(conn)))
    }

    fn wrap(conn: rustls::Connection) -> Self {
        TlsSession {
            conn,
            incoming: BytesMut::with_capacity(16384),
            outgoing: BytesMut::with_capacity(16384),
            outgoing_pos: 0,
            peer_closed: false,
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Whether ciphertext is staged (or pending inside rustls) for the wire.
    pub fn wants_write(&self) -> bool {
        self.outgoing_pos < self.outgoing.len() || self.conn.wants_write()
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Feed ciphertext read from the socket and process it.
    pub fn feed(&mut self, data: &[u8]) -> io::Result<()> {
        self.incoming.extend_from_slice(data);
        self.process()
    }

    fn process(&mut self) -> io::Result<()> {
        while !self.incoming.is_empty() {
            let mut cursor = io::Cursor::new(&self.incoming[..]);
            match self.conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(n) => self.incoming.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(io::Error::other)?;
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
        }
        self.flush_output();
        Ok(())
    }

    /// Move pending rustls output into the staging buffer.
    fn flush_output(&mut self) {
        while self.conn.wants_write() {
            let mut buf = Vec::with_capacity(4096);
            match self.conn.write_tls(&mut buf) {
                Ok(0) => break,
                Ok(_) => self.outgoing.extend_from_slice(&buf),
                Err(_) => break,
            }
        }
    }

    /// Drain decrypted plaintext into the receive buffer; returns the byte
    /// count appended.
    pub fn read_plaintext(&mut self, out: &mut IoBuf) -> io::Result<usize> {
        let mut total = 0;
        let mut scratch = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut scratch) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    out.append(&scratch[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Encrypt application bytes; returns how many were consumed.
    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(data)?;
        self.flush_output();
        Ok(n)
    }

    /// Ciphertext staged for the socket.
    pub fn pending_output(&self) -> &[u8] {
        &self.outgoing[self.outgoing_pos..]
    }

    /// Mark staged ciphertext as written to the socket.
    pub fn advance_output(&mut self, n: usize) {
        self.outgoing_pos += n;
        if self.outgoing_pos >= self.outgoing.len() {
            self.outgoing.clear();
            self.outgoing_pos = 0;
        }
    }

    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
        self.flush_output();
    }
}

/// Load a server configuration from a PEM file carrying the certificate
/// chain and private key concatenated.
pub(crate) fn load_server_config(path: &Path) -> Result<Arc<rustls::ServerConfig>, Error> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Tls(format!("reading {}: {e}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parsing certificates: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    let key = PrivateKeyDer::from_pem_file(path)
        .map_err(|e| Error::Tls(format!("parsing private key: {e}")))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Load a client configuration, trusting either the given CA bundle or the
/// webpki root set.
pub(crate) fn load_client_config(ca: Option<&Path>) -> Result<Arc<rustls::ClientConfig>, Error> {
    let mut roots = rustls::RootCertStore::empty();
    match ca {
        Some(path) => {
            let certs = CertificateDer::pem_file_iter(path)
                .map_err(|e| Error::Tls(format!("reading {}: {e}", path.display())))?;
            for cert in certs {
                let cert = cert.map_err(|e| Error::Tls(format!("parsing CA cert: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("adding CA cert: {e}")))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
