//! TLS decorator.
//!
//! [`TlsConnection`] wraps a [`TcpConnection`] and sits between its raw bytes
//! and the upper handler. Ciphertext from the socket is buffered, fed to a
//! rustls session, and whatever plaintext falls out is passed up. Writes go the
//! other way: plaintext in, records out through the inner connection.
//!
//! ```text
//!   socket ──► TcpConnection ──► TlsInbound ──► ciphertext buffer
//!                                                  │ read_tls / process_new_packets
//!                                                  ▼
//!   upper handler ◄──────────────────────────── plaintext
//! ```

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::{Arc, Weak};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use tracing::{debug, warn};

use crate::net::{
    CloseHandler, ConnectionHandler, ConnectionId, TcpConnection, WriteCompletion,
};

/// Certificate chain and private key used to terminate TLS.
///
/// Where the credentials come from is the caller's business; this only wraps
/// the resulting rustls configuration.
#[derive(Clone)]
pub struct ServerIdentity {
    config: Arc<ServerConfig>,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity").finish_non_exhaustive()
    }
}

impl ServerIdentity {
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .context("TLS certificate and key do not form a usable identity")?;

        Ok(Self::from_config(Arc::new(config)))
    }

    /// Loads a PEM certificate chain and PEM private key.
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let mut cert_reader = BufReader::new(
            File::open(cert_path)
                .with_context(|| format!("opening certificate {}", cert_path.display()))?,
        );
        let chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("parsing certificate {}", cert_path.display()))?;

        if chain.is_empty() {
            anyhow::bail!("no certificates found in {}", cert_path.display());
        }

        let mut key_reader = BufReader::new(
            File::open(key_path).with_context(|| format!("opening key {}", key_path.display()))?,
        );
        let key = rustls_pemfile::private_key(&mut key_reader)
            .with_context(|| format!("parsing key {}", key_path.display()))?
            .with_context(|| format!("no private key found in {}", key_path.display()))?;

        Self::from_der(chain, key)
    }

    fn new_session(&self) -> Result<ServerConnection, rustls::Error> {
        let mut session = ServerConnection::new(Arc::clone(&self.config))?;
        // write() pushes everything through in one go
        session.set_buffer_limit(None);
        Ok(session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPhase {
    AwaitingHandshake,
    Established,
}

struct TlsSession {
    tls: ServerConnection,
    ciphertext: BytesMut,
    phase: TlsPhase,
}

/// Serves ciphertext to rustls out of the receive buffer, shrinking it.
struct CiphertextReader<'a>(&'a mut BytesMut);

impl Read for CiphertextReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.0.len());
        buf[..n].copy_from_slice(&self.0.split_to(n));
        Ok(n)
    }
}

/// Forwards ciphertext produced by rustls to the inner connection.
struct CiphertextWriter<'a> {
    conn: &'a TcpConnection,
    last: Option<WriteCompletion>,
}

impl Write for CiphertextWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.conn.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.last = Some(self.conn.write(Bytes::copy_from_slice(buf)));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Progress {
    plaintext: Vec<u8>,
    peer_closed: bool,
}

/// TLS-terminating connection with the same contract as [`TcpConnection`].
pub struct TlsConnection {
    inner: Arc<TcpConnection>,
    session: Mutex<TlsSession>,
    upper: RwLock<Option<Arc<dyn ConnectionHandler>>>,
}

/// Installed as the inner connection's handler. Weak so the inner connection
/// does not keep the decorator alive.
struct TlsInbound(Weak<TlsConnection>);

impl ConnectionHandler for TlsInbound {
    fn on_data(&self, data: &[u8]) {
        if let Some(tls) = self.0.upgrade() {
            tls.receive(data);
        }
    }

    fn on_close(&self) {
        if let Some(tls) = self.0.upgrade() {
            if let Some(upper) = tls.upper.write().take() {
                upper.on_close();
            }
        }
    }
}

impl TlsConnection {
    pub fn new(inner: Arc<TcpConnection>, identity: &ServerIdentity) -> anyhow::Result<Arc<Self>> {
        let tls = identity
            .new_session()
            .context("creating TLS session")?;

        let conn = Arc::new(Self {
            inner: Arc::clone(&inner),
            session: Mutex::new(TlsSession {
                tls,
                ciphertext: BytesMut::new(),
                phase: TlsPhase::AwaitingHandshake,
            }),
            upper: RwLock::new(None),
        });

        inner.set_handler(Arc::new(TlsInbound(Arc::downgrade(&conn))));
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    pub fn phase(&self) -> TlsPhase {
        self.session.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn bytes_in(&self) -> u64 {
        self.inner.bytes_in()
    }

    pub fn bytes_out(&self) -> u64 {
        self.inner.bytes_out()
    }

    pub fn set_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        *self.upper.write() = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        self.inner.set_close_handler(handler);
    }

    pub fn open(&self) {
        self.inner.open();
    }

    pub fn pause(&self) {
        self.inner.pause();
    }

    pub fn resume(&self) {
        self.inner.resume();
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Encrypts `plaintext` and queues the records on the inner connection.
    pub fn write(&self, plaintext: Bytes) -> WriteCompletion {
        if self.inner.is_closed() {
            return WriteCompletion::ready(false);
        }

        let mut session = self.session.lock();
        let mut offset = 0;
        let mut last = None;

        while offset < plaintext.len() {
            let accepted = session.tls.writer().write(&plaintext[offset..]);
            match accepted {
                Ok(n) if n > 0 => offset += n,
                Ok(_) => {
                    // Nothing accepted: make room by flushing, give up if that
                    // does not help either.
                    match self.flush(&mut session.tls) {
                        Ok(Some(done)) => last = Some(done),
                        Ok(None) => {
                            warn!(peer = %self.id(), "TLS session refused plaintext");
                            drop(session);
                            self.inner.close();
                            return WriteCompletion::ready(false);
                        }
                        Err(e) => {
                            warn!(peer = %self.id(), error = %e, "TLS write failed");
                            drop(session);
                            self.inner.close();
                            return WriteCompletion::ready(false);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Ok(Some(done)) = self.flush(&mut session.tls) {
                        last = Some(done);
                    }
                }
                Err(e) => {
                    warn!(peer = %self.id(), error = %e, "TLS write failed");
                    drop(session);
                    self.inner.close();
                    return WriteCompletion::ready(false);
                }
            }
        }

        match self.flush(&mut session.tls) {
            Ok(Some(done)) => done,
            Ok(None) => last.unwrap_or_else(|| WriteCompletion::ready(true)),
            Err(e) => {
                warn!(peer = %self.id(), error = %e, "TLS write failed");
                drop(session);
                self.inner.close();
                WriteCompletion::ready(false)
            }
        }
    }

    fn receive(&self, data: &[u8]) {
        let progress = {
            let mut session = self.session.lock();
            session.ciphertext.extend_from_slice(data);
            self.advance(&mut session)
        };

        let progress = match progress {
            Ok(progress) => progress,
            Err(e) => {
                warn!(peer = %self.id(), error = %e, "TLS failure, closing connection");
                self.inner.close();
                return;
            }
        };

        if !progress.plaintext.is_empty() {
            let upper = self.upper.read().clone();
            if let Some(upper) = upper {
                upper.on_data(&progress.plaintext);
            }
        }

        if progress.peer_closed {
            debug!(peer = %self.id(), "TLS session closed by peer");
            self.inner.close();
        }
    }

    /// Feeds buffered ciphertext through the session: handshake messages while
    /// the handshake is running, decrypted records after that.
    fn advance(&self, session: &mut TlsSession) -> anyhow::Result<Progress> {
        let TlsSession {
            tls,
            ciphertext,
            phase,
        } = session;

        let mut progress = Progress {
            plaintext: Vec::new(),
            peer_closed: false,
        };

        // read_tls treats a zero-length read as end of stream, so only call it
        // while there is something to hand over.
        while !ciphertext.is_empty() {
            let read = tls
                .read_tls(&mut CiphertextReader(ciphertext))
                .context("buffering TLS records")?;
            if read == 0 {
                break;
            }

            let state = match tls.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    // push the alert out before giving up
                    let _ = self.flush(tls);
                    return Err(e).context("processing TLS records");
                }
            };

            if *phase == TlsPhase::AwaitingHandshake && !tls.is_handshaking() {
                *phase = TlsPhase::Established;
                debug!(peer = %self.id(), "TLS handshake complete");
            }

            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = progress.plaintext.len();
                progress.plaintext.resize(start + available, 0);
                tls.reader()
                    .read_exact(&mut progress.plaintext[start..])
                    .context("reading decrypted data")?;
            }

            if state.peer_has_closed() {
                progress.peer_closed = true;
                break;
            }
        }

        self.flush(tls).context("sending TLS records")?;
        Ok(progress)
    }

    /// Moves every pending record to the inner connection. Returns the
    /// completion of the last write, if anything was written.
    fn flush(&self, tls: &mut ServerConnection) -> io::Result<Option<WriteCompletion>> {
        let mut writer = CiphertextWriter {
            conn: &self.inner,
            last: None,
        };

        while tls.wants_write() {
            tls.write_tls(&mut writer)?;
        }

        Ok(writer.last)
    }
}
