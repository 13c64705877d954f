//! Transport layer.
//!
//! A [`Connection`] is one accepted socket, either plain TCP or wrapped in the
//! TLS decorator. Both variants expose the same contract so the HTTP layer
//! never needs to know which one it is talking to:
//!
//! - `open()` arms the read loop; bytes are pushed to the installed
//!   [`ConnectionHandler`] in order, one delivery at a time
//! - `pause()` / `resume()` gate delivery; resume re-drives anything buffered
//! - `write()` queues bytes and hands back a [`WriteCompletion`]
//! - `close()` is idempotent; the close notification fires exactly once

pub mod connection;
pub mod tls;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

pub use connection::TcpConnection;
pub use tls::{ServerIdentity, TlsConnection, TlsPhase};

/// A connection is identified by its peer address and port.
pub type ConnectionId = SocketAddr;

/// Invoked once with the connection id after the socket has been released.
pub type CloseHandler = Box<dyn FnOnce(ConnectionId) + Send>;

/// Receives bytes from a connection.
///
/// Deliveries for one connection never overlap. `on_close` runs once, after
/// the close notification, and the handler is dropped right after it.
pub trait ConnectionHandler: Send + Sync {
    fn on_data(&self, data: &[u8]);

    fn on_close(&self) {}
}

/// Timing knobs shared by every connection a server accepts.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// A read that stays silent this long closes the connection.
    pub idle_timeout: Duration,
    /// How long `close()` waits for queued writes before dropping them.
    pub drain_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Resolves to `true` once the bytes of one `write()` reached the socket,
/// `false` if the connection was closed or the write failed.
#[derive(Debug)]
pub struct WriteCompletion {
    state: CompletionState,
}

#[derive(Debug)]
enum CompletionState {
    Ready(bool),
    Pending(oneshot::Receiver<bool>),
}

impl WriteCompletion {
    pub(crate) fn ready(ok: bool) -> Self {
        Self {
            state: CompletionState::Ready(ok),
        }
    }

    pub(crate) fn pending(rx: oneshot::Receiver<bool>) -> Self {
        Self {
            state: CompletionState::Pending(rx),
        }
    }
}

impl Future for WriteCompletion {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.state {
            CompletionState::Ready(ok) => Poll::Ready(*ok),
            // A dropped sender means the write was discarded.
            CompletionState::Pending(rx) => Pin::new(rx).poll(cx).map(|res| res.unwrap_or(false)),
        }
    }
}

/// Which transport a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Plain,
    Tls,
}

/// An accepted connection, plain or TLS.
#[derive(Clone)]
pub enum Connection {
    Plain(Arc<TcpConnection>),
    Tls(Arc<TlsConnection>),
}

/// Non-owning reference to a [`Connection`].
#[derive(Clone)]
pub enum WeakConnection {
    Plain(Weak<TcpConnection>),
    Tls(Weak<TlsConnection>),
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        match self {
            WeakConnection::Plain(c) => c.upgrade().map(Connection::Plain),
            WeakConnection::Tls(c) => c.upgrade().map(Connection::Tls),
        }
    }

    /// Whether `conn` is the connection this reference was taken from.
    pub fn refers_to(&self, conn: &Connection) -> bool {
        match (self, conn) {
            (WeakConnection::Plain(w), Connection::Plain(c)) => {
                std::ptr::eq(w.as_ptr(), Arc::as_ptr(c))
            }
            (WeakConnection::Tls(w), Connection::Tls(c)) => {
                std::ptr::eq(w.as_ptr(), Arc::as_ptr(c))
            }
            _ => false,
        }
    }
}

impl Connection {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Connection::Plain(_) => ConnectionKind::Plain,
            Connection::Tls(_) => ConnectionKind::Tls,
        }
    }

    pub fn id(&self) -> ConnectionId {
        match self {
            Connection::Plain(c) => c.id(),
            Connection::Tls(c) => c.id(),
        }
    }

    pub fn downgrade(&self) -> WeakConnection {
        match self {
            Connection::Plain(c) => WeakConnection::Plain(Arc::downgrade(c)),
            Connection::Tls(c) => WeakConnection::Tls(Arc::downgrade(c)),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        match self {
            Connection::Plain(c) => c.set_handler(handler),
            Connection::Tls(c) => c.set_handler(handler),
        }
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        match self {
            Connection::Plain(c) => c.set_close_handler(handler),
            Connection::Tls(c) => c.set_close_handler(handler),
        }
    }

    pub fn open(&self) {
        match self {
            Connection::Plain(c) => c.open(),
            Connection::Tls(c) => c.open(),
        }
    }

    pub fn pause(&self) {
        match self {
            Connection::Plain(c) => c.pause(),
            Connection::Tls(c) => c.pause(),
        }
    }

    pub fn resume(&self) {
        match self {
            Connection::Plain(c) => c.resume(),
            Connection::Tls(c) => c.resume(),
        }
    }

    pub fn write(&self, bytes: Bytes) -> WriteCompletion {
        match self {
            Connection::Plain(c) => c.write(bytes),
            Connection::Tls(c) => c.write(bytes),
        }
    }

    pub fn close(&self) {
        match self {
            Connection::Plain(c) => c.close(),
            Connection::Tls(c) => c.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Connection::Plain(c) => c.is_closed(),
            Connection::Tls(c) => c.is_closed(),
        }
    }

    pub fn bytes_in(&self) -> u64 {
        match self {
            Connection::Plain(c) => c.bytes_in(),
            Connection::Tls(c) => c.bytes_in(),
        }
    }

    pub fn bytes_out(&self) -> u64 {
        match self {
            Connection::Plain(c) => c.bytes_out(),
            Connection::Tls(c) => c.bytes_out(),
        }
    }
}
