use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::net::{
    Connection, ConnectionId, ConnectionKind, ConnectionOptions, ServerIdentity, TcpConnection,
    TlsConnection, WeakConnection,
};
use crate::server::{Listener, ServerState};

/// Decides which kind of connection wraps an accepted socket.
#[derive(Debug, Clone, Default)]
pub enum ConnectionFactory {
    #[default]
    Plain,
    Tls(ServerIdentity),
}

impl ConnectionFactory {
    pub fn create(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        options: ConnectionOptions,
    ) -> anyhow::Result<Connection> {
        let tcp = TcpConnection::new(stream, peer, options);
        match self {
            ConnectionFactory::Plain => Ok(Connection::Plain(tcp)),
            ConnectionFactory::Tls(identity) => {
                Ok(Connection::Tls(TlsConnection::new(tcp, identity)?))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub addr: SocketAddr,
    pub connection: ConnectionOptions,
    pub factory: ConnectionFactory,
}

impl ServerOptions {
    /// Plain TCP on every interface.
    pub fn port(port: u16) -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            connection: ConnectionOptions::default(),
            factory: ConnectionFactory::Plain,
        }
    }

    fn factory_kind(&self) -> ConnectionKind {
        match self.factory {
            ConnectionFactory::Plain => ConnectionKind::Plain,
            ConnectionFactory::Tls(_) => ConnectionKind::Tls,
        }
    }
}

/// Called for each new connection before its read loop starts.
pub type ServerAcceptHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

type Registry = Arc<Mutex<HashMap<ConnectionId, Connection>>>;

/// Owns the listener and every live connection.
///
/// The registry holds the only long-lived strong reference to each
/// connection; it drops it when the connection reports closure.
pub struct Server {
    options: ServerOptions,
    accept_handler: Option<ServerAcceptHandler>,
    connections: Registry,
    listener: Option<Listener>,
    state: ServerState,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            accept_handler: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            listener: None,
            state: ServerState::None,
        }
    }

    pub fn set_accept_handler(&mut self, handler: impl Fn(&Connection) + Send + Sync + 'static) {
        self.accept_handler = Some(Arc::new(handler));
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(Listener::local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Starts listening. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> anyhow::Result<SocketAddr> {
        if self.listener.is_some() {
            anyhow::bail!("server is already running");
        }

        self.state = ServerState::Starting;

        let registry = Arc::clone(&self.connections);
        let factory = self.options.factory.clone();
        let options = self.options.connection;
        let on_accept = self.accept_handler.clone();

        let mut listener = Listener::new(self.options.addr, move |stream, peer| {
            let conn = match factory.create(stream, peer, options) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "could not set up connection");
                    return;
                }
            };

            registry.lock().insert(conn.id(), conn.clone());

            let weak = Arc::downgrade(&registry);
            let closing = conn.downgrade();
            conn.set_close_handler(Box::new(move |id| {
                if let Some(registry) = weak.upgrade() {
                    deregister(&registry, id, &closing);
                }
            }));

            if let Some(on_accept) = &on_accept {
                on_accept(&conn);
            }

            conn.open();
        });

        match listener.start() {
            Ok(addr) => {
                self.listener = Some(listener);
                self.state = ServerState::Running;
                info!(addr = %addr, kind = ?self.options.factory_kind(), "server started");
                Ok(addr)
            }
            Err(e) => {
                self.state = ServerState::Stopped;
                Err(e)
            }
        }
    }

    /// Stops the listener, then closes every live connection.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut listener) = self.listener.take() else {
            anyhow::bail!("server is not running");
        };

        self.state = ServerState::Stopping;
        let result = listener.stop();

        let live: Vec<Connection> = self
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in &live {
            conn.close();
        }

        self.state = ServerState::Stopped;
        info!(closed = live.len(), "server stopped");
        result
    }
}

/// Drops the entry for `id` if it still belongs to `closing`. A peer that
/// reconnects from the same address and port gets a new entry under the same
/// id before the old connection has finished closing.
fn deregister(
    registry: &Mutex<HashMap<ConnectionId, Connection>>,
    id: ConnectionId,
    closing: &WeakConnection,
) {
    let removed = {
        let mut live = registry.lock();
        match live.get(&id) {
            Some(conn) if closing.refers_to(conn) => live.remove(&id),
            _ => None,
        }
    };
    drop(removed);
}
