use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::server::ServerState;

const BACKLOG: u32 = 100;

/// Called for every accepted socket with the peer's address.
pub type AcceptHandler = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Binds a TCP port and hands each accepted socket to the accept handler.
pub struct Listener {
    addr: SocketAddr,
    accept: AcceptHandler,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn new(
        addr: SocketAddr,
        accept: impl Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        Self {
            addr,
            accept: Arc::new(accept),
            state: ServerState::None,
            local_addr: None,
            task: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// The bound address; differs from the configured one when port 0 was used.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds, listens and starts accepting. Must be called from within a tokio
    /// runtime.
    pub fn start(&mut self) -> anyhow::Result<SocketAddr> {
        if matches!(self.state, ServerState::Starting | ServerState::Running) {
            anyhow::bail!("listener on {} is already running", self.addr);
        }

        self.state = ServerState::Starting;

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                self.state = ServerState::Stopped;
                return Err(e);
            }
        };

        let local_addr = listener.local_addr().context("reading bound address")?;
        self.local_addr = Some(local_addr);
        self.task = Some(tokio::spawn(accept_loop(listener, Arc::clone(&self.accept))));
        self.state = ServerState::Running;

        info!(addr = %local_addr, "listening");
        Ok(local_addr)
    }

    /// Stops accepting and closes the listening socket.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        if self.state != ServerState::Running {
            anyhow::bail!("listener on {} is not running", self.addr);
        }

        self.state = ServerState::Stopping;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state = ServerState::Stopped;

        info!(addr = ?self.local_addr, "listener stopped");
        Ok(())
    }

    fn bind(&self) -> anyhow::Result<TcpListener> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("creating listening socket")?;

        socket
            .set_reuseaddr(true)
            .context("enabling address reuse")?;
        socket
            .bind(self.addr)
            .with_context(|| format!("binding {}", self.addr))?;
        socket
            .listen(BACKLOG)
            .with_context(|| format!("listening on {}", self.addr))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, accept: AcceptHandler) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %peer, error = %e, "could not disable Nagle");
                }
                accept(stream, peer);
            }
            Err(e) => {
                // usually descriptor exhaustion; back off instead of spinning
                error!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
