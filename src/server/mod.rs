//! Accepting connections.
//!
//! [`Listener`] owns the listening socket and nothing else. [`Server`] sits on
//! top of it, turns each accepted socket into a [`Connection`](crate::net::Connection)
//! and keeps track of the live ones.

pub mod listener;
pub mod registry;

pub use listener::Listener;
pub use registry::{ConnectionFactory, Server, ServerOptions};

/// Lifecycle of a listener or server. Transitions only happen through
/// `start()` and `stop()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    None,
    Starting,
    Running,
    Stopping,
    Stopped,
}
