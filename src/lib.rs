//! Swerve - embeddable HTTP server
//!
//! Plain or TLS connections with pause/resume flow control, an incremental
//! HTTP/1.1 parser with in-order pipelining, and a small path router.

pub mod buffer;
pub mod config;
pub mod http;
pub mod net;
pub mod server;
