//! HTTP/1.1 on top of [`crate::net::Connection`].
//!
//! # Architecture
//!
//! - **`parser`**: incremental request parser, fed whatever chunks arrive
//! - **`connection`**: per-connection adapter; queues parsed requests and runs
//!   them one at a time, in order
//! - **`router`**: ordered handler list and the [`HttpServer`](router::HttpServer)
//! - **`request`** / **`response`** / **`header`**: the message types
//! - **`writer`**: serializes the status line and headers
//! - **`files`** / **`mime`**: static file tree with directory listings
//!
//! # Request lifecycle
//!
//! ```text
//!        ┌──────────────────┐
//!        │  Request line    │ ← wait for a full line
//!        └──────┬───────────┘
//!               ▼
//!        ┌──────────────────┐
//!        │    Headers       │ ← until the blank line
//!        └──────┬───────────┘
//!               │ Content-Length > 0 → connection paused, body held
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatched     │ ← when no earlier response is pending
//!        └──────┬───────────┘
//!               │ Response::finish()
//!               ├─ Keep-Alive → body drained, next request
//!               └─ otherwise  → Closed
//! ```
//!
//! # Example
//!
//! ```no_run
//! use swerve::http::request::Method;
//! use swerve::http::router::HttpServer;
//! use swerve::server::ServerOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = HttpServer::new(ServerOptions::port(8080));
//!     server.add_handler(Method::Get, "/", false, |_request, mut response| {
//!         response.add_header("Content-Type", "text/plain");
//!         response.add_header("Content-Length", 2);
//!         response.write_str("hi");
//!         response.finish();
//!     });
//!     server.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop()
//! }
//! ```

pub mod connection;
pub mod files;
pub mod header;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod router;
mod writer;
