//! Request routing.
//!
//! Handlers are tried in registration order; the first whose method and path
//! rule match gets the request. Nothing matching means the connection is
//! closed without a response.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::connection::HttpConnection;
use crate::http::files::FileModule;
use crate::http::request::{ContentKind, Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::net::{ConnectionOptions, ServerIdentity};
use crate::server::{ConnectionFactory, Server, ServerOptions, ServerState};

/// Route callback. Receives the capture values of a pattern route (empty for
/// exact-path routes), the request and its response.
pub type RouteHandler = Arc<dyn Fn(Vec<String>, Request, Response) + Send + Sync>;

enum PathRule {
    Equals(String),
    Like(Regex),
}

impl PathRule {
    /// Capture values on a match: the whole match first, then each group that
    /// took part in it.
    fn matches(&self, path: &str) -> Option<Vec<String>> {
        match self {
            PathRule::Equals(expected) => (expected == path).then(Vec::new),
            PathRule::Like(regex) => regex.captures(path).map(|caps| {
                caps.iter()
                    .flatten()
                    .map(|m| m.as_str().to_string())
                    .collect()
            }),
        }
    }
}

struct Route {
    method: Method,
    rule: PathRule,
    wait_for_data: bool,
    handler: RouteHandler,
}

impl Route {
    fn dispatch(&self, values: Vec<String>, conn: Arc<HttpConnection>, request: Request) {
        let mut response = Response::new(conn, &request);

        if !self.wait_for_data || !request.has_body() {
            (self.handler)(values, request, response);
            return;
        }

        match request.content_kind() {
            ContentKind::UrlForm => {
                let handler = Arc::clone(&self.handler);
                request.read_body(move |request| handler(values, request, response));
            }
            kind => {
                warn!(
                    path = %request.path,
                    content_type = ?request.content_type(),
                    ?kind,
                    "unsupported request body, answering 415"
                );
                response.set_status(StatusCode::UnsupportedMediaType);
                response.add_header("Content-Length", 0);
                response.write(Bytes::new());
                response.close();
            }
        }
    }
}

/// Ordered list of routes.
#[derive(Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes requests whose path equals `path` exactly.
    pub fn add_handler(
        &mut self,
        method: Method,
        path: &str,
        wait_for_data: bool,
        handler: impl Fn(Request, Response) + Send + Sync + 'static,
    ) {
        self.routes.push(Arc::new(Route {
            method,
            rule: PathRule::Equals(path.to_string()),
            wait_for_data,
            handler: Arc::new(move |_, request, response| handler(request, response)),
        }));
    }

    /// Routes requests whose path matches the regular expression `pattern`.
    /// An invalid pattern registers nothing.
    pub fn add_pattern_handler(
        &mut self,
        method: Method,
        pattern: &str,
        wait_for_data: bool,
        handler: impl Fn(Vec<String>, Request, Response) + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                warn!(pattern, error = %e, "invalid route pattern, handler not installed");
                return Err(e).with_context(|| format!("invalid route pattern {pattern:?}"));
            }
        };

        self.routes.push(Arc::new(Route {
            method,
            rule: PathRule::Like(regex),
            wait_for_data,
            handler: Arc::new(handler),
        }));
        Ok(())
    }

    fn find(&self, request: &Request) -> Option<(Arc<Route>, Vec<String>)> {
        self.routes
            .iter()
            .filter(|route| route.method == request.method)
            .find_map(|route| {
                route
                    .rule
                    .matches(&request.path)
                    .map(|values| (Arc::clone(route), values))
            })
    }

    /// Hands `request` to the first matching route, or closes the connection.
    pub(crate) fn route(router: &RwLock<Router>, conn: Arc<HttpConnection>, request: Request) {
        // the lock is not held while the handler runs
        let found = router.read().find(&request);

        match found {
            Some((route, values)) => route.dispatch(values, conn, request),
            None => {
                debug!(
                    peer = %conn.id(),
                    method = request.method.as_str(),
                    path = %request.path,
                    "no handler matched, closing connection"
                );
                conn.close();
            }
        }
    }
}

/// HTTP server: a [`Server`] whose connections speak HTTP, plus a [`Router`].
///
/// Routes can be added before or after `start()`.
pub struct HttpServer {
    server: Server,
    router: Arc<RwLock<Router>>,
}

impl HttpServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            server: Server::new(options),
            router: Arc::new(RwLock::new(Router::new())),
        }
    }

    /// Builds the server described by `config`, loading the TLS identity and
    /// installing the file module when configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let factory = match &config.tls {
            Some(tls) => ConnectionFactory::Tls(
                ServerIdentity::from_pem_files(&tls.cert_path, &tls.key_path)
                    .context("loading TLS identity")?,
            ),
            None => ConnectionFactory::Plain,
        };

        let options = ServerOptions {
            connection: ConnectionOptions {
                idle_timeout: Duration::from_secs(config.server.idle_timeout_secs),
                drain_timeout: Duration::from_secs(config.server.write_drain_timeout_secs),
            },
            factory,
            ..ServerOptions::port(config.server.port)
        };

        let server = Self::new(options);
        if let Some(files) = &config.static_files {
            server
                .add_file_module(&files.local_path, &files.web_path)
                .context("installing file module")?;
        }
        Ok(server)
    }

    pub fn add_handler(
        &self,
        method: Method,
        path: &str,
        wait_for_data: bool,
        handler: impl Fn(Request, Response) + Send + Sync + 'static,
    ) {
        self.router
            .write()
            .add_handler(method, path, wait_for_data, handler);
    }

    pub fn add_pattern_handler(
        &self,
        method: Method,
        pattern: &str,
        wait_for_data: bool,
        handler: impl Fn(Vec<String>, Request, Response) + Send + Sync + 'static,
    ) -> anyhow::Result<()> {
        self.router
            .write()
            .add_pattern_handler(method, pattern, wait_for_data, handler)
    }

    /// Serves the directory `local_path` under `web_path`.
    pub fn add_file_module(
        &self,
        local_path: impl Into<PathBuf>,
        web_path: &str,
    ) -> anyhow::Result<()> {
        let module = Arc::new(FileModule::new(local_path, web_path));
        let pattern = module.pattern();
        info!(root = %module.root().display(), web_path, "serving files");

        self.add_pattern_handler(Method::Get, &pattern, false, move |values, request, response| {
            module.serve(values, request, response)
        })
    }

    /// Starts accepting. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let router = Arc::clone(&self.router);
        self.server.set_accept_handler(move |conn| {
            let router = Arc::clone(&router);
            HttpConnection::attach(conn, move |http, request| {
                Router::route(&router, http, request)
            });
        });

        self.server.start().context("starting HTTP server")
    }

    pub fn stop(&mut self) -> anyhow::Result<()> {
        self.server.stop()
    }

    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }
}
