//! HTTP connection adapter.
//!
//! Sits on a [`Connection`] as its handler, runs the incoming bytes through a
//! [`RequestParser`] and hands complete requests to the request handler, one
//! at a time and in arrival order:
//!
//! ```text
//!   bytes ──► parser ──► queue ──► in flight ──► handler ── Response::finish()
//!                                     ▲                          │
//!                                     └──────── next ────────────┘
//! ```
//!
//! A request with a body pauses the connection; the body stays unread until
//! someone asks for it (a wait-for-data handler) or the response finishes on a
//! keep-alive connection, in which case it is read and thrown away.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::http::parser::{ParseEvent, RequestParser};
use crate::http::request::Request;
use crate::net::{Connection, ConnectionHandler, ConnectionId, WeakConnection, WriteCompletion};

/// Receives each request once it is its turn.
pub type RequestHandler = Arc<dyn Fn(Arc<HttpConnection>, Request) + Send + Sync>;

/// Runs once the body of a request has been read.
pub type BodyHandler = Box<dyn FnOnce(Request) + Send>;

#[derive(Default)]
struct AdapterState {
    parser: RequestParser,
    queue: VecDeque<Request>,
    /// Request whose response has not finished yet.
    in_flight: Option<u64>,
    /// Request whose body the parser is holding back.
    body_owner: Option<u64>,
    /// Who gets the body of `body_owner` once it has been read.
    body_target: Option<(Request, BodyHandler)>,
    next_seq: u64,
}

enum Action {
    Dispatch(Request),
    Body(Request, BodyHandler),
    Close,
}

pub struct HttpConnection {
    id: ConnectionId,
    this: Weak<HttpConnection>,
    connection: WeakConnection,
    runtime: Handle,
    requests: RequestHandler,
    state: Mutex<AdapterState>,
}

impl HttpConnection {
    /// Installs a new adapter as `conn`'s handler. Must be called from within
    /// a tokio runtime; handlers run on its blocking pool.
    pub fn attach(
        conn: &Connection,
        requests: impl Fn(Arc<HttpConnection>, Request) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let adapter = Arc::new_cyclic(|this| Self {
            id: conn.id(),
            this: this.clone(),
            connection: conn.downgrade(),
            runtime: Handle::current(),
            requests: Arc::new(requests),
            state: Mutex::new(AdapterState::default()),
        });

        conn.set_handler(Arc::clone(&adapter) as Arc<dyn ConnectionHandler>);
        adapter
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.connection
            .upgrade()
            .is_none_or(|conn| conn.is_closed())
    }

    pub fn write(&self, bytes: Bytes) -> WriteCompletion {
        match self.connection.upgrade() {
            Some(conn) => conn.write(bytes),
            None => WriteCompletion::ready(false),
        }
    }

    pub fn close(&self) {
        if let Some(conn) = self.connection.upgrade() {
            conn.close();
        }
    }

    /// Marks request `seq` as answered and lets the next queued one run.
    pub(crate) fn request_finished(&self, seq: u64) {
        let next = {
            let mut state = self.state.lock();
            if state.in_flight != Some(seq) {
                return;
            }
            state.in_flight = None;
            self.next_dispatch(&mut state)
        };

        if let Some(action) = next {
            self.run(vec![action]);
        }
    }

    /// Lets the parser read the body held for request `seq`, if any, and
    /// resumes the connection.
    pub(crate) fn release_body(&self, seq: u64) {
        let released = {
            let mut state = self.state.lock();
            let holding = state.body_owner == Some(seq) && state.parser.is_holding_body();
            if holding {
                state.parser.release_body();
            }
            holding
        };

        if !released {
            return;
        }

        trace!(peer = %self.id, seq, "releasing request body");
        if let Some(conn) = self.connection.upgrade() {
            conn.resume();
        }
        // bytes that arrived with the head are already in the parser
        self.process(&[]);
    }

    /// Calls `on_body` with `request` once its body has been read. A request
    /// without a held body goes straight to `on_body`.
    pub(crate) fn await_body(&self, request: Request, on_body: BodyHandler) {
        let seq = request.seq;
        let immediate = {
            let mut state = self.state.lock();
            if state.body_owner == Some(seq) && state.parser.is_holding_body() {
                state.body_target = Some((request, on_body));
                None
            } else {
                Some((request, on_body))
            }
        };

        match immediate {
            Some((request, on_body)) => on_body(request),
            None => self.release_body(seq),
        }
    }

    fn process(&self, data: &[u8]) {
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let mut actions = Vec::new();

        {
            let mut state = self.state.lock();
            state.parser.feed(data);

            loop {
                match state.parser.next_event() {
                    Ok(None) => break,
                    Ok(Some(ParseEvent::Head(mut request))) => {
                        request.seq = state.next_seq;
                        request.conn = Arc::downgrade(&this);
                        state.next_seq += 1;

                        // Paused under the lock: a release_body for this seq
                        // can only run after it.
                        if state.parser.is_holding_body() {
                            state.body_owner = Some(request.seq);
                            if let Some(conn) = self.connection.upgrade() {
                                conn.pause();
                            }
                        }

                        debug!(
                            peer = %self.id,
                            method = request.method.as_str(),
                            path = %request.path,
                            "request received"
                        );
                        state.queue.push_back(request);
                    }
                    Ok(Some(ParseEvent::Body(values))) => {
                        state.body_owner = None;
                        if let Some((mut request, on_body)) = state.body_target.take() {
                            request.values = values;
                            actions.push(Action::Body(request, on_body));
                        }
                    }
                    Err(e) => {
                        warn!(peer = %self.id, error = %e, "malformed request, closing connection");
                        state.queue.clear();
                        actions.push(Action::Close);
                        break;
                    }
                }
            }

            if let Some(action) = self.next_dispatch(&mut state) {
                actions.push(action);
            }
        }

        self.run(actions);
    }

    fn next_dispatch(&self, state: &mut AdapterState) -> Option<Action> {
        if state.in_flight.is_some() || self.is_closed() {
            return None;
        }
        let request = state.queue.pop_front()?;
        state.in_flight = Some(request.seq);
        Some(Action::Dispatch(request))
    }

    fn run(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dispatch(request) => {
                    let Some(this) = self.this.upgrade() else {
                        return;
                    };
                    let requests = Arc::clone(&self.requests);
                    self.runtime.spawn_blocking(move || requests(this, request));
                }
                Action::Body(request, on_body) => {
                    self.runtime.spawn_blocking(move || on_body(request));
                }
                Action::Close => self.close(),
            }
        }
    }
}

impl ConnectionHandler for HttpConnection {
    fn on_data(&self, data: &[u8]) {
        self.process(data);
    }

    fn on_close(&self) {
        // Dropped outside the lock: a pending body target may own a Response,
        // whose drop calls back into this adapter.
        let (queued, target) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.queue), state.body_target.take())
        };

        if !queued.is_empty() {
            debug!(peer = %self.id, dropped = queued.len(), "connection closed with requests queued");
        }
        drop(target);
    }
}
