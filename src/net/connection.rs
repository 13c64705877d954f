use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::net::{CloseHandler, ConnectionHandler, ConnectionId, ConnectionOptions, WriteCompletion};

const READ_CHUNK: usize = 8192;

struct WriteOp {
    bytes: Bytes,
    done: oneshot::Sender<bool>,
}

/// One accepted TCP socket.
///
/// Reads run on a dedicated task and are handed to the installed
/// [`ConnectionHandler`]. Writes are queued to a second task so they stay
/// ordered and never block the caller.
pub struct TcpConnection {
    id: ConnectionId,
    options: ConnectionOptions,
    runtime: Handle,
    this: Weak<TcpConnection>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writes: Mutex<Option<mpsc::UnboundedSender<WriteOp>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
    close_handler: Mutex<Option<CloseHandler>>,
    /// Bytes read from the socket but not yet handed to the handler.
    pending: Mutex<BytesMut>,
    /// Held while a delivery is running.
    delivery: Mutex<()>,
    paused: AtomicUsize,
    resumed: Arc<Notify>,
    stopped: AtomicBool,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TcpConnection {
    /// Wraps an accepted stream. Must be called from within a tokio runtime.
    pub fn new(stream: TcpStream, peer: SocketAddr, options: ConnectionOptions) -> Arc<Self> {
        let runtime = Handle::current();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        debug!(peer = %peer, "incoming connection established");

        Arc::new_cyclic(|this: &Weak<TcpConnection>| {
            let write_task = runtime.spawn(write_loop(this.clone(), write_half, rx));

            Self {
                id: peer,
                options,
                runtime: runtime.clone(),
                this: this.clone(),
                reader: Mutex::new(Some(read_half)),
                writes: Mutex::new(Some(tx)),
                write_task: Mutex::new(Some(write_task)),
                read_task: Mutex::new(None),
                handler: RwLock::new(None),
                close_handler: Mutex::new(None),
                pending: Mutex::new(BytesMut::new()),
                delivery: Mutex::new(()),
                paused: AtomicUsize::new(0),
                resumed: Arc::new(Notify::new()),
                stopped: AtomicBool::new(false),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
            }
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst) > 0
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn set_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock() = Some(handler);
    }

    /// Starts the read loop. Calling it twice, or after close, does nothing.
    pub fn open(&self) {
        if self.is_closed() {
            return;
        }

        let Some(reader) = self.reader.lock().take() else {
            debug!(peer = %self.id, "connection already open");
            return;
        };

        let task = self.runtime.spawn(read_loop(
            self.this.clone(),
            reader,
            Arc::clone(&self.resumed),
            self.options.idle_timeout,
        ));
        *self.read_task.lock() = Some(task);

        // close() may have run between the check above and storing the task
        if self.is_closed() {
            if let Some(task) = self.read_task.lock().take() {
                task.abort();
            }
        }
    }

    /// Stops handing bytes to the handler until a matching `resume()`.
    ///
    /// Safe to call from inside `on_data`.
    pub fn pause(&self) {
        self.paused.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one `pause()` and synchronously delivers anything buffered.
    pub fn resume(&self) {
        let previous = self
            .paused
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));

        if previous == Ok(1) {
            self.resumed.notify_waiters();
        }

        self.drive();
    }

    /// Queues `bytes` behind any earlier writes.
    pub fn write(&self, bytes: Bytes) -> WriteCompletion {
        if self.is_closed() {
            debug!(peer = %self.id, "cannot write to a closed connection");
            return WriteCompletion::ready(false);
        }

        let len = bytes.len() as u64;
        let (done, rx) = oneshot::channel();

        let queued = match self.writes.lock().as_ref() {
            Some(tx) => tx.send(WriteOp { bytes, done }).is_ok(),
            None => false,
        };

        if !queued {
            return WriteCompletion::ready(false);
        }

        self.bytes_out.fetch_add(len, Ordering::Relaxed);
        WriteCompletion::pending(rx)
    }

    /// Tears the connection down. Only the first call has any effect.
    ///
    /// Queued writes get up to the drain timeout to reach the socket, then the
    /// socket is released, the close handler runs and the data handler is
    /// dropped.
    pub fn close(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Dropping the sender lets the write task finish what is queued and exit.
        drop(self.writes.lock().take());
        drop(self.reader.lock().take());
        self.pending.lock().clear();
        self.resumed.notify_waiters();

        let write_task = self.write_task.lock().take();
        let read_task = self.read_task.lock().take();
        let handler = self.handler.write().take();
        let close_handler = self.close_handler.lock().take();
        let id = self.id;
        let drain = self.options.drain_timeout;
        let bytes_in = self.bytes_in();
        let bytes_out = self.bytes_out();

        self.runtime.spawn(async move {
            if let Some(mut task) = write_task {
                if tokio::time::timeout(drain, &mut task).await.is_err() {
                    warn!(peer = %id, "queued writes did not drain in time");
                    task.abort();
                }
            }

            if let Some(task) = read_task {
                task.abort();
            }

            if let Some(notify) = close_handler {
                notify(id);
            }

            if let Some(handler) = handler {
                handler.on_close();
            }

            info!(peer = %id, bytes_in, bytes_out, "connection closed");
        });
    }

    fn receive(&self, data: &[u8]) {
        self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.pending.lock().extend_from_slice(data);
        self.drive();
    }

    /// Delivers pending bytes unless another delivery is already running; that
    /// one picks up whatever became deliverable before it returns.
    fn drive(&self) {
        loop {
            let Some(guard) = self.delivery.try_lock() else {
                return;
            };
            self.deliver_pending();
            drop(guard);

            if !self.has_deliverable() {
                return;
            }
        }
    }

    fn has_deliverable(&self) -> bool {
        !self.is_closed() && !self.is_paused() && !self.pending.lock().is_empty()
    }

    fn deliver_pending(&self) {
        while !self.is_closed() && !self.is_paused() {
            let chunk = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    return;
                }
                pending.split().freeze()
            };

            let handler = self.handler.read().clone();
            if let Some(handler) = handler {
                handler.on_data(&chunk);
            }
        }
    }
}

async fn read_loop(
    weak: Weak<TcpConnection>,
    mut half: OwnedReadHalf,
    resumed: Arc<Notify>,
    idle_timeout: Duration,
) {
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        // Leave bytes in the kernel while delivery is paused.
        loop {
            let notified = resumed.notified();
            match weak.upgrade() {
                Some(conn) if conn.is_closed() => return,
                Some(conn) if conn.is_paused() => {}
                Some(_) => break,
                None => return,
            }
            notified.await;
        }

        let read = tokio::time::timeout(idle_timeout, half.read(&mut chunk)).await;

        let Some(conn) = weak.upgrade() else {
            return;
        };
        if conn.is_closed() {
            return;
        }

        match read {
            Err(_) => {
                info!(peer = %conn.id, "closing idle connection");
                conn.close();
                return;
            }
            Ok(Ok(0)) => {
                debug!(peer = %conn.id, "peer closed the connection");
                conn.close();
                return;
            }
            Ok(Ok(n)) => conn.receive(&chunk[..n]),
            Ok(Err(e)) => {
                warn!(peer = %conn.id, error = %e, "read failed");
                conn.close();
                return;
            }
        }
    }
}

async fn write_loop(
    weak: Weak<TcpConnection>,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    let mut failed = false;

    while let Some(op) = rx.recv().await {
        if failed {
            let _ = op.done.send(false);
            continue;
        }

        match half.write_all(&op.bytes).await {
            Ok(()) => {
                let _ = op.done.send(true);
            }
            Err(e) => {
                failed = true;
                let _ = op.done.send(false);
                if let Some(conn) = weak.upgrade() {
                    warn!(peer = %conn.id, error = %e, "write failed");
                    conn.close();
                }
            }
        }
    }

    let _ = half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    struct Recorder {
        chunks: UnboundedSender<Vec<u8>>,
    }

    impl ConnectionHandler for Recorder {
        fn on_data(&self, data: &[u8]) {
            let _ = self.chunks.send(data.to_vec());
        }
    }

    async fn pair(options: ConnectionOptions) -> (Arc<TcpConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (TcpConnection::new(stream, peer, options), client)
    }

    fn record(conn: &TcpConnection) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = unbounded_channel();
        conn.set_handler(Arc::new(Recorder { chunks: tx }));
        rx
    }

    fn count_closes(conn: &TcpConnection) -> Arc<AtomicUsize> {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        conn.set_close_handler(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        closes
    }

    async fn next_chunk(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn delivers_bytes_to_handler() {
        let (conn, mut client) = pair(ConnectionOptions::default()).await;
        let mut rx = record(&conn);
        conn.open();

        client.write_all(b"hello").await.unwrap();
        assert_eq!(next_chunk(&mut rx).await, b"hello");
        assert_eq!(conn.bytes_in(), 5);
    }

    #[tokio::test]
    async fn pause_holds_delivery_until_resume() {
        let (conn, mut client) = pair(ConnectionOptions::default()).await;
        let mut rx = record(&conn);
        conn.pause();
        conn.open();

        client.write_all(b"abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        conn.resume();
        assert_eq!(next_chunk(&mut rx).await, b"abc");
    }

    #[tokio::test]
    async fn nested_pauses_need_matching_resumes() {
        let (conn, _client) = pair(ConnectionOptions::default()).await;
        conn.pause();
        conn.pause();
        conn.resume();
        assert!(conn.is_paused());
        conn.resume();
        assert!(!conn.is_paused());
        conn.resume();
        assert!(!conn.is_paused());
    }

    #[tokio::test]
    async fn writes_reach_the_peer_in_order() {
        let (conn, mut client) = pair(ConnectionOptions::default()).await;
        conn.open();

        let first = conn.write(Bytes::from_static(b"one "));
        let second = conn.write(Bytes::from_static(b"two"));
        assert!(first.await);
        assert!(second.await);

        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one two");
        assert_eq!(conn.bytes_out(), 7);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, mut client) = pair(ConnectionOptions::default()).await;
        let closes = count_closes(&conn);
        conn.open();

        conn.close();
        conn.close();
        conn.close();

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!conn.write(Bytes::from_static(b"late")).await);
    }

    #[tokio::test]
    async fn close_drains_queued_writes() {
        let (conn, mut client) = pair(ConnectionOptions::default()).await;
        conn.open();

        let done = conn.write(Bytes::from_static(b"bye"));
        conn.close();
        assert!(done.await);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }

    #[tokio::test]
    async fn peer_hangup_closes() {
        let (conn, client) = pair(ConnectionOptions::default()).await;
        let closes = count_closes(&conn);
        conn.open();

        drop(client);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(conn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let options = ConnectionOptions {
            idle_timeout: Duration::from_millis(100),
            ..ConnectionOptions::default()
        };
        let (conn, _client) = pair(options).await;
        let closes = count_closes(&conn);
        conn.open();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(conn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
