//! Server connection handler: a listening socket plus at most one accepted
//! client at a time.
//!
//! `start` spawns a single background task that binds the listener (with a
//! backlog of one), accepts a client, and runs the read loop. When the
//! client hangs up the task goes back to accepting, so a replacement can
//! connect while the listener stays open. This deliberately trades
//! concurrency for simplicity: the tool is a point-to-point test harness,
//! one tester talking to one peer at a time.
//!
//! A failed bind or accept tears the handler down rather than leaving an
//! open listener with no task servicing it; the owner restarts with
//! `start`.

use crate::callback::{NoCallback, ServerCallback};
use crate::config::SharedSettings;
use crate::error::HandlerError;
use crate::framing;
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Lifecycle phase of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Opening,
    Open,
}

/// Mutable handler state. The accepted client's address doubles as the
/// "client present" flag; `generation` ties the background task to the
/// `start` call that spawned it.
struct StateCell {
    phase: Phase,
    generation: u64,
    client: Option<SocketAddr>,
    shutdown: Arc<Notify>,
}

struct Shared {
    settings: SharedSettings,
    callback: RwLock<Arc<dyn ServerCallback>>,
    state: Mutex<StateCell>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

/// How a client's read loop ended.
enum ClientEnd {
    /// Zero-length read: the client hung up cleanly.
    Hangup,
    /// A teardown moved the state machine; the task just exits.
    Stopped,
    /// Read or write failure with the reason.
    Failed(String),
}

/// Owns a listening socket and at most one accepted client connection.
pub struct ServerHandler {
    shared: Arc<Shared>,
}

impl ServerHandler {
    /// Handler with no owner attached yet; events go to [`NoCallback`].
    pub fn new(settings: SharedSettings) -> Self {
        Self::with_callback(settings, Arc::new(NoCallback))
    }

    pub fn with_callback(settings: SharedSettings, callback: Arc<dyn ServerCallback>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                callback: RwLock::new(callback),
                state: Mutex::new(StateCell {
                    phase: Phase::Closed,
                    generation: 0,
                    client: None,
                    shutdown: Arc::new(Notify::new()),
                }),
                writer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Replace the installed callback. Meant to be called while the handler
    /// is closed; events already in flight may still reach the old callback.
    pub fn set_callback(&self, callback: Arc<dyn ServerCallback>) {
        *self.shared.callback.write().unwrap() = callback;
    }

    /// Bind the listener and serve clients one at a time on a dedicated
    /// background task. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, port: u16) -> Result<(), HandlerError> {
        if port == 0 {
            return Err(HandlerError::InvalidPort);
        }
        let (generation, shutdown) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.phase != Phase::Closed {
                return Err(HandlerError::AlreadyOpen);
            }
            state.generation += 1;
            state.phase = Phase::Opening;
            state.client = None;
            state.shutdown = Arc::new(Notify::new());
            (state.generation, state.shutdown.clone())
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run(shared, port, generation, shutdown));
        Ok(())
    }

    /// Encode `text` as UTF-8 and write + flush it to the current client on
    /// the caller's task.
    ///
    /// No framing is applied; exactly these bytes go out. On I/O failure
    /// the installed callback sees `on_connection_failure` and the whole
    /// handler closes.
    pub async fn send(&self, text: &str) -> Result<(), HandlerError> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Write + flush raw bytes to the current client on the caller's task.
    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<(), HandlerError> {
        {
            let state = self.shared.state.lock().unwrap();
            if state.phase != Phase::Open {
                return Err(HandlerError::NotConnected);
            }
            if state.client.is_none() {
                return Err(HandlerError::NoClient);
            }
        }
        match write_bytes(&self.shared, bytes).await {
            Err(HandlerError::Io(e)) => {
                let reason = e.to_string();
                warn!(error = %reason, "failed to write data to client");
                let closed = close_server(&self.shared, None).await;
                let cb = callback(&self.shared);
                cb.on_connection_failure(&reason);
                if closed {
                    cb.on_close();
                }
                Err(HandlerError::Io(e))
            }
            other => other,
        }
    }

    /// State probe backed by the handler's own flags; never touches the
    /// sockets.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().unwrap().phase == Phase::Open
    }

    /// Whether a client is currently connected.
    pub fn has_client(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.phase == Phase::Open && state.client.is_some()
    }

    /// Address of the currently connected client, if any.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        let state = self.shared.state.lock().unwrap();
        if state.phase == Phase::Open {
            state.client
        } else {
            None
        }
    }

    /// Close the client socket (if present) and the listener. Idempotent
    /// and safe to call from any task; `on_close` fires exactly once per
    /// opened listener, and not at all for a listener that never opened.
    pub async fn teardown(&self) {
        if close_server(&self.shared, None).await {
            info!("server closed");
            callback(&self.shared).on_close();
        }
    }
}

fn callback(shared: &Arc<Shared>) -> Arc<dyn ServerCallback> {
    shared.callback.read().unwrap().clone()
}

/// Bind with a backlog of exactly one pending connection. std/tokio `bind`
/// does not expose the backlog, so the socket is built by hand.
fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Background task: bind, then cycle accept-wait and read loop until a
/// failure or teardown closes the listener.
async fn run(shared: Arc<Shared>, port: u16, generation: u64, shutdown: Arc<Notify>) {
    let listener = match bind_listener(port) {
        Ok(listener) => listener,
        Err(e) => {
            info!(port, error = %e, "failed to open server");
            if abort_open(&shared, generation) {
                callback(&shared).on_connection_failure(&e.to_string());
            }
            return;
        }
    };
    if !mark_open(&shared, generation) {
        // A teardown raced the bind; surrender the listener quietly.
        return;
    }
    info!(port, "server open");
    callback(&shared).on_open();

    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to wait for client");
                    fail_server(&shared, generation, &e.to_string()).await;
                    return;
                }
            },
            _ = shutdown.notified() => {
                debug!("accept wait stopped by teardown");
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        *shared.writer.lock().await = Some(writer);
        if !attach_client(&shared, generation, peer) {
            shared.writer.lock().await.take();
            return;
        }
        info!(peer = %peer, "new client");
        callback(&shared).on_new_client(peer);

        match read_client(&shared, reader, &shutdown).await {
            ClientEnd::Hangup => {
                if !detach_client(&shared, generation) {
                    return;
                }
                info!(peer = %peer, "connection closed by client");
                callback(&shared).on_client_lost(peer);
                if let Some(mut writer) = shared.writer.lock().await.take() {
                    let _ = writer.shutdown().await;
                }
                // Keep listening for a replacement client.
            }
            ClientEnd::Stopped => return,
            ClientEnd::Failed(reason) => {
                fail_server(&shared, generation, &reason).await;
                return;
            }
        }
    }
}

/// Repeated blocking reads of up to `buffer_size` bytes from the current
/// client. The buffer size is re-read from the shared settings on every
/// iteration.
async fn read_client(
    shared: &Arc<Shared>,
    mut reader: OwnedReadHalf,
    shutdown: &Arc<Notify>,
) -> ClientEnd {
    loop {
        let buffer_size = shared.settings.snapshot().buffer_size;
        let mut buf = BytesMut::with_capacity(buffer_size);
        let read = tokio::select! {
            res = reader.read_buf(&mut buf) => res,
            _ = shutdown.notified() => {
                debug!("read loop stopped by teardown");
                return ClientEnd::Stopped;
            }
        };
        match read {
            Ok(0) => return ClientEnd::Hangup,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                callback(shared).on_incoming_data(&text);
                let settings = shared.settings.snapshot();
                if let Some(reply) = framing::auto_reply_for(&settings, &text) {
                    let payload = framing::encode_outgoing(&settings, &reply);
                    if let Err(HandlerError::Io(e)) = write_bytes(shared, &payload).await {
                        warn!(error = %e, "failed to write auto reply");
                        return ClientEnd::Failed(e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read data from client");
                return ClientEnd::Failed(e.to_string());
            }
        }
    }
}

async fn write_bytes(shared: &Arc<Shared>, bytes: &[u8]) -> Result<(), HandlerError> {
    let mut slot = shared.writer.lock().await;
    let writer = slot.as_mut().ok_or(HandlerError::NoClient)?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Bind ended without a listener; back to `Closed` if this task still owns
/// the state.
fn abort_open(shared: &Arc<Shared>, generation: u64) -> bool {
    let mut state = shared.state.lock().unwrap();
    if state.generation != generation || state.phase != Phase::Opening {
        return false;
    }
    state.phase = Phase::Closed;
    true
}

fn mark_open(shared: &Arc<Shared>, generation: u64) -> bool {
    let mut state = shared.state.lock().unwrap();
    if state.generation != generation || state.phase != Phase::Opening {
        return false;
    }
    state.phase = Phase::Open;
    true
}

fn attach_client(shared: &Arc<Shared>, generation: u64, peer: SocketAddr) -> bool {
    let mut state = shared.state.lock().unwrap();
    if state.generation != generation || state.phase != Phase::Open {
        return false;
    }
    state.client = Some(peer);
    true
}

fn detach_client(shared: &Arc<Shared>, generation: u64) -> bool {
    let mut state = shared.state.lock().unwrap();
    if state.generation != generation || state.phase != Phase::Open || state.client.is_none() {
        return false;
    }
    state.client = None;
    true
}

/// Accept or I/O failure on an open listener: run the close transition and,
/// when this caller wins it, report failure followed by close.
async fn fail_server(shared: &Arc<Shared>, generation: u64, reason: &str) {
    if close_server(shared, Some(generation)).await {
        let cb = callback(shared);
        cb.on_connection_failure(reason);
        cb.on_close();
    }
}

/// Transition out of the live phases. With `Some(generation)` only the
/// matching background task may perform it; `None` is an external teardown
/// and acts on whatever is current. Returns whether an open listener was
/// closed (the caller then fires the terminal callback).
async fn close_server(shared: &Arc<Shared>, generation: Option<u64>) -> bool {
    let (closed, shutdown) = {
        let mut state = shared.state.lock().unwrap();
        if generation.is_some_and(|g| g != state.generation) {
            return false;
        }
        match state.phase {
            Phase::Closed => return false,
            Phase::Opening => {
                // The bind in flight compares generations when it resolves
                // and drops the listener without any callback.
                state.generation += 1;
                state.phase = Phase::Closed;
                (false, state.shutdown.clone())
            }
            Phase::Open => {
                state.phase = Phase::Closed;
                state.client = None;
                (true, state.shutdown.clone())
            }
        }
    };
    shutdown.notify_one();
    if let Some(mut writer) = shared.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
    closed
}
