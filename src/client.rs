//! Client connection handler: one outbound TCP connection at a time.
//!
//! `start` spawns a single background task that connects (bounded by the
//! configured timeout) and then runs the read loop; everything the task
//! learns is reported through the installed [`ClientCallback`]. `send` and
//! `teardown` run on the caller's task and may block briefly on I/O.
//!
//! Every state transition goes through one mutex-guarded cell carrying a
//! per-`start` generation, so the read loop's failure path and an external
//! `teardown` can race freely and the terminal callback still fires exactly
//! once per established connection.

use crate::callback::{ClientCallback, NoCallback};
use crate::config::SharedSettings;
use crate::error::HandlerError;
use crate::framing;
use bytes::BytesMut;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Lifecycle phase of the single connection a handler owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Established,
}

/// Mutable handler state. `generation` ties a background task to the
/// `start` call that spawned it, so a task that lost a teardown race can
/// never move the state machine.
struct StateCell {
    phase: Phase,
    generation: u64,
    shutdown: Arc<Notify>,
}

struct Shared {
    settings: SharedSettings,
    callback: RwLock<Arc<dyn ClientCallback>>,
    state: Mutex<StateCell>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

/// Owns a single outbound TCP connection's lifecycle: connect, read loop,
/// send, teardown.
pub struct ClientHandler {
    shared: Arc<Shared>,
}

impl ClientHandler {
    /// Handler with no owner attached yet; events go to [`NoCallback`].
    pub fn new(settings: SharedSettings) -> Self {
        Self::with_callback(settings, Arc::new(NoCallback))
    }

    pub fn with_callback(settings: SharedSettings, callback: Arc<dyn ClientCallback>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                callback: RwLock::new(callback),
                state: Mutex::new(StateCell {
                    phase: Phase::Idle,
                    generation: 0,
                    shutdown: Arc::new(Notify::new()),
                }),
                writer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Replace the installed callback. Meant to be called while the handler
    /// is idle; events already in flight may still reach the old callback.
    pub fn set_callback(&self, callback: Arc<dyn ClientCallback>) {
        *self.shared.callback.write().unwrap() = callback;
    }

    /// Launch the connect attempt and, on success, the read loop on a
    /// dedicated background task. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, host: &str, port: u16) -> Result<(), HandlerError> {
        if host.is_empty() {
            return Err(HandlerError::EmptyHost);
        }
        if port == 0 {
            return Err(HandlerError::InvalidPort);
        }
        let (generation, shutdown) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.phase != Phase::Idle {
                return Err(HandlerError::AlreadyConnected);
            }
            state.generation += 1;
            state.phase = Phase::Connecting;
            state.shutdown = Arc::new(Notify::new());
            (state.generation, state.shutdown.clone())
        };
        let shared = Arc::clone(&self.shared);
        let host = host.to_string();
        tokio::spawn(run(shared, host, port, generation, shutdown));
        Ok(())
    }

    /// Encode `text` as UTF-8 and write + flush it on the caller's task.
    ///
    /// No framing is applied; exactly these bytes go out. On I/O failure
    /// the installed callback sees `on_connection_failure` and the
    /// connection is released.
    pub async fn send(&self, text: &str) -> Result<(), HandlerError> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Write + flush raw bytes on the caller's task.
    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<(), HandlerError> {
        if !self.is_connected() {
            return Err(HandlerError::NotConnected);
        }
        match write_bytes(&self.shared, bytes).await {
            Err(HandlerError::Io(e)) => {
                let reason = e.to_string();
                warn!(error = %reason, "failed to write data");
                let released = close_connection(&self.shared, None).await;
                let cb = callback(&self.shared);
                cb.on_connection_failure(&reason);
                if released {
                    cb.on_connection_released();
                }
                Err(HandlerError::Io(e))
            }
            other => other,
        }
    }

    /// Liveness probe backed by the handler's own state flag; never touches
    /// the socket.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().unwrap().phase == Phase::Established
    }

    /// Release the connection, if any. Idempotent and safe to call from any
    /// task, including concurrently with the read loop's own failure
    /// handling; `on_connection_released` fires exactly once per
    /// established connection, and not at all for a connection that never
    /// came up.
    pub async fn teardown(&self) {
        if close_connection(&self.shared, None).await {
            info!("connection released");
            callback(&self.shared).on_connection_released();
        }
    }
}

fn callback(shared: &Arc<Shared>) -> Arc<dyn ClientCallback> {
    shared.callback.read().unwrap().clone()
}

/// Background task: bounded connect attempt, then the read loop.
async fn run(
    shared: Arc<Shared>,
    host: String,
    port: u16,
    generation: u64,
    shutdown: Arc<Notify>,
) {
    let budget = Duration::from_millis(shared.settings.snapshot().connect_timeout_ms);
    debug!(host = %host, port, "connecting");
    let stream = match timeout(budget, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            info!(host = %host, port, error = %e, "failed to establish connection");
            if abort_connect(&shared, generation) {
                callback(&shared).on_connection_failure(&e.to_string());
            }
            return;
        }
        Err(_) => {
            info!(host = %host, port, "failed to establish connection due to timeout");
            if abort_connect(&shared, generation) {
                callback(&shared).on_connection_timeout();
            }
            return;
        }
    };

    let (reader, writer) = stream.into_split();
    *shared.writer.lock().await = Some(writer);
    if !try_establish(&shared, generation) {
        // A teardown raced the connect; surrender the socket quietly.
        shared.writer.lock().await.take();
        return;
    }
    info!(host = %host, port, "connection established");
    callback(&shared).on_connection_established();

    let settings = shared.settings.snapshot();
    if let Some(message) = framing::connect_message(&settings) {
        let payload = framing::encode_outgoing(&settings, &message);
        if let Err(HandlerError::Io(e)) = write_bytes(&shared, &payload).await {
            warn!(error = %e, "failed to write connect message");
            fail_connection(&shared, generation, &e.to_string()).await;
            return;
        }
    }

    read_loop(&shared, reader, generation, shutdown).await;
}

/// Repeated blocking reads of up to `buffer_size` bytes until the
/// connection ends. The buffer size is re-read from the shared settings on
/// every iteration.
async fn read_loop(
    shared: &Arc<Shared>,
    mut reader: OwnedReadHalf,
    generation: u64,
    shutdown: Arc<Notify>,
) {
    loop {
        let buffer_size = shared.settings.snapshot().buffer_size;
        let mut buf = BytesMut::with_capacity(buffer_size);
        let read = tokio::select! {
            res = reader.read_buf(&mut buf) => res,
            _ = shutdown.notified() => {
                // Teardown already moved the state machine; just drop the
                // read half so the socket fully closes.
                debug!("read loop stopped by teardown");
                return;
            }
        };
        match read {
            Ok(0) => {
                info!("connection closed by peer");
                if close_connection(shared, Some(generation)).await {
                    callback(shared).on_connection_released();
                }
                return;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                callback(shared).on_incoming_data(&text);
                let settings = shared.settings.snapshot();
                if let Some(reply) = framing::auto_reply_for(&settings, &text) {
                    let payload = framing::encode_outgoing(&settings, &reply);
                    if let Err(HandlerError::Io(e)) = write_bytes(shared, &payload).await {
                        warn!(error = %e, "failed to write auto reply");
                        fail_connection(shared, generation, &e.to_string()).await;
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to read data");
                fail_connection(shared, generation, &e.to_string()).await;
                return;
            }
        }
    }
}

async fn write_bytes(shared: &Arc<Shared>, bytes: &[u8]) -> Result<(), HandlerError> {
    let mut slot = shared.writer.lock().await;
    let writer = slot.as_mut().ok_or(HandlerError::NotConnected)?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Connect attempt ended without a connection; back to `Idle` if this task
/// still owns the state. Returns whether it did (the caller then reports
/// the outcome).
fn abort_connect(shared: &Arc<Shared>, generation: u64) -> bool {
    let mut state = shared.state.lock().unwrap();
    if state.generation != generation || state.phase != Phase::Connecting {
        return false;
    }
    state.phase = Phase::Idle;
    true
}

fn try_establish(shared: &Arc<Shared>, generation: u64) -> bool {
    let mut state = shared.state.lock().unwrap();
    if state.generation != generation || state.phase != Phase::Connecting {
        return false;
    }
    state.phase = Phase::Established;
    true
}

/// Read/write failure on a live connection: run the release transition and,
/// when this caller wins it, report failure followed by release.
async fn fail_connection(shared: &Arc<Shared>, generation: u64, reason: &str) {
    if close_connection(shared, Some(generation)).await {
        let cb = callback(shared);
        cb.on_connection_failure(reason);
        cb.on_connection_released();
    }
}

/// Transition out of the live phases. With `Some(generation)` only the
/// matching background task may perform it; `None` is an external teardown
/// and acts on whatever is current. Returns whether an established
/// connection was released (the caller then fires the terminal callback).
async fn close_connection(shared: &Arc<Shared>, generation: Option<u64>) -> bool {
    let (released, shutdown) = {
        let mut state = shared.state.lock().unwrap();
        if generation.is_some_and(|g| g != state.generation) {
            return false;
        }
        match state.phase {
            Phase::Idle => return false,
            Phase::Connecting => {
                // The pending connect compares generations when it resolves
                // and drops its socket without any callback.
                state.generation += 1;
                state.phase = Phase::Idle;
                (false, state.shutdown.clone())
            }
            Phase::Established => {
                state.phase = Phase::Idle;
                (true, state.shutdown.clone())
            }
        }
    };
    shutdown.notify_one();
    if let Some(mut writer) = shared.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
    released
}
