//! Notification contracts between the connection handlers and their owner.
//!
//! Every lifecycle event a handler produces is delivered through one of
//! these traits. All methods have empty default bodies, so an owner only
//! implements the events it cares about and a handler with no owner
//! attached runs against [`NoCallback`]. Callbacks are invoked from the
//! handler's own background task, or from whichever task called `send` or
//! `teardown`; owners that touch single-threaded state (a UI event loop,
//! say) must hand the event off themselves.

use std::net::SocketAddr;

/// Events produced by a [`ClientHandler`](crate::client::ClientHandler).
pub trait ClientCallback: Send + Sync {
    /// The outbound connection is up; `send` may be called from now on.
    fn on_connection_established(&self) {}

    /// A chunk of peer data, decoded as UTF-8 (lossy).
    fn on_incoming_data(&self, _data: &str) {}

    /// Connect or I/O failure, with a human-readable reason.
    fn on_connection_failure(&self, _reason: &str) {}

    /// The connect attempt outlived its timeout budget.
    fn on_connection_timeout(&self) {}

    /// The connection is gone and the handler is idle again.
    fn on_connection_released(&self) {}
}

/// Events produced by a [`ServerHandler`](crate::server::ServerHandler).
pub trait ServerCallback: Send + Sync {
    /// The listening socket is bound and accepting.
    fn on_open(&self) {}

    /// A client was accepted.
    fn on_new_client(&self, _peer: SocketAddr) {}

    /// The current client hung up; the listener waits for a replacement.
    fn on_client_lost(&self, _peer: SocketAddr) {}

    /// A chunk of client data, decoded as UTF-8 (lossy).
    fn on_incoming_data(&self, _data: &str) {}

    /// Bind, accept or I/O failure, with a human-readable reason.
    fn on_connection_failure(&self, _reason: &str) {}

    /// The listening socket is closed.
    fn on_close(&self) {}
}

/// Callback that ignores every event. Handlers start with this attached
/// until the owner installs its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallback;

impl ClientCallback for NoCallback {}
impl ServerCallback for NoCallback {}
