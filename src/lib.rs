//! tapwire: the connection core of a raw TCP test tool.
//!
//! tapwire drives exactly one TCP conversation at a time, either side:
//! - Client mode: connect to a remote `host:port` with a bounded timeout,
//!   then stream whatever the peer sends.
//! - Server mode: listen on a port with a backlog of one, serve a single
//!   client, and accept a replacement after that client hangs up.
//!
//! Features:
//! - Callback-based lifecycle notifications, decoupling the I/O loops from
//!   whatever owns them (a UI, a script, the bundled driver binary)
//! - Shared mutable settings consulted on every I/O event: read buffer
//!   size, STX/ETX wrapping, trailing newline, message on connect, and a
//!   conditional auto-reply rule
//! - Hex rendering of exchanged bytes for display layers
//! - Configuration via CLI arguments or TOML file

pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod hexdump;
pub mod server;

pub use callback::{ClientCallback, NoCallback, ServerCallback};
pub use client::ClientHandler;
pub use config::{Config, Mode, ReplyRule, Settings, SharedSettings};
pub use error::HandlerError;
pub use server::ServerHandler;
