//! tapwire: a raw TCP test tool.
//!
//! Runs one side of a TCP conversation:
//! - Client mode (`--connect host:port`): connect with a bounded timeout
//! - Server mode (`--listen port`): serve a single client at a time
//!
//! Exchanged bytes are printed as text and as hex; stdin lines are sent
//! with the configured framing applied. Lifecycle events from the handlers
//! arrive on their background tasks and are forwarded over a channel back
//! to the main loop, which owns the terminal.

use std::net::SocketAddr;
use std::sync::Arc;
use tapwire::{
    framing, hexdump, ClientCallback, ClientHandler, Config, Mode, ServerCallback, ServerHandler,
    SharedSettings,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(mode = ?config.mode, "starting tapwire");

    let settings = SharedSettings::new(config.settings)?;
    match config.mode {
        Mode::Client { host, port } => run_client(&host, port, settings).await,
        Mode::Server { port } => run_server(port, settings).await,
    }
}

/// Prints events the way the tool's two panes show them and pokes the
/// main loop when the conversation is over.
struct Console {
    done: mpsc::UnboundedSender<()>,
}

impl ClientCallback for Console {
    fn on_connection_established(&self) {
        println!("** connection established **");
    }

    fn on_incoming_data(&self, data: &str) {
        print_exchange("<<", data);
    }

    fn on_connection_failure(&self, reason: &str) {
        eprintln!("** connection failure: {reason} **");
        let _ = self.done.send(());
    }

    fn on_connection_timeout(&self) {
        eprintln!("** connection timed out **");
        let _ = self.done.send(());
    }

    fn on_connection_released(&self) {
        println!("** connection released **");
        let _ = self.done.send(());
    }
}

impl ServerCallback for Console {
    fn on_open(&self) {
        println!("** listening **");
    }

    fn on_new_client(&self, peer: SocketAddr) {
        println!("** new client: {peer} **");
    }

    fn on_client_lost(&self, peer: SocketAddr) {
        println!("** client lost: {peer}, waiting for a replacement **");
    }

    fn on_incoming_data(&self, data: &str) {
        print_exchange("<<", data);
    }

    fn on_connection_failure(&self, reason: &str) {
        eprintln!("** connection failure: {reason} **");
        let _ = self.done.send(());
    }

    fn on_close(&self) {
        println!("** server closed **");
        let _ = self.done.send(());
    }
}

/// Text pane and hex pane, stacked: the payload line by line, then its hex.
fn print_exchange(direction: &str, data: &str) {
    for line in data.split_inclusive('\n') {
        println!("{direction} {}", line.trim_end_matches('\n'));
    }
    for hex_line in hexdump::format_hex(data.as_bytes()).split_terminator('\n') {
        println!("{direction} [hex] {}", hex_line.trim_end());
    }
}

fn stdin_lines() -> Lines<BufReader<Stdin>> {
    BufReader::new(tokio::io::stdin()).lines()
}

async fn run_client(
    host: &str,
    port: u16,
    settings: SharedSettings,
) -> Result<(), Box<dyn std::error::Error>> {
    let (done_tx, mut done) = mpsc::unbounded_channel();
    let handler = ClientHandler::with_callback(settings.clone(), Arc::new(Console { done: done_tx }));
    handler.start(host, port)?;

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            event = done.recv() => {
                let _ = event;
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let payload = framing::encode_outgoing(&settings.snapshot(), &line);
                        print_exchange(">>", &String::from_utf8_lossy(&payload));
                        if let Err(e) = handler.send_bytes(&payload).await {
                            eprintln!("** send failed: {e} **");
                        }
                    }
                    None => {
                        // stdin closed: hang up and let the teardown
                        // callbacks print the goodbye.
                        handler.teardown().await;
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn run_server(port: u16, settings: SharedSettings) -> Result<(), Box<dyn std::error::Error>> {
    let (done_tx, mut done) = mpsc::unbounded_channel();
    let handler = ServerHandler::with_callback(settings.clone(), Arc::new(Console { done: done_tx }));
    handler.start(port)?;

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            event = done.recv() => {
                let _ = event;
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let payload = framing::encode_outgoing(&settings.snapshot(), &line);
                        print_exchange(">>", &String::from_utf8_lossy(&payload));
                        if let Err(e) = handler.send_bytes(&payload).await {
                            eprintln!("** send failed: {e} **");
                        }
                    }
                    None => {
                        handler.teardown().await;
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
