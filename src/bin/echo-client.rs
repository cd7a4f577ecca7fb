//! Interactive client for the line-echo server.
//!
//! Reads lines from standard input, sends them to the server and prints
//! both directions:
//!
//! ```text
//! client: hello
//! server: hello
//! ```

use line_echo::{Client, ClientConfig, Relay};
use std::io::Write;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load()?;

    // Logs go to stderr so stdout stays a clean transcript
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(relay(&config));

    // A pending stdin read would otherwise hold up runtime shutdown.
    runtime.shutdown_background();
    result
}

async fn relay(config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::connect(config)
        .await
        .map_err(|e| format!("failed to connect to {}: {e}", config.server))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_relays(rx));

    let result = client.run(BufReader::new(tokio::io::stdin()), tx).await;
    let _ = printer.await;

    result.map_err(|e| format!("connection to {} failed: {e}", config.server).into())
}

async fn print_relays(mut rx: mpsc::UnboundedReceiver<Relay>) {
    while let Some(relay) = rx.recv().await {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{relay}");
        let _ = stdout.flush();
    }
}
