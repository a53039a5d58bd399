use anyhow::Result;
use broadcast::BroadcastService;
use config::Config;
use node::Node;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use transport::write_messages;
use transport::StdioTransport;

mod broadcast;
mod config;
mod dispatch;
mod errors;
mod message_handling;
mod message_store;
mod node;
mod primitives;
mod protocol;
mod retry;
mod topology;
mod transport;

/// Logs go to stderr, or to hourly rolling files if a log directory is
/// configured. Stdout carries the protocol.
fn init_tracing(config: &Config) -> WorkerGuard {
    let (writer, guard) = match &config.log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::hourly(
            dir,
            "broadcast.log",
        )),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let _guard = init_tracing(&config);
    info!("Starting broadcast node with {config:?}");

    let (transport, outbound) = StdioTransport::new();
    let (stop_writer, writer_stopped) = oneshot::channel();
    let writer = tokio::spawn(write_messages(outbound, tokio::io::stdout(), writer_stopped));

    let service = BroadcastService::start(&config, transport.clone());
    let node = Node::new(transport, service.gossip());
    let res = node.run(BufReader::new(tokio::io::stdin())).await;
    service.shutdown().await;

    // Delivery lanes keep their transport clones, so the queue never closes by
    // itself.
    let _ = stop_writer.send(());
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Could not write to stdout: {e}"),
        Err(e) => error!("Writer task failed: {e}"),
    }
    res
}
