//! chat-relay: accept TCP clients and rebroadcast each line to every other client.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use chat_relay::{RelayConfig, init_logger, run_server, sink, spawn_sink};

#[derive(Parser, Debug)]
#[command(name = "chat-relay", version, about = "TCP text relay with a durable message log")]
struct Args {
    /// TOML config file; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Name tagged on every log line (and used for the log file name)
    #[arg(long, default_value = "chat_relay")]
    name: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("Invalid configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("chat-relay-worker")
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    let logger = init_logger(&args.name, &config.logger);
    let store = sink::from_config(&config.sink).context("Failed to open log sink")?;

    let server_logger = logger.clone();
    let result = rt.block_on(async move {
        let (handle, _writer) = spawn_sink(store, config.sink_queue_capacity, server_logger.clone());
        run_server(config, handle, server_logger).await
    });

    // Sessions are abandoned on shutdown; give the sink thread a moment to drain.
    rt.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = &result {
        logger.error(&format!("Relay error: {}", e));
    }
    result.context("Relay stopped with an error")
}
