//! Courier broker binary: parses flags, starts the server and waits for
//! ctrl-c.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use courier_server::ServerConfig;
use courier_telemetry::{LogFormat, TelemetryConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Pretty,
}

/// Relays commands from controllers to connected agents.
#[derive(Parser, Debug)]
#[command(name = "courier", about = "Command broker for connected agents")]
struct Cli {
    /// Host to bind.
    #[arg(long, env = "COURIER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "COURIER_PORT", default_value = "9091")]
    port: u16,

    /// Seconds to wait for an agent's reply when the caller sets no timeout.
    #[arg(long, env = "COURIER_COMMAND_TIMEOUT_SECS", default_value = "10")]
    command_timeout_secs: u64,

    /// Outbound queue capacity per agent stream.
    #[arg(long, env = "COURIER_SEND_QUEUE", default_value = "256")]
    send_queue: usize,

    /// Seconds between WebSocket pings to agents.
    #[arg(long, env = "COURIER_PING_INTERVAL_SECS", default_value = "30")]
    ping_interval_secs: u64,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, env = "COURIER_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    #[arg(long, env = "COURIER_LOG_FORMAT", value_enum, default_value = "json")]
    log_format: Format,
}

impl Cli {
    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            format: match self.log_format {
                Format::Json => LogFormat::Json,
                Format::Pretty => LogFormat::Pretty,
            },
            ..Default::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_send_queue: self.send_queue,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = courier_telemetry::init_telemetry(cli.telemetry_config());

    let config = cli.server_config();
    let addr = format!("{}:{}", config.host, config.port);
    let handle = courier_server::start(config, telemetry.metrics())
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(port = handle.port, "Courier ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    Ok(())
}
