//! resp-server: a RESP protocol server
//!
//! Accepts TCP connections and serves them with one of:
//! - `resp`: parses Redis protocol messages and echoes each one back
//! - `echo`: echoes raw lines
//!
//! SIGHUP, SIGQUIT, SIGTERM and SIGINT trigger a graceful shutdown: the
//! listener closes, each connection gets the grace period to finish
//! in-flight work, then remaining connections are forced closed.

use resp_server::config::{Config, ProtocolType};
use resp_server::protocols::echo::EchoHandler;
use resp_server::protocols::resp::RespHandler;
use resp_server::server::listen_and_serve_with_signal;
use std::sync::Arc;
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

    info!(
        listen = %config.listen,
        protocol = ?config.protocol,
        max_connections = config.max_connections,
        timeout = ?config.timeout,
        shutdown_grace = ?config.shutdown_grace,
        "Starting resp-server"
    );

    match config.protocol {
        ProtocolType::Resp => {
            let handler = Arc::new(RespHandler::new(config.shutdown_grace, config.timeout));
            listen_and_serve_with_signal(&config, handler).await?;
        }
        ProtocolType::Echo => {
            let handler = Arc::new(EchoHandler::new(config.shutdown_grace, config.timeout));
            listen_and_serve_with_signal(&config, handler).await?;
        }
    }

    Ok(())
}
