//! Echo protocol handler.

use crate::connection::{Client, ConnectionRegistry};
use crate::protocols::with_idle_timeout;
use crate::server::Handler;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Echo connection handler
pub struct EchoHandler {
    registry: ConnectionRegistry,
    grace: Duration,
    idle_timeout: Option<Duration>,
}

impl EchoHandler {
    /// Create a handler that gives each connection `grace` to drain on
    /// shutdown and drops connections idle for longer than `idle_timeout`.
    pub fn new(grace: Duration, idle_timeout: Option<Duration>) -> Self {
        EchoHandler {
            registry: ConnectionRegistry::new(),
            grace,
            idle_timeout,
        }
    }

    /// Active connections of this handler.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Echo lines until EOF. Lines longer than `MAX_LINE_LENGTH` are echoed
    /// in pieces.
    async fn serve(&self, client: &Client, stream: TcpStream) -> io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = Vec::with_capacity(1024);

        loop {
            line.clear();

            let mut limited = (&mut reader).take(MAX_LINE_LENGTH as u64);
            let read = limited.read_until(b'\n', &mut line);
            let n = match with_idle_timeout(self.idle_timeout, read).await {
                Some(n) => n?,
                None => {
                    debug!(peer = %client.peer(), "Idle timeout, closing connection");
                    return Ok(());
                }
            };
            if n == 0 {
                trace!("Connection closed by client");
                return Ok(());
            }

            let _op = client.begin_operation();
            writer.write_all(&line).await?;
        }
    }
}

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, stream: TcpStream) {
        if self.registry.is_closing() {
            debug!("Handler closing, dropping connection");
            return;
        }

        let client = match Client::new(&stream) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!(error = %e, "Failed to set up connection");
                return;
            }
        };
        let Some(id) = self.registry.register(Arc::clone(&client)) else {
            debug!(peer = %client.peer(), "Handler closing, dropping connection");
            return;
        };
        debug!(peer = %client.peer(), active = self.registry.len(), "Client registered");

        match self.serve(&client, stream).await {
            Ok(()) => info!(peer = %client.peer(), "Connection closed"),
            Err(e) => warn!(peer = %client.peer(), error = %e, "Connection error"),
        }

        self.registry.remove(id);
        client.shutdown();
    }

    async fn close(&self) {
        info!("Echo handler shutting down");
        self.registry.close_all(self.grace).await;
    }
}
