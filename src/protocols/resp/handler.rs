//! RESP protocol connection handler.
//!
//! Feeds each connection through the streaming parser and answers every
//! payload in order. Well-formed messages are echoed back serialized;
//! protocol errors are reported to the client and the connection stays open.

use super::parser::{parse_stream, ParseError};
use super::reply::Reply;
use crate::connection::{Client, ConnectionRegistry};
use crate::protocols::with_idle_timeout;
use crate::server::Handler;
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Write buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// RESP connection handler
pub struct RespHandler {
    registry: ConnectionRegistry,
    grace: Duration,
    idle_timeout: Option<Duration>,
}

impl RespHandler {
    /// Create a handler that gives each connection `grace` to drain on
    /// shutdown and drops connections idle for longer than `idle_timeout`.
    pub fn new(grace: Duration, idle_timeout: Option<Duration>) -> Self {
        RespHandler {
            registry: ConnectionRegistry::new(),
            grace,
            idle_timeout,
        }
    }

    /// Active connections of this handler.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Produce the reply for one parsed message.
    fn execute(&self, message: Reply) -> Reply {
        message
    }

    async fn serve(&self, client: &Client, stream: TcpStream) -> io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut payloads = parse_stream(reader);
        let mut out = BytesMut::with_capacity(BUFFER_SIZE);

        loop {
            let payload = match with_idle_timeout(self.idle_timeout, payloads.recv()).await {
                Some(Some(payload)) => payload,
                Some(None) => return Ok(()),
                None => {
                    debug!(peer = %client.peer(), "Idle timeout, closing connection");
                    return Ok(());
                }
            };

            let reply = match payload {
                Ok(message) => {
                    trace!(?message, "Processing RESP message");
                    self.execute(message)
                }
                Err(e) if e.is_eof() => {
                    trace!("Connection closed by client");
                    return Ok(());
                }
                Err(ParseError::Io(e)) => return Err(e),
                Err(e @ ParseError::Internal(_)) => {
                    return Err(io::Error::new(io::ErrorKind::Other, e));
                }
                Err(e) => {
                    warn!(peer = %client.peer(), error = %e, "RESP parse error");
                    Reply::error(format!("ERR {e}"))
                }
            };

            let _op = client.begin_operation();
            out.clear();
            reply.encode_into(&mut out);
            writer.write_all(&out).await?;
        }
    }
}

#[async_trait]
impl Handler for RespHandler {
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
        info!("RESP handler shutting down");
        self.registry.close_all(self.grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    async fn start(
        handler: Arc<RespHandler>,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let server = Server::bind("127.0.0.1:0", 64).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(server.serve(handler, async move {
            let _ = rx.await;
        }));
        (addr, tx, task)
    }

    async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_echoes_multi_bulk() {
        let handler = Arc::new(RespHandler::new(Duration::from_secs(1), None));
        let (addr, stop, task) = start(handler).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        stream.write_all(request).await.unwrap();
        assert_eq!(read_exactly(&mut stream, request.len()).await, request);

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inline_command_is_answered_as_multi_bulk() {
        let handler = Arc::new(RespHandler::new(Duration::from_secs(1), None));
        let (addr, stop, task) = start(handler).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"PING hello\r\n").await.unwrap();
        let expected = b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n";
        assert_eq!(read_exactly(&mut stream, expected.len()).await, expected);

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_connections_keep_their_own_order() {
        let handler = Arc::new(RespHandler::new(Duration::from_secs(1), None));
        let (addr, stop, task) = start(handler).await;

        let mut clients = Vec::new();
        for i in 0..4 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            clients.push(tokio::spawn(async move {
                let mut request = Vec::new();
                let mut expected = BytesMut::new();
                for n in 0..50 {
                    let arg = format!("client{i}-msg{n}");
                    if n % 2 == 0 {
                        request.extend_from_slice(format!("ECHO {arg}\r\n").as_bytes());
                    } else {
                        request.extend_from_slice(
                            format!("*2\r\n$4\r\nECHO\r\n${}\r\n{arg}\r\n", arg.len()).as_bytes(),
                        );
                    }
                    Reply::multi_bulk(vec![Bytes::from_static(b"ECHO"), Bytes::from(arg)])
                        .encode_into(&mut expected);
                }

                stream.write_all(&request).await.unwrap();
                assert_eq!(read_exactly(&mut stream, expected.len()).await, &expected[..]);
            }));
        }
        for client in clients {
            client.await.unwrap();
        }

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_protocol_error_keeps_connection_open() {
        let handler = Arc::new(RespHandler::new(Duration::from_secs(1), None));
        let (addr, stop, task) = start(handler).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"*1\r\n$bad\r\n+OK\r\n").await.unwrap();

        let expected_error = b"-ERR Protocol error: invalid bulk length '$bad'\r\n";
        assert_eq!(
            read_exactly(&mut stream, expected_error.len()).await,
            expected_error
        );
        assert_eq!(read_exactly(&mut stream, 5).await, b"+OK\r\n");

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let handler = Arc::new(RespHandler::new(
            Duration::from_secs(1),
            Some(Duration::from_millis(100)),
        ));
        let (addr, stop, task) = start(Arc::clone(&handler)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let handler = Arc::new(RespHandler::new(Duration::from_millis(200), None));
        let (addr, stop, task) = start(Arc::clone(&handler)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b":1\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 4).await, b":1\r\n");
        assert_eq!(handler.registry().len(), 1);

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        assert!(handler.registry().is_closing());
        assert!(handler.registry().is_empty());
    }
}
