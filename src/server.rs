//! TCP listener and connection lifecycle.
//!
//! Accepts connections, dispatches each to a [`Handler`] on its own task and
//! coordinates graceful shutdown: stop accepting, ask the handler to drain
//! and close its connections, then wait for every connection task to finish.

use crate::config::Config;
use crate::wait::Wait;
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Processes connections handed over by the server.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serve one connection until it closes or fails.
    async fn handle(&self, stream: TcpStream);

    /// Stop taking new work, drain active connections within the grace
    /// window and force-close whatever remains.
    async fn close(&self);
}

/// Listening server state for one session.
pub struct Server {
    listener: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    tasks: Arc<Wait>,
    closing: Arc<AtomicBool>,
}

/// Observer of a [`Server`] that stays usable while it serves.
#[derive(Debug, Clone)]
pub struct ServerState {
    closing: Arc<AtomicBool>,
    tasks: Arc<Wait>,
}

impl ServerState {
    /// Whether shutdown has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Connection tasks that have not finished yet.
    pub fn connections(&self) -> usize {
        self.tasks.count()
    }
}

impl Server {
    /// Bind a listener on `addr`, allowing at most `max_connections`
    /// concurrent connections.
    pub async fn bind<A: ToSocketAddrs>(addr: A, max_connections: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            tasks: Arc::new(Wait::new()),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether shutdown has begun.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Handle for observing this server after [`Server::serve`] takes it.
    pub fn state(&self) -> ServerState {
        ServerState {
            closing: Arc::clone(&self.closing),
            tasks: Arc::clone(&self.tasks),
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then shut down
    /// gracefully.
    ///
    /// Returns once the handler has closed and every connection task has
    /// finished.
    pub async fn serve<H, F>(self, handler: Arc<H>, shutdown: F)
    where
        H: Handler,
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            connection_limit,
            max_connections,
            tasks,
            closing,
        } = self;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let permit = match Arc::clone(&connection_limit).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(peer = %peer, max_connections, "Connection limit reached, rejecting");
                    continue;
                }
            };

            debug!(peer = %peer, "New connection");

            let handler = Arc::clone(&handler);
            let closing = Arc::clone(&closing);
            let guard = tasks.enter();
            tokio::spawn(async move {
                if closing.load(Ordering::Acquire) {
                    debug!(peer = %peer, "Server closing, dropping connection");
                    return;
                }
                handler.handle(stream).await;
                debug!(peer = %peer, "Connection finished");
                drop(permit);
                drop(guard);
            });
        }

        info!("Shutting down");
        closing.store(true, Ordering::Release);
        drop(listener);

        handler.close().await;

        info!(connections = tasks.count(), "Waiting for connections to finish");
        tasks.wait().await;
        info!("Server stopped");
    }
}

/// Bind to the configured address and serve until a termination signal
/// (SIGHUP, SIGQUIT, SIGTERM or SIGINT) arrives.
pub async fn listen_and_serve_with_signal<H: Handler>(
    config: &Config,
    handler: Arc<H>,
) -> io::Result<()> {
    let signals = Signals::register()?;

    let server = Server::bind(&config.listen, config.max_connections).await?;
    info!(address = %server.local_addr()?, "Server listening");

    server.serve(handler, signals.recv()).await;
    Ok(())
}

/// Termination signals that trigger a graceful shutdown.
#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Signals {
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(mut self) {
        let name = tokio::select! {
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.quit.recv() => "SIGQUIT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
        };
        info!(signal = name, "Received termination signal");
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> io::Result<Self> {
        Ok(Signals)
    }

    async fn recv(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(signal = "ctrl-c", "Received termination signal"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::echo::EchoHandler;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Instant};

    async fn start(
        handler: Arc<EchoHandler>,
        max_connections: usize,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let server = Server::bind("127.0.0.1:0", max_connections).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(server.serve(handler, async move {
            let _ = rx.await;
        }));
        (addr, tx, task)
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let handler = Arc::new(EchoHandler::new(Duration::from_secs(1), None));
        let (addr, stop, task) = start(Arc::clone(&handler), 16).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"hello\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "hello\n");

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        // The handler closed the connection during shutdown.
        line.clear();
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);
        assert!(handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let handler = Arc::new(EchoHandler::new(Duration::from_secs(1), None));
        let (addr, stop, task) = start(handler, 16).await;

        let mut clients = Vec::new();
        for i in 0..4 {
            let stream = TcpStream::connect(addr).await.unwrap();
            clients.push((i, stream));
        }

        let mut tasks = Vec::new();
        for (i, stream) in clients {
            tasks.push(tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                for n in 0..50 {
                    let msg = format!("client{i}-msg{n}\n");
                    writer.write_all(msg.as_bytes()).await.unwrap();
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    assert_eq!(line, msg);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejects_connections_over_limit() {
        let handler = Arc::new(EchoHandler::new(Duration::from_secs(1), None));
        let (addr, stop, task) = start(handler, 1).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        let mut second = TcpStream::connect(addr).await.unwrap();
        let n = timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closing_flag_is_set_on_shutdown() {
        let handler = Arc::new(EchoHandler::new(Duration::from_secs(1), None));
        let server = Server::bind("127.0.0.1:0", 16).await.unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state();
        assert!(!server.is_closing());

        let (stop, rx) = oneshot::channel();
        let task = tokio::spawn(server.serve(handler, async move {
            let _ = rx.await;
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert!(!state.is_closing());
        assert_eq!(state.connections(), 1);

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(state.is_closing());
        assert_eq!(state.connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_connections_is_prompt() {
        let handler = Arc::new(EchoHandler::new(Duration::from_secs(10), None));
        let (_addr, stop, task) = start(handler, 16).await;

        let start = Instant::now();
        stop.send(()).unwrap();
        task.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
