//! Streaming RESP parser.
//!
//! Turns an arbitrary, possibly fragmented byte stream into a sequence of
//! payloads, one per logical message. The parser reads either a CRLF
//! terminated line or, when a bulk body is pending, exactly `len + 2` bytes
//! without scanning for line endings. That keeps bulk strings binary-safe.
//!
//! Malformed input yields a protocol error for that message and the state
//! resets, so the next bytes are read as a fresh message. I/O failure
//! (including end-of-stream) yields one final error and ends the stream.

use super::reply::Reply;
use bytes::Bytes;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::panic;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::error;

/// Maximum length of a single protocol line, CRLF included.
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// Maximum length of a bulk string body.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum number of elements in a multi-bulk.
pub const MAX_MULTIBULK_LEN: usize = 1024 * 1024;

/// Errors produced while parsing a stream.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed message. Recoverable: parsing continues with the next message.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The underlying source failed or ended. Terminal.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The parser task panicked. Terminal.
    #[error("internal parser fault: {0}")]
    Internal(String),
}

impl ParseError {
    /// Whether the stream ends after this error.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ParseError::Protocol(_))
    }

    /// Whether this error is a clean end of the input stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, ParseError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Parser output unit: a completed reply or an error.
pub type Payload = Result<Reply, ParseError>;

/// Composite message being assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgKind {
    /// `*` multi-bulk
    MultiBulk,
    /// `$` bulk string
    Bulk,
}

/// State of the message currently being parsed.
#[derive(Debug, Default)]
struct ParseState {
    multi_line: bool,
    expected_args: usize,
    kind: Option<MsgKind>,
    args: Vec<Bytes>,
    /// `None`: read a line. `Some(n)`: read exactly `n` bytes plus CRLF.
    bulk_len: Option<usize>,
}

impl ParseState {
    fn finished(&self) -> bool {
        self.expected_args > 0 && self.args.len() == self.expected_args
    }
}

/// One unit read from the source.
enum Chunk {
    /// A CRLF terminated line, terminator stripped.
    Line(Bytes),
    /// A length-prefixed bulk body, terminator stripped.
    Body(Bytes),
}

/// Incremental RESP parser over an async byte source.
pub struct Parser<R> {
    reader: BufReader<R>,
    state: ParseState,
    done: bool,
}

impl<R: AsyncRead + Unpin> Parser<R> {
    /// Create a parser reading from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            state: ParseState::default(),
            done: false,
        }
    }

    /// Read the next payload.
    ///
    /// Returns `None` once a terminal I/O error has been returned.
    pub async fn next_payload(&mut self) -> Option<Payload> {
        if self.done {
            return None;
        }

        loop {
            let chunk = match self.read_chunk().await {
                Ok(chunk) => chunk,
                Err(e) => {
                    if e.is_terminal() {
                        self.done = true;
                    }
                    return Some(self.emit(Err(e)));
                }
            };

            if let Some(payload) = self.advance(chunk) {
                return Some(payload);
            }
        }
    }

    /// Read one line or one pending bulk body.
    async fn read_chunk(&mut self) -> Result<Chunk, ParseError> {
        match self.state.bulk_len.take() {
            None => {
                let mut line = Vec::new();
                let n = (&mut self.reader)
                    .take(MAX_INLINE_LEN as u64)
                    .read_until(b'\n', &mut line)
                    .await?;

                if line.last() != Some(&b'\n') {
                    if n == MAX_INLINE_LEN {
                        self.discard_line().await?;
                        return Err(ParseError::Protocol("too big inline request".to_string()));
                    }
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                if line.len() < 2 || line[line.len() - 2] != b'\r' {
                    return Err(protocol_error("line not terminated by CRLF", &line));
                }

                line.truncate(line.len() - 2);
                Ok(Chunk::Line(Bytes::from(line)))
            }
            Some(len) => {
                // Capacity follows received bytes, not the header.
                let want = len + 2;
                let mut body = Vec::with_capacity(want.min(MAX_INLINE_LEN));
                let n = (&mut self.reader)
                    .take(want as u64)
                    .read_to_end(&mut body)
                    .await?;
                if n < want {
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }

                if !body.ends_with(b"\r\n") {
                    return Err(protocol_error("bulk body not terminated by CRLF", &body));
                }

                body.truncate(len);
                Ok(Chunk::Body(Bytes::from(body)))
            }
        }
    }

    /// Skip the remainder of an over-long line, up to and including `\n`.
    async fn discard_line(&mut self) -> io::Result<()> {
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    self.reader.consume(i + 1);
                    return Ok(());
                }
                None => {
                    let n = buf.len();
                    self.reader.consume(n);
                }
            }
        }
    }

    /// Feed one chunk into the state machine.
    fn advance(&mut self, chunk: Chunk) -> Option<Payload> {
        if self.state.multi_line {
            if let Err(e) = self.read_element(chunk) {
                return Some(self.emit(Err(e)));
            }
            if self.state.finished() {
                let args = std::mem::take(&mut self.state.args);
                let reply = match self.state.kind {
                    Some(MsgKind::Bulk) => Reply::Bulk(args.into_iter().next().unwrap_or_default()),
                    _ => Reply::MultiBulk(args),
                };
                return Some(self.emit(Ok(reply)));
            }
            return None;
        }

        // Bodies are only ever requested in multi-line mode.
        let (Chunk::Line(line) | Chunk::Body(line)) = chunk;

        match line.first() {
            Some(b'*') => match self.multi_bulk_header(&line) {
                Ok(()) if self.state.expected_args == 0 => Some(self.emit(Ok(Reply::EmptyMultiBulk))),
                Ok(()) => None,
                Err(e) => Some(self.emit(Err(e))),
            },
            Some(b'$') => match self.bulk_header(&line) {
                Ok(true) => Some(self.emit(Ok(Reply::NullBulk))),
                Ok(false) => None,
                Err(e) => Some(self.emit(Err(e))),
            },
            Some(b'+' | b'-' | b':') => Some(self.emit(parse_single_line(&line))),
            _ => {
                let args: Vec<Bytes> = line
                    .split(|b| b.is_ascii_whitespace())
                    .filter(|token| !token.is_empty())
                    .map(|token| line.slice_ref(token))
                    .collect();
                if args.is_empty() {
                    return None;
                }
                Some(self.emit(Ok(Reply::MultiBulk(args))))
            }
        }
    }

    /// `*<count>`: start collecting `count` elements.
    fn multi_bulk_header(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let count: usize = parse_number(&line[1..])
            .ok_or_else(|| protocol_error("invalid multibulk length", line))?;
        if count > MAX_MULTIBULK_LEN {
            return Err(protocol_error("invalid multibulk length", line));
        }

        self.state.expected_args = count;
        if count > 0 {
            self.state.kind = Some(MsgKind::MultiBulk);
            self.state.multi_line = true;
            self.state.args = Vec::with_capacity(count.min(1024));
        }
        Ok(())
    }

    /// `$<len>`: start a top-level bulk string. Returns `true` for a null bulk.
    fn bulk_header(&mut self, line: &[u8]) -> Result<bool, ParseError> {
        let len: i64 =
            parse_number(&line[1..]).ok_or_else(|| protocol_error("invalid bulk length", line))?;

        match len {
            -1 => Ok(true),
            n if n > 0 && n as usize <= MAX_BULK_LEN => {
                self.state.kind = Some(MsgKind::Bulk);
                self.state.multi_line = true;
                self.state.expected_args = 1;
                self.state.args = Vec::with_capacity(1);
                self.state.bulk_len = Some(n as usize);
                Ok(false)
            }
            _ => Err(protocol_error("invalid bulk length", line)),
        }
    }

    /// Handle one chunk while collecting the elements of a composite.
    fn read_element(&mut self, chunk: Chunk) -> Result<(), ParseError> {
        match chunk {
            Chunk::Body(body) => self.state.args.push(body),
            Chunk::Line(line) if line.first() == Some(&b'$') => {
                let len: i64 = parse_number(&line[1..])
                    .ok_or_else(|| protocol_error("invalid bulk length", &line))?;
                match len {
                    // Null element inside a multi-bulk
                    -1 => self.state.args.push(Bytes::new()),
                    n if n >= 0 && n as usize <= MAX_BULK_LEN => {
                        self.state.bulk_len = Some(n as usize);
                    }
                    _ => return Err(protocol_error("invalid bulk length", &line)),
                }
            }
            Chunk::Line(line) => self.state.args.push(line),
        }
        Ok(())
    }

    /// Reset state and hand back a terminal event for the current message.
    fn emit(&mut self, payload: Payload) -> Payload {
        self.state = ParseState::default();
        payload
    }
}

/// Parse `+status`, `-error` or `:integer` (CRLF already stripped).
fn parse_single_line(line: &[u8]) -> Payload {
    let text = &line[1..];
    match line[0] {
        b'+' => Ok(Reply::Status(String::from_utf8_lossy(text).into_owned())),
        b'-' => Ok(Reply::Error(String::from_utf8_lossy(text).into_owned())),
        _ => parse_number(text)
            .map(Reply::Integer)
            .ok_or_else(|| protocol_error("invalid integer", line)),
    }
}

/// Decimal number with an optional `-`. A leading `+` is not valid RESP.
fn parse_number<T: FromStr>(digits: &[u8]) -> Option<T> {
    if digits.first() == Some(&b'+') {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn protocol_error(reason: &str, raw: &[u8]) -> ParseError {
    ParseError::Protocol(format!("{reason} '{}'", raw.escape_ascii()))
}

/// Parse `reader` on a dedicated task, delivering payloads in order.
///
/// The channel holds a single payload, so the parser waits for the consumer
/// to take each one before reading further. The stream ends after the first
/// terminal error, or when the receiver is dropped. A panic inside the parser
/// is logged and delivered as a final [`ParseError::Internal`].
pub fn parse_stream<R>(reader: R) -> mpsc::Receiver<Payload>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let fault_tx = tx.clone();
    let backtrace = BacktraceSlot::default();

    let task = tokio::spawn(TraceOnPanic::new(
        async move {
            let mut parser = Parser::new(reader);
            while let Some(payload) = parser.next_payload().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        },
        Arc::clone(&backtrace),
    ));

    tokio::spawn(async move {
        if let Err(e) = task.await {
            if e.is_panic() {
                let message = panic_message(e.into_panic());
                match lock_slot(&backtrace).take() {
                    Some(trace) => {
                        error!(error = %message, backtrace = %trace, "Parser task panicked")
                    }
                    None => error!(error = %message, "Parser task panicked"),
                }
                let _ = fault_tx.send(Err(ParseError::Internal(message))).await;
            }
        }
    });

    rx
}

type BacktraceSlot = Arc<Mutex<Option<Backtrace>>>;

thread_local! {
    /// Slot of the traced future currently being polled on this thread.
    static PANIC_SLOT: RefCell<Option<BacktraceSlot>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

fn lock_slot(slot: &BacktraceSlot) -> MutexGuard<'_, Option<Backtrace>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chain a panic hook that records a backtrace for panics raised while a
/// [`TraceOnPanic`] future is polled. Other panics go to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let slot = PANIC_SLOT
                .try_with(|current| current.try_borrow().ok().and_then(|slot| (*slot).clone()))
                .ok()
                .flatten();
            match slot {
                Some(slot) => *lock_slot(&slot) = Some(Backtrace::force_capture()),
                None => previous(info),
            }
        }));
    });
}

/// Future wrapper that stores a backtrace in `slot` if polling panics.
struct TraceOnPanic<F> {
    inner: Pin<Box<F>>,
    slot: BacktraceSlot,
}

impl<F: Future> TraceOnPanic<F> {
    fn new(inner: F, slot: BacktraceSlot) -> Self {
        install_panic_hook();
        TraceOnPanic {
            inner: Box::pin(inner),
            slot,
        }
    }
}

impl<F: Future> Future for TraceOnPanic<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let _scope = PanicScope::enter(Arc::clone(&this.slot));
        this.inner.as_mut().poll(cx)
    }
}

/// Marks the current thread as polling a traced future; restored on drop,
/// including during unwinding.
struct PanicScope {
    previous: Option<BacktraceSlot>,
}

impl PanicScope {
    fn enter(slot: BacktraceSlot) -> Self {
        let previous = PANIC_SLOT.with(|current| current.replace(Some(slot)));
        PanicScope { previous }
    }
}

impl Drop for PanicScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        PANIC_SLOT.with(|current| *current.borrow_mut() = previous);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Parse every reply in `data`, failing on the first error.
pub async fn parse_bytes(data: &[u8]) -> Result<Vec<Reply>, ParseError> {
    let mut parser = Parser::new(data);
    let mut replies = Vec::new();

    while let Some(payload) = parser.next_payload().await {
        match payload {
            Ok(reply) => replies.push(reply),
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(replies)
}

/// Parse the first payload in `data`.
pub async fn parse_one(data: &[u8]) -> Result<Reply, ParseError> {
    Parser::new(data)
        .next_payload()
        .await
        .unwrap_or_else(|| Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()))
}
