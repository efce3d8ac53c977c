//! Echo protocol implementation.
//!
//! A line echo service for I/O and shutdown testing:
//! - Client sends: `<anything>\n`
//! - Server echoes the line back verbatim
//!
//! Each write counts as an in-flight operation on its connection, so a
//! graceful shutdown lets pending echoes finish before the socket is closed.

pub mod handler;

pub use handler::EchoHandler;
