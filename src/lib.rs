//! resp-server: the network core of a Redis-protocol server.
//!
//! - `protocols::resp`: streaming RESP parser and reply serializer
//! - `server`: TCP accept loop, handler dispatch and graceful shutdown
//! - `connection`: per-connection records and the active-connection registry
//! - `wait`: counting wait primitive with timeout, bounding shutdown drains

pub mod config;
pub mod connection;
pub mod protocols;
pub mod server;
pub mod wait;
