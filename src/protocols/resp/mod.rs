//! RESP (Redis Serialization Protocol) implementation.
//!
//! - `reply`: reply values and their wire encoding
//! - `parser`: streaming, binary-safe parser
//! - `handler`: connection handler wiring the two together

pub mod handler;
pub mod parser;
pub mod reply;

pub use handler::RespHandler;
pub use parser::{parse_bytes, parse_one, parse_stream, ParseError, Parser, Payload};
pub use reply::Reply;
