//! RESP reply values and their wire encoding.
//!
//! Every reply is self-describing and terminated by CRLF. Bulk payloads are
//! length-prefixed, so they may carry arbitrary bytes (including CRLF and
//! NUL) without corrupting framing.

use bytes::{Bytes, BytesMut};

/// Line terminator for every RESP frame.
pub const CRLF: &[u8] = b"\r\n";

/// Encoding of a null bulk string.
pub const NULL_BULK_BYTES: &[u8] = b"$-1\r\n";

/// Encoding of an empty multi-bulk.
pub const EMPTY_MULTI_BULK_BYTES: &[u8] = b"*0\r\n";

/// A wire-representable RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status reply: +OK\r\n
    Status(String),
    /// Error reply: -ERR message\r\n
    Error(String),
    /// Integer reply: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    Bulk(Bytes),
    /// Null bulk string: $-1\r\n
    NullBulk,
    /// Multi-bulk of bulk strings: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    MultiBulk(Vec<Bytes>),
    /// Empty multi-bulk: *0\r\n
    EmptyMultiBulk,
}

impl Reply {
    /// Encode the reply to bytes.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the reply into an existing buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                buf.extend_from_slice(b"+");
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Error(s) => {
                buf.extend_from_slice(b"-");
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.extend_from_slice(b":");
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Bulk(data) => encode_bulk(data, buf),
            Reply::NullBulk => buf.extend_from_slice(NULL_BULK_BYTES),
            Reply::MultiBulk(args) => {
                buf.reserve(args.iter().map(|a| a.len() + 16).sum::<usize>() + 16);
                buf.extend_from_slice(b"*");
                buf.extend_from_slice(args.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for arg in args {
                    encode_bulk(arg, buf);
                }
            }
            Reply::EmptyMultiBulk => buf.extend_from_slice(EMPTY_MULTI_BULK_BYTES),
        }
    }

    /// Whether this reply encodes as an error (leading `-`).
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Create a status reply
    pub fn status<S: Into<String>>(s: S) -> Reply {
        Reply::Status(s.into())
    }

    /// Create an error reply
    pub fn error<S: Into<String>>(s: S) -> Reply {
        Reply::Error(s.into())
    }

    /// Create an integer reply
    pub fn integer(n: i64) -> Reply {
        Reply::Integer(n)
    }

    /// Create a bulk string reply
    pub fn bulk<B: Into<Bytes>>(data: B) -> Reply {
        Reply::Bulk(data.into())
    }

    /// Create a null bulk reply
    pub fn null() -> Reply {
        Reply::NullBulk
    }

    /// Create a multi-bulk reply
    pub fn multi_bulk(args: Vec<Bytes>) -> Reply {
        Reply::MultiBulk(args)
    }

    /// Create an empty multi-bulk reply
    pub fn empty() -> Reply {
        Reply::EmptyMultiBulk
    }
}

fn encode_bulk(data: &[u8], buf: &mut BytesMut) {
    buf.extend_from_slice(b"$");
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_status() {
        assert_eq!(&Reply::status("OK").encode()[..], b"+OK\r\n");
    }

    #[test]
    fn test_encode_error() {
        let reply = Reply::error("ERR unknown");
        assert_eq!(&reply.encode()[..], b"-ERR unknown\r\n");
        assert!(reply.is_error());
        assert!(!Reply::status("ERR").is_error());
    }

    #[test]
    fn test_encode_integer() {
        assert_eq!(&Reply::integer(42).encode()[..], b":42\r\n");
        assert_eq!(&Reply::integer(-7).encode()[..], b":-7\r\n");
        assert_eq!(&Reply::integer(0).encode()[..], b":0\r\n");
        assert_eq!(
            &Reply::integer(i64::MIN).encode()[..],
            b":-9223372036854775808\r\n"
        );
    }

    #[test]
    fn test_encode_bulk_is_binary_safe() {
        let reply = Reply::bulk(Bytes::from_static(b"fo\r\nb\0r"));
        assert_eq!(&reply.encode()[..], b"$7\r\nfo\r\nb\0r\r\n");
    }

    #[test]
    fn test_encode_null_and_empty() {
        assert_eq!(&Reply::null().encode()[..], NULL_BULK_BYTES);
        assert_eq!(&Reply::empty().encode()[..], EMPTY_MULTI_BULK_BYTES);
        assert_eq!(&Reply::multi_bulk(vec![]).encode()[..], b"*0\r\n");
    }

    #[test]
    fn test_encode_multi_bulk() {
        let reply = Reply::multi_bulk(vec![
            Bytes::from_static(b"foo"),
            Bytes::from_static(b"bar"),
        ]);
        assert_eq!(&reply.encode()[..], b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::new();
        Reply::status("OK").encode_into(&mut buf);
        Reply::integer(1).encode_into(&mut buf);
        assert_eq!(&buf[..], b"+OK\r\n:1\r\n");
    }

    #[test]
    fn test_every_encoding_ends_with_crlf() {
        let replies = [
            Reply::status("OK"),
            Reply::error("ERR"),
            Reply::integer(3),
            Reply::bulk(Bytes::from_static(b"x")),
            Reply::null(),
            Reply::multi_bulk(vec![Bytes::from_static(b"a")]),
            Reply::empty(),
        ];
        for reply in replies {
            assert!(reply.encode().ends_with(CRLF), "{reply:?}");
        }
    }
}
