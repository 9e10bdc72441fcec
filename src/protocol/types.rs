//! RESP (Redis Serialization Protocol) Reply Types
//!
//! This module defines the values a server sends back over a multiplexed
//! connection, plus the `ResultShape` a caller declares when it submits a
//! command.
//!
//! ## Protocol Format
//!
//! Each RESP type starts with a type prefix byte:
//! - `+` Simple String
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//!
//! All types are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Simple String: `+OK\r\n`
//! Error: `-ERR unknown command\r\n`
//! Integer: `:1000\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Array: `*2\r\n$7\r\nmessage\r\n$4\r\nnews\r\n`
//! Null Bulk String: `$-1\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// Pub/sub push kinds that arrive unsolicited on a subscription connection.
const PUSH_KINDS: [&[u8]; 3] = [b"message", b"pmessage", b"smessage"];

/// Represents a value in the RESP protocol.
///
/// Replies are parsed into this enum by the connection reader. The fake
/// servers in the test suite use `serialize` to produce wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple strings are used for non-binary safe status replies.
    /// Format: `+<string>\r\n`
    SimpleString(String),

    /// Errors are similar to simple strings but indicate an error condition.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// 64-bit signed integers.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Bulk strings are binary-safe strings up to 512 MB.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null value (null bulk string or null array)
    Null,

    /// Arrays can contain any RESP type, including nested arrays.
    /// Format: `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Creates a new simple string value.
    ///
    /// # Example
    /// ```
    /// use flashmux::protocol::types::RespValue;
    /// let ok = RespValue::simple_string("OK");
    /// ```
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates a new error value.
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Creates a new integer value.
    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a new bulk string value.
    ///
    /// # Example
    /// ```
    /// use flashmux::protocol::types::RespValue;
    /// use bytes::Bytes;
    /// let bulk = RespValue::bulk_string(Bytes::from("hello"));
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates a null value.
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Creates an array value.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the RESP value to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the RESP value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Returns true if this is an unsolicited pub/sub delivery
    /// (`message`, `pmessage` or `smessage` array).
    pub fn is_push(&self) -> bool {
        match self {
            RespValue::Array(items) => match items.first() {
                Some(RespValue::BulkString(kind)) => {
                    PUSH_KINDS.iter().any(|k| kind.eq_ignore_ascii_case(k))
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Attempts to extract the inner string from SimpleString or BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Attempts to extract the inner bytes from BulkString.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Attempts to extract the inner integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Attempts to extract the inner array.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Consumes self and returns the inner array if this is an Array variant.
    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Short type label used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple-string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk-string",
            RespValue::Null => "null",
            RespValue::Array(_) => "array",
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

/// The reply shape a caller expects for a submitted command.
///
/// Error replies always fail the command with a server error; any other
/// reply that does not fit the declared shape fails it with an
/// unexpected-reply error. Null is accepted wherever a bulk string or an
/// array is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    /// Accept any non-error reply.
    #[default]
    Any,
    /// `+OK`
    Ok,
    /// Any simple string.
    Status,
    Integer,
    /// Bulk string or null.
    Bulk,
    /// Array or null.
    Array,
}

impl ResultShape {
    /// Returns true if `value` satisfies this shape.
    pub fn accepts(&self, value: &RespValue) -> bool {
        match (self, value) {
            (_, RespValue::Error(_)) => false,
            (ResultShape::Any, _) => true,
            (ResultShape::Ok, RespValue::SimpleString(s)) => s == "OK",
            (ResultShape::Status, RespValue::SimpleString(_)) => true,
            (ResultShape::Integer, RespValue::Integer(_)) => true,
            (ResultShape::Bulk, RespValue::BulkString(_) | RespValue::Null) => true,
            (ResultShape::Array, RespValue::Array(_) | RespValue::Null) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultShape::Any => "any",
            ResultShape::Ok => "ok",
            ResultShape::Status => "status",
            ResultShape::Integer => "integer",
            ResultShape::Bulk => "bulk-string",
            ResultShape::Array => "array",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string_serialize() {
        let value = RespValue::simple_string("OK");
        assert_eq!(value.serialize(), b"+OK\r\n");
    }

    #[test]
    fn test_error_serialize() {
        let value = RespValue::error("ERR unknown command");
        assert_eq!(value.serialize(), b"-ERR unknown command\r\n");
    }

    #[test]
    fn test_bulk_string_serialize() {
        let value = RespValue::bulk_string(Bytes::from("hello"));
        assert_eq!(value.serialize(), b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_nested_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::integer(1),
            RespValue::array(vec![RespValue::integer(2), RespValue::integer(3)]),
        ]);
        assert_eq!(value.serialize(), b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n");
    }

    #[test]
    fn test_push_detection() {
        let push = RespValue::array(vec![
            RespValue::bulk_string("message"),
            RespValue::bulk_string("news"),
            RespValue::bulk_string("hello"),
        ]);
        assert!(push.is_push());

        let confirmation = RespValue::array(vec![
            RespValue::bulk_string("subscribe"),
            RespValue::bulk_string("news"),
            RespValue::integer(1),
        ]);
        assert!(!confirmation.is_push());
        assert!(!RespValue::ok().is_push());
    }

    #[test]
    fn test_shape_accepts() {
        assert!(ResultShape::Ok.accepts(&RespValue::ok()));
        assert!(!ResultShape::Ok.accepts(&RespValue::pong()));
        assert!(ResultShape::Status.accepts(&RespValue::pong()));
        assert!(ResultShape::Integer.accepts(&RespValue::integer(7)));
        assert!(!ResultShape::Integer.accepts(&RespValue::bulk_string("7")));
        assert!(ResultShape::Bulk.accepts(&RespValue::Null));
        assert!(ResultShape::Array.accepts(&RespValue::array(vec![])));
        assert!(ResultShape::Any.accepts(&RespValue::Null));
    }

    #[test]
    fn test_shape_never_accepts_errors() {
        let err = RespValue::error("ERR nope");
        assert!(!ResultShape::Any.accepts(&err));
        assert!(!ResultShape::Status.accepts(&err));
    }
}
