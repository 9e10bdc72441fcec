//! RESP Protocol Implementation
//!
//! This module provides the client half of the Redis Serialization Protocol
//! (RESP2): request framing and incremental reply parsing.
//!
//! ## Modules
//!
//! - `types`: Defines the `RespValue` reply enum and the `ResultShape` a caller expects
//! - `parser`: Incremental parser for replies arriving on a connection
//! - `command`: `Command`, framed as an array of bulk strings
//!
//! ## Example
//!
//! ```
//! use flashmux::protocol::{parse_message, Command, RespValue};
//!
//! let frame = Command::new("GET").key("name").to_frame();
//! assert_eq!(&frame[..], b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
//!
//! let (reply, consumed) = parse_message(b"$4\r\nAriz\r\n").unwrap().unwrap();
//! assert_eq!(reply, RespValue::bulk_string("Ariz"));
//! assert_eq!(consumed, 10);
//! ```

pub mod command;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use command::{Command, ReadPreference};
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{RespValue, ResultShape};
