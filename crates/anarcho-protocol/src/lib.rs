//! anarcho-protocol: RESP wire protocol implementation.
//!
//! Provides incremental parsing, direct-to-buffer serialization, framed
//! async connections, and command classification for the RESP protocol
//! spoken on both the client-facing and upstream-facing sockets.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use anarcho_protocol::{parse_message, Message};
//!
//! // parse a simple string
//! let (msg, consumed) = parse_message(b"+OK\r\n").unwrap().unwrap();
//! assert_eq!(msg, Message::Simple("OK".into()));
//! assert_eq!(consumed, 5);
//!
//! // serialize a frame
//! let mut buf = BytesMut::new();
//! msg.serialize(&mut buf).unwrap();
//! assert_eq!(&buf[..], b"+OK\r\n");
//! ```

pub mod command;
pub mod connection;
pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use command::{spec_for, Command, CommandSpec, KeyExtractor};
pub use connection::Connection;
pub use error::ProtocolError;
pub use parse::parse_message;
pub use types::{Kind, Message};
