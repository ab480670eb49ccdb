//! RESP frame types.
//!
//! [`Message`] represents a single parsed RESP value across both the
//! classic and extended type sets. Bulk payloads use `Bytes` for
//! reference-counted storage that avoids copies when a frame moves
//! between the client, upstream, and replication paths.

use bytes::Bytes;

use crate::serialize::format_double;

/// One-byte type tags for every RESP kind, partitioned into *simple*
/// kinds (value decoded eagerly from one line) and *aggregate* kinds
/// (a length header followed by payload bytes or child frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    SimpleString,
    Error,
    Integer,
    Null,
    Bool,
    Double,
    BigNumber,
    BulkString,
    BulkError,
    VerbatimString,
    Array,
    Set,
    Push,
    Map,
    Attribute,
}

impl Kind {
    /// Maps a wire prefix byte to its kind.
    pub fn from_byte(b: u8) -> Option<Kind> {
        Some(match b {
            b'+' => Kind::SimpleString,
            b'-' => Kind::Error,
            b':' => Kind::Integer,
            b'_' => Kind::Null,
            b'#' => Kind::Bool,
            b',' => Kind::Double,
            b'(' => Kind::BigNumber,
            b'$' => Kind::BulkString,
            b'!' => Kind::BulkError,
            b'=' => Kind::VerbatimString,
            b'*' => Kind::Array,
            b'~' => Kind::Set,
            b'>' => Kind::Push,
            b'%' => Kind::Map,
            b'`' => Kind::Attribute,
            _ => return None,
        })
    }

    /// The wire prefix byte for this kind.
    pub fn as_byte(self) -> u8 {
        match self {
            Kind::SimpleString => b'+',
            Kind::Error => b'-',
            Kind::Integer => b':',
            Kind::Null => b'_',
            Kind::Bool => b'#',
            Kind::Double => b',',
            Kind::BigNumber => b'(',
            Kind::BulkString => b'$',
            Kind::BulkError => b'!',
            Kind::VerbatimString => b'=',
            Kind::Array => b'*',
            Kind::Set => b'~',
            Kind::Push => b'>',
            Kind::Map => b'%',
            Kind::Attribute => b'`',
        }
    }

    /// True for kinds that carry a length header (bulk payloads and
    /// collections), false for the one-line simple kinds.
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Kind::BulkString
                | Kind::BulkError
                | Kind::VerbatimString
                | Kind::Array
                | Kind::Set
                | Kind::Push
                | Kind::Map
                | Kind::Attribute
        )
    }
}

/// A single RESP frame.
///
/// Exactly one payload shape is valid per kind. Simple kinds carry their
/// decoded value; bulk kinds carry raw bytes; collections carry child
/// frames in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Simple string, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Null, e.g. `_\r\n`.
    Null,

    /// Boolean, `#t\r\n` / `#f\r\n`.
    Bool(bool),

    /// Double-precision float, e.g. `,3.14\r\n`.
    Double(f64),

    /// Arbitrary-precision integer, kept as its decimal digits,
    /// e.g. `(3492890328409238509324850943850943825024385\r\n`.
    BigNumber(String),

    /// Binary-safe bulk string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Bulk error, e.g. `!21\r\nSYNTAX invalid syntax\r\n`.
    BulkError(Bytes),

    /// Verbatim string with a 3-byte encoding tag,
    /// e.g. `=15\r\ntxt:Some string\r\n`.
    Verbatim { encoding: [u8; 3], data: Bytes },

    /// Ordered array of frames, e.g. `*2\r\n+a\r\n+b\r\n`.
    Array(Vec<Message>),

    /// Set of frames, `~<n>` framing, element semantics left to callers.
    Set(Vec<Message>),

    /// Out-of-band push frame, `><n>` framing.
    Push(Vec<Message>),

    /// Ordered key-value pairs, e.g. `%1\r\n+key\r\n+val\r\n`.
    Map(Vec<(Message, Message)>),

    /// Attribute pairs attached to the following frame, `` `<n> `` framing.
    Attribute(Vec<(Message, Message)>),
}

impl Message {
    /// The kind tag for this message.
    pub fn kind(&self) -> Kind {
        match self {
            Message::Simple(_) => Kind::SimpleString,
            Message::Error(_) => Kind::Error,
            Message::Integer(_) => Kind::Integer,
            Message::Null => Kind::Null,
            Message::Bool(_) => Kind::Bool,
            Message::Double(_) => Kind::Double,
            Message::BigNumber(_) => Kind::BigNumber,
            Message::Bulk(_) => Kind::BulkString,
            Message::BulkError(_) => Kind::BulkError,
            Message::Verbatim { .. } => Kind::VerbatimString,
            Message::Array(_) => Kind::Array,
            Message::Set(_) => Kind::Set,
            Message::Push(_) => Kind::Push,
            Message::Map(_) => Kind::Map,
            Message::Attribute(_) => Kind::Attribute,
        }
    }

    /// Builds a client command frame: an array of bulk strings.
    pub fn command<I, T>(parts: I) -> Message
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Message::Array(
            parts
                .into_iter()
                .map(|p| Message::Bulk(Bytes::from(p.into().into_bytes())))
                .collect(),
        )
    }

    /// The number of bytes this message occupies on the wire: the leading
    /// kind byte, every CRLF, the base-10 length field, any verbatim
    /// encoding tag, and the payload. The replication subscriber adds this
    /// to its offset after each decoded frame.
    pub fn wire_size(&self) -> u64 {
        match self {
            Message::Simple(s) | Message::Error(s) | Message::BigNumber(s) => {
                line_size(s.len())
            }
            Message::Integer(n) => line_size(dec_width_i64(*n)),
            Message::Null => 3,
            Message::Bool(_) => 4,
            Message::Double(f) => line_size(format_double(*f).len()),
            Message::Bulk(data) | Message::BulkError(data) => {
                line_size(dec_width(data.len())) + data.len() as u64 + 2
            }
            Message::Verbatim { data, .. } => {
                // payload is "<enc3>:<data>"
                let payload = 3 + 1 + data.len();
                line_size(dec_width(payload)) + payload as u64 + 2
            }
            Message::Array(items) | Message::Set(items) | Message::Push(items) => {
                line_size(dec_width(items.len()))
                    + items.iter().map(Message::wire_size).sum::<u64>()
            }
            Message::Map(pairs) | Message::Attribute(pairs) => {
                line_size(dec_width(pairs.len()))
                    + pairs
                        .iter()
                        .map(|(k, v)| k.wire_size() + v.wire_size())
                        .sum::<u64>()
            }
        }
    }
}

/// Size of `<kind byte><body>\r\n` for a body of `body_len` bytes.
fn line_size(body_len: usize) -> u64 {
    1 + body_len as u64 + 2
}

/// Decimal width of an unsigned count or length field.
fn dec_width(n: usize) -> usize {
    let mut buf = itoa::Buffer::new();
    buf.format(n).len()
}

fn dec_width_i64(n: i64) -> usize {
    let mut buf = itoa::Buffer::new();
    buf.format(n).len()
}
