//! Direct-to-buffer RESP serialization.
//!
//! Writes frames into a `BytesMut` with no intermediate allocations.
//! Integer-to-string conversion uses `itoa` for fast stack-based
//! formatting.

use bytes::{BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::types::Message;

impl Message {
    /// Serializes this frame into `dst`, returning the number of bytes
    /// written.
    ///
    /// Writes the full wire representation: type prefix, length fields,
    /// payload, and trailing `\r\n` delimiters. An [`Message::Error`]
    /// with empty text is rejected — an empty error line is
    /// indistinguishable from framing noise on the wire.
    pub fn serialize(&self, dst: &mut BytesMut) -> Result<u64, ProtocolError> {
        let start = dst.len();
        self.write_to(dst)?;
        Ok((dst.len() - start) as u64)
    }

    fn write_to(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Message::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Message::Error(msg) => {
                if msg.is_empty() {
                    return Err(ProtocolError::InvalidMessage(
                        "error frame with empty text".into(),
                    ));
                }
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Message::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Message::Null => {
                dst.put_slice(b"_\r\n");
            }
            Message::Bool(b) => {
                dst.put_slice(if *b { b"#t\r\n" } else { b"#f\r\n" });
            }
            Message::Double(f) => {
                dst.put_u8(b',');
                dst.put_slice(format_double(*f).as_bytes());
                dst.put_slice(b"\r\n");
            }
            Message::BigNumber(digits) => {
                dst.put_u8(b'(');
                dst.put_slice(digits.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Message::Bulk(data) => write_bulk(b'$', data, dst),
            Message::BulkError(data) => write_bulk(b'!', data, dst),
            Message::Verbatim { encoding, data } => {
                dst.put_u8(b'=');
                write_i64((3 + 1 + data.len()) as i64, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(encoding);
                dst.put_u8(b':');
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Message::Array(items) | Message::Set(items) | Message::Push(items) => {
                dst.put_u8(self.kind().as_byte());
                write_i64(items.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.write_to(dst)?;
                }
            }
            Message::Map(pairs) | Message::Attribute(pairs) => {
                dst.put_u8(self.kind().as_byte());
                write_i64(pairs.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for (key, val) in pairs {
                    key.write_to(dst)?;
                    val.write_to(dst)?;
                }
            }
        }
        Ok(())
    }
}

fn write_bulk(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.put_u8(prefix);
    write_i64(data.len() as i64, dst);
    dst.put_slice(b"\r\n");
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// Writes an i64 as its decimal ASCII representation.
fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}

/// Formats a double the way it goes on the wire: `inf`, `-inf`, and
/// `nan` spelled out, finite values in shortest decimal form.
pub(crate) fn format_double(f: f64) -> String {
    if f.is_nan() {
        "nan".to_owned()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else {
        format!("{f}")
    }
}
