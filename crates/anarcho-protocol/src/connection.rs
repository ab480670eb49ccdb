//! Framed RESP connection.
//!
//! Wraps a byte stream and speaks whole [`Message`]s: reads go through
//! an incremental buffer that retries until a full frame has arrived,
//! writes serialize into a scratch buffer and flush in bounded chunks.
//!
//! A connection is exclusively owned by one task for its lifetime; the
//! replication subscriber uses [`Connection::into_split`] to hand the
//! read half to the decode loop and the write half to the ack timer.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::ProtocolError;
use crate::parse::parse_message;
use crate::types::{Kind, Message};

/// Initial read buffer capacity; covers typical commands without
/// over-allocating.
const BUF_CAPACITY: usize = 4096;

/// Hard cap on the read buffer: one maximum-size bulk payload plus
/// framing. A peer that exceeds it is speaking garbage.
const MAX_BUF_SIZE: usize = 512 * 1024 * 1024 + 64 * 1024;

/// Write granularity for serialized frames.
const WRITE_CHUNK: usize = 4096;

/// Read granularity while discarding a skipped bulk payload.
const SKIP_CHUNK: usize = 64 * 1024;

/// A framed RESP connection over any byte stream.
pub struct Connection<S> {
    stream: S,
    buf: BytesMut,
}

impl<S> Connection<S> {
    pub fn new(stream: S) -> Self {
        Connection {
            stream,
            buf: BytesMut::with_capacity(BUF_CAPACITY),
        }
    }
}

impl Connection<TcpStream> {
    /// Splits into independently-owned read and write halves. Bytes
    /// already buffered stay with the read half.
    pub fn into_split(self) -> (Connection<OwnedReadHalf>, Connection<OwnedWriteHalf>) {
        let (rd, wr) = self.stream.into_split();
        (
            Connection {
                stream: rd,
                buf: self.buf,
            },
            Connection {
                stream: wr,
                buf: BytesMut::new(),
            },
        )
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// Reads one complete frame, waiting for as many socket reads as the
    /// framing needs. CRLF and payload bytes may arrive in arbitrarily
    /// small chunks.
    ///
    /// A closed stream — whether before the first byte or mid-frame —
    /// is [`ProtocolError::Eof`].
    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        loop {
            if let Some((msg, consumed)) = parse_message(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(msg);
            }
            if self.buf.len() > MAX_BUF_SIZE {
                return Err(ProtocolError::Syntax(
                    "frame exceeds maximum buffered size".into(),
                ));
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(ProtocolError::Eof);
            }
        }
    }

    /// Returns the kind of the next frame without consuming it. Stray
    /// CRLF bytes before the frame are discarded.
    pub async fn peek_kind(&mut self) -> Result<Kind, ProtocolError> {
        loop {
            match self.buf.first().copied() {
                Some(b'\r') | Some(b'\n') => {
                    self.buf.advance(1);
                }
                Some(b) => {
                    return Kind::from_byte(b).ok_or(ProtocolError::UnknownKind(b));
                }
                None => {
                    if self.stream.read_buf(&mut self.buf).await? == 0 {
                        return Err(ProtocolError::Eof);
                    }
                }
            }
        }
    }

    /// Consumes one bulk frame without retaining its payload, reading
    /// and discarding in bounded chunks. The payload never lands in
    /// memory whole, which is what makes multi-gigabyte snapshot frames
    /// survivable.
    ///
    /// Up to `preview.len()` leading payload bytes are copied into
    /// `preview` so the caller can inspect a magic header. Returns the
    /// frame's total wire size.
    pub async fn skip_bulk(&mut self, preview: &mut [u8]) -> Result<u64, ProtocolError> {
        let (len, header) = loop {
            if let Some(parsed) = parse_bulk_header(&self.buf)? {
                break parsed;
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(ProtocolError::Eof);
            }
        };
        self.buf.advance(header);

        let mut payload_left = len;
        let mut previewed = 0usize;
        while payload_left > 0 {
            if self.buf.is_empty() {
                self.buf.reserve(SKIP_CHUNK.min(payload_left + 2));
                if self.stream.read_buf(&mut self.buf).await? == 0 {
                    return Err(ProtocolError::Eof);
                }
            }
            let take = self.buf.len().min(payload_left);
            if previewed < preview.len() {
                let n = (preview.len() - previewed).min(take);
                preview[previewed..previewed + n].copy_from_slice(&self.buf[..n]);
                previewed += n;
            }
            self.buf.advance(take);
            payload_left -= take;
        }

        for expected in *b"\r\n" {
            if self.buf.is_empty() && self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(ProtocolError::Eof);
            }
            if self.buf[0] != expected {
                return Err(ProtocolError::Syntax(
                    "bulk payload not terminated by CRLF".into(),
                ));
            }
            self.buf.advance(1);
        }

        Ok((header + len + 2) as u64)
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// Serializes `msg` and writes it out in bounded chunks, flushing at
    /// the end. Returns the number of bytes put on the wire.
    pub async fn write_message(&mut self, msg: &Message) -> Result<u64, ProtocolError> {
        let mut out = BytesMut::with_capacity(256);
        let written = msg.serialize(&mut out)?;
        while !out.is_empty() {
            let take = out.len().min(WRITE_CHUNK);
            self.stream.write_all(&out[..take]).await?;
            out.advance(take);
        }
        self.stream.flush().await?;
        Ok(written)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Writes `msg`, flushes, and reads one reply.
    pub async fn round_trip(&mut self, msg: &Message) -> Result<Message, ProtocolError> {
        self.write_message(msg).await?;
        self.read_message().await
    }
}

/// Parses a `$<len>\r\n` bulk header from the front of `buf`, returning
/// the payload length and the header's byte count, or `None` when the
/// header hasn't fully arrived.
fn parse_bulk_header(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'$' {
        return Err(ProtocolError::InvalidMessage(
            "expected a bulk string frame".into(),
        ));
    }
    let Some(cr) = memchr::memchr(b'\r', buf) else {
        return Ok(None);
    };
    if cr + 1 >= buf.len() {
        return Ok(None);
    }
    if buf[cr + 1] != b'\n' {
        return Err(ProtocolError::Syntax("missing CRLF after bulk length".into()));
    }
    let len = std::str::from_utf8(&buf[1..cr])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            ProtocolError::Syntax(format!(
                "invalid bulk length {:?}",
                String::from_utf8_lossy(&buf[1..cr])
            ))
        })?;
    Ok(Some((len, cr + 2)))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn read_one_message() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(server);

        let mut client = client;
        client.write_all(b"+OK\r\n").await.unwrap();

        let msg = conn.read_message().await.unwrap();
        assert_eq!(msg, Message::Simple("OK".into()));
    }

    #[tokio::test]
    async fn read_across_tiny_chunks() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(server);

        let wire: &[u8] = b"*2\r\n$3\r\nGET\r\n$5\r\nmykey\r\n";
        let writer = tokio::spawn(async move {
            let mut client = client;
            for byte in wire {
                client.write_all(&[*byte]).await.unwrap();
                client.flush().await.unwrap();
            }
            client
        });

        let msg = conn.read_message().await.unwrap();
        assert_eq!(
            msg,
            Message::Array(vec![
                Message::Bulk(Bytes::from_static(b"GET")),
                Message::Bulk(Bytes::from_static(b"mykey")),
            ])
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_before_any_byte() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut conn = Connection::new(server);
        let err = conn.read_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Eof));
    }

    #[tokio::test]
    async fn eof_mid_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"$10\r\nhel").await.unwrap();
        drop(client);

        let mut conn = Connection::new(server);
        let err = conn.read_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Eof));
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = Connection::new(client);
        let mut reader = Connection::new(server);

        let msg = Message::command(["SET", "k", "v"]);
        let n = writer.write_message(&msg).await.unwrap();
        assert_eq!(n, msg.wire_size());

        let echoed = reader.read_message().await.unwrap();
        assert_eq!(echoed, msg);
    }

    #[tokio::test]
    async fn round_trip_exchanges_one_reply() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        let peer = tokio::spawn(async move {
            let mut peer = Connection::new(server);
            let req = peer.read_message().await.unwrap();
            assert_eq!(req, Message::command(["PING"]));
            peer.write_message(&Message::Simple("PONG".into()))
                .await
                .unwrap();
        });

        let reply = conn.round_trip(&Message::command(["PING"])).await.unwrap();
        assert_eq!(reply, Message::Simple("PONG".into()));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\r\n:5\r\n").await.unwrap();

        let mut conn = Connection::new(server);
        assert_eq!(conn.peek_kind().await.unwrap(), Kind::Integer);
        assert_eq!(conn.read_message().await.unwrap(), Message::Integer(5));
    }

    #[tokio::test]
    async fn skip_bulk_discards_payload_and_counts_wire_bytes() {
        let (client, server) = tokio::io::duplex(256);
        let mut conn = Connection::new(server);

        let payload = vec![b'x'; 200_000];
        let writer = tokio::spawn(async move {
            let mut client = client;
            client
                .write_all(format!("${}\r\n", 200_000).as_bytes())
                .await
                .unwrap();
            client.write_all(&payload).await.unwrap();
            client.write_all(b"\r\n+next\r\n").await.unwrap();
            client
        });

        let mut preview = [0u8; 9];
        let skipped = conn.skip_bulk(&mut preview).await.unwrap();
        // $200000\r\n + payload + \r\n
        assert_eq!(skipped, 9 + 200_000 + 2);
        assert_eq!(&preview, b"xxxxxxxxx");

        // the stream position is exactly past the bulk frame
        let next = conn.read_message().await.unwrap();
        assert_eq!(next, Message::Simple("next".into()));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn skip_bulk_rejects_missing_trailer() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"$3\r\nabcXX").await.unwrap();

        let mut conn = Connection::new(server);
        let err = conn.skip_bulk(&mut []).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Syntax(_)));
    }
}
