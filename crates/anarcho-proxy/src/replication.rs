//! Replication subscriber: attaches to the upstream primary as a
//! replica and streams its command feed.
//!
//! The subscriber dials the primary, performs the PSYNC handshake, and
//! then loops decoding the replication stream: replicated command
//! arrays are handed to the consumer channel, keepalives and metadata
//! are absorbed here, and every decoded frame advances the replication
//! offset by its wire size. A cooperative timer acknowledges the
//! offset with `REPLCONF ACK` every 900ms.
//!
//! A subscriber is single-use: once the primary has answered with
//! FULLRESYNC and the `started` signal has fired, a second
//! `stream_updates` call is refused.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use anarcho_protocol::{Connection, Kind, Message, ProtocolError};

/// How often the subscriber acknowledges its offset to the primary.
const ACK_INTERVAL: Duration = Duration::from_millis(900);

/// `REDIS` magic plus a four-digit version, e.g. `REDIS0011`.
const RDB_PREAMBLE_LEN: usize = 9;

/// Errors terminating a replication stream.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("could not reach primary: {0}")]
    Io(#[from] std::io::Error),

    #[error("primary terminated the stream: {0}")]
    Stream(String),

    #[error("malformed handshake reply: {0}")]
    Handshake(String),

    #[error("attempting to reuse a subscriber, which is not allowed")]
    AlreadyStarted,

    #[error("replication consumer went away")]
    ConsumerGone,
}

/// A replica-side subscription to the primary's replication stream.
pub struct Subscriber {
    leader_addr: String,
    my_addr: String,
    offset: AtomicI64,
    replication_id: RwLock<String>,
    started_tx: watch::Sender<bool>,
    did_signal: AtomicBool,
}

impl Subscriber {
    /// Creates a subscriber that will attach to `leader_addr` and
    /// advertise `my_addr` in REPLCONF.
    pub fn new(leader_addr: String, my_addr: String) -> Subscriber {
        let (started_tx, _) = watch::channel(false);
        Subscriber {
            leader_addr,
            my_addr,
            offset: AtomicI64::new(0),
            replication_id: RwLock::new(String::new()),
            started_tx,
            did_signal: AtomicBool::new(false),
        }
    }

    /// The replication offset: bytes of the stream consumed so far.
    /// Written by the stream task only; safe for concurrent readers.
    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// The replication id negotiated with the primary. Empty until the
    /// handshake completes.
    pub fn replication_id(&self) -> String {
        self.replication_id
            .read()
            .expect("replication id poisoned")
            .clone()
    }

    /// A receiver that flips to `true` once, when the primary confirms
    /// the resync and streaming begins.
    pub fn started(&self) -> watch::Receiver<bool> {
        self.started_tx.subscribe()
    }

    /// Attaches to the primary and streams replicated command arrays
    /// into `updates` until cancelled or the stream fails.
    ///
    /// Blocks for the life of the stream. Refuses to run twice on the
    /// same subscriber.
    pub async fn stream_updates(
        &self,
        cancel: CancellationToken,
        updates: mpsc::Sender<Message>,
    ) -> Result<(), ReplicationError> {
        if self.did_signal.load(Ordering::SeqCst) {
            return Err(ReplicationError::AlreadyStarted);
        }

        let conn = self.start_replication().await?;
        let (mut reader, writer) = conn.into_split();
        // the decode loop and the ack timer share the write half; the
        // lock is never held across a read, so frames can't interleave
        let writer = Mutex::new(writer);

        let result = tokio::select! {
            res = self.read_loop(&mut reader, &writer, &updates) => res,
            _ = self.ack_loop(&writer) => unreachable!("ack loop never returns"),
            _ = cancel.cancelled() => Ok(()),
        };

        // best-effort final ack so the primary sees our last offset
        let _ = writer
            .lock()
            .await
            .write_message(&replconf_ack(self.offset()))
            .await;

        result
    }

    /// Acknowledges the current offset every [`ACK_INTERVAL`].
    async fn ack_loop(&self, writer: &Mutex<Connection<OwnedWriteHalf>>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + ACK_INTERVAL,
            ACK_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            // transient ack failures are tolerated; the next tick retries
            let ack = replconf_ack(self.offset());
            if let Err(e) = writer.lock().await.write_message(&ack).await {
                warn!("replconf ack failed: {e}");
            }
        }
    }

    async fn read_loop(
        &self,
        reader: &mut Connection<OwnedReadHalf>,
        writer: &Mutex<Connection<OwnedWriteHalf>>,
        updates: &mpsc::Sender<Message>,
    ) -> Result<(), ReplicationError> {
        loop {
            let msg = reader.read_message().await?;
            let full_resync = self.handle(msg, writer, updates).await?;

            if full_resync && reader.peek_kind().await? == Kind::BulkString {
                // the snapshot body; discard in bounded chunks while
                // still counting its bytes into the offset
                let mut preamble = [0u8; RDB_PREAMBLE_LEN];
                let skipped = reader.skip_bulk(&mut preamble).await?;
                if !is_rdb_preamble(&preamble) {
                    return Err(ReplicationError::Stream(
                        "expected an RDB snapshot after FULLRESYNC".into(),
                    ));
                }
                info!(skipped, "skipped snapshot payload");
                self.offset.fetch_add(skipped as i64, Ordering::SeqCst);
            }
        }
    }

    /// Dispatches one decoded frame. Returns true when the frame was a
    /// FULLRESYNC reply, i.e. a snapshot payload is expected next.
    async fn handle(
        &self,
        msg: Message,
        writer: &Mutex<Connection<OwnedWriteHalf>>,
        updates: &mpsc::Sender<Message>,
    ) -> Result<bool, ReplicationError> {
        let wire = msg.wire_size();
        debug!(kind = ?msg.kind(), wire, "replication frame");

        match msg {
            Message::Simple(text) => {
                let mut parts = text.split(' ');
                match parts.next() {
                    Some("FULLRESYNC") => {
                        let replid = parts
                            .next()
                            .ok_or_else(|| bad_handshake(&text))?
                            .to_owned();
                        let offset: i64 = parts
                            .next()
                            .and_then(|raw| raw.parse().ok())
                            .ok_or_else(|| bad_handshake(&text))?;

                        info!(%replid, offset, "full resync");
                        *self
                            .replication_id
                            .write()
                            .expect("replication id poisoned") = replid;
                        self.offset.store(offset, Ordering::SeqCst);
                        self.broadcast_started();

                        // the handshake reply itself sets the offset
                        // rather than advancing it
                        return Ok(true);
                    }
                    Some("CONTINUE") => {
                        if let Some(replid) = parts.next() {
                            *self
                                .replication_id
                                .write()
                                .expect("replication id poisoned") = replid.to_owned();
                        }
                        info!("partial resync continues");
                        return Ok(false);
                    }
                    Some("PING") => {
                        info!("got PING; sending PONG");
                        let pong = Message::command(["PONG"]);
                        if let Err(e) = writer.lock().await.write_message(&pong).await {
                            warn!("pong failed: {e}");
                        }
                    }
                    _ => info!(msg = %text, "replication metadata"),
                }
            }
            Message::Array(ref items) => match leading_name(items) {
                Some(name) if name.eq_ignore_ascii_case("PING") => {
                    debug!("replication keepalive");
                }
                Some(name) if name.eq_ignore_ascii_case("REPLCONF") => {
                    // back-channel from the primary, GETACK included;
                    // the ack cadence already covers liveness
                    info!("received REPLCONF");
                }
                _ => {
                    updates
                        .send(msg)
                        .await
                        .map_err(|_| ReplicationError::ConsumerGone)?;
                }
            },
            Message::Error(text) => return Err(ReplicationError::Stream(text)),
            other => debug!(kind = ?other.kind(), "ignoring replication frame"),
        }

        self.offset.fetch_add(wire as i64, Ordering::SeqCst);
        Ok(false)
    }

    /// Dials the primary and walks the handshake: PING, REPLCONF, then
    /// PSYNC. The PSYNC reply is left on the wire for the stream loop,
    /// which owns FULLRESYNC/CONTINUE handling.
    async fn start_replication(&self) -> Result<Connection<TcpStream>, ReplicationError> {
        let stream = TcpStream::connect(&self.leader_addr).await?;
        let mut conn = Connection::new(stream);

        info!(leader = %self.leader_addr, me = %self.my_addr, "start replication");

        let (host, port) = self
            .my_addr
            .rsplit_once(':')
            .ok_or_else(|| {
                ReplicationError::Handshake(format!("listen address '{}' has no port", self.my_addr))
            })?;

        let reply = conn.round_trip(&Message::command(["PING"])).await?;
        match reply {
            Message::Simple(_) => {}
            other => {
                return Err(ReplicationError::Handshake(format!(
                    "unexpected PING reply of kind {:?}",
                    other.kind()
                )));
            }
        }

        let replconf = Message::command([
            "REPLCONF",
            "listening-port",
            port,
            "ip-address",
            host,
            "capa",
            "psync2",
        ]);
        let reply = conn.round_trip(&replconf).await?;
        debug!(?reply, "replconf acknowledged");

        let replid = {
            let id = self
                .replication_id
                .read()
                .expect("replication id poisoned");
            if id.is_empty() {
                "?".to_owned()
            } else {
                id.clone()
            }
        };
        let offset = self.offset().to_string();
        conn.write_message(&Message::command(["PSYNC", replid.as_str(), offset.as_str()]))
            .await?;

        Ok(conn)
    }

    fn broadcast_started(&self) {
        if !self.did_signal.swap(true, Ordering::SeqCst) {
            let _ = self.started_tx.send(true);
        }
    }
}

fn replconf_ack(offset: i64) -> Message {
    let offset = offset.to_string();
    Message::command(["REPLCONF", "ACK", offset.as_str()])
}

fn bad_handshake(text: &str) -> ReplicationError {
    ReplicationError::Handshake(format!("malformed resync reply '{text}'"))
}

/// First element of a command array, decoded as text.
fn leading_name(items: &[Message]) -> Option<String> {
    match items.first() {
        Some(Message::Bulk(data)) => Some(String::from_utf8_lossy(data).into_owned()),
        Some(Message::Simple(s)) => Some(s.clone()),
        _ => None,
    }
}

fn is_rdb_preamble(preamble: &[u8; RDB_PREAMBLE_LEN]) -> bool {
    preamble.starts_with(b"REDIS") && preamble[5..].iter().all(u8::is_ascii_digit)
}
