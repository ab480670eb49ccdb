//! The transactor: per-client proxy sessions plus the process-wide
//! replication consumer.
//!
//! A session forwards each client request to the upstream primary and
//! reads the reply, but a write's reply is withheld: the session locks
//! the write's keys and then waits on those same locks. The locks come
//! off only when the replication consumer has observed the write on
//! the replication stream and appended it to the durable log — the
//! rendezvous that turns "the upstream said OK" into "the write is
//! durable". Reads wait on whatever locks earlier writes left behind,
//! so a session never observes its own unconfirmed writes.

use std::io;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use anarcho_locks::{KeyLockStore, LockError};
use anarcho_protocol::{Command, Connection, Message, ProtocolError};

use crate::config::Config;
use crate::replication::Subscriber;
use crate::txnlog::{AppendError, Appender};

/// Errors that end a session or the replication consumer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("key lock error: {0}")]
    Lock(#[from] LockError),

    #[error("durable append failed: {0}")]
    Append(#[from] AppendError),

    #[error("could not dial upstream address {addr:?}: {source}")]
    Upstream { addr: String, source: io::Error },
}

/// Coordinates sessions, the key-lock table, the replication
/// subscriber, and the durable log. One per process; sessions share it
/// behind an `Arc`.
pub struct Transactor<A> {
    conf: Config,
    locks: KeyLockStore,
    subscriber: Arc<Subscriber>,
    appender: Arc<A>,
    /// Database selector most recently observed, fed to the appender.
    /// Sessions update it on client SELECTs and the consumer updates it
    /// from SELECTs on the replication stream.
    database: Arc<RwLock<String>>,
}

impl<A: Appender> Transactor<A> {
    pub fn new(
        conf: Config,
        locks: KeyLockStore,
        subscriber: Arc<Subscriber>,
        appender: Arc<A>,
    ) -> Transactor<A> {
        Transactor {
            conf,
            locks,
            subscriber,
            appender,
            database: Arc::new(RwLock::new("0".to_owned())),
        }
    }

    /// The shared replication subscriber.
    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    /// Runs the replication consumer: commits each replicated command
    /// to the durable log, then releases its key locks.
    ///
    /// One consumer per process. An append failure cancels `cancel`,
    /// taking the sessions down with it — without the log there is no
    /// durability to confirm.
    pub async fn run_consumer(
        &self,
        mut updates: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = updates.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    if let Err(e) = self.commit(&msg).await {
                        error!("replication commit failed: {e}");
                        cancel.cancel();
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Appends one replicated command and unlocks its keys.
    async fn commit(&self, msg: &Message) -> Result<(), SessionError> {
        let cmd = Command::from_message(msg)?;

        // the stream re-emits SELECT when the database changes; track
        // it so appends carry the right selector
        if cmd.name == "SELECT" {
            if let Some(db) = cmd.arg_text(0) {
                debug!(%db, "replication stream selected database");
                *self.database.write().expect("database selector poisoned") = db;
            }
        }

        let database = self
            .database
            .read()
            .expect("database selector poisoned")
            .clone();
        self.appender.append(msg, &database).await?;

        match cmd.keys() {
            Ok(keys) => self.locks.unlock_keys(&keys)?,
            Err(e) if e.is_benign() => {
                debug!(cmd = %cmd.name, "{e}; nothing to unlock");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Serves one client connection until it closes, errors, or the
    /// token fires.
    pub async fn transact(
        &self,
        client: TcpStream,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let mut client = Connection::new(client);

        let upstream = TcpStream::connect(&self.conf.redis_address)
            .await
            .map_err(|source| SessionError::Upstream {
                addr: self.conf.redis_address.clone(),
                source,
            })?;
        info!(addr = %self.conf.redis_address, "established upstream connection");
        let mut upstream = Connection::new(upstream);

        // per-session state: the database this client last selected
        let mut database = "0".to_owned();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                req = client.read_message() => {
                    let req = match req {
                        Ok(req) => req,
                        Err(ProtocolError::Eof) => {
                            debug!("client disconnected");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    };
                    self.proxy_one(req, &mut client, &mut upstream, &mut database, &cancel)
                        .await?;
                }
            }
        }
    }

    /// One request through the proxy: forward, classify, gate, reply.
    async fn proxy_one(
        &self,
        req: Message,
        client: &mut Connection<TcpStream>,
        upstream: &mut Connection<TcpStream>,
        database: &mut String,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        // forward verbatim, then collect the reply before any gating:
        // request order toward the upstream is never reordered
        upstream.write_message(&req).await?;
        let resp = upstream.read_message().await?;

        let cmd = match Command::from_message(&req) {
            Ok(cmd) => cmd,
            Err(e) => {
                // not an array of bulk strings; the upstream got it
                // verbatim, the client gets a protocol error
                warn!("unclassifiable request: {e}");
                client
                    .write_message(&Message::Error(format!("ERR {e}")))
                    .await?;
                return Ok(());
            }
        };

        if cmd.name == "SELECT" {
            if let Some(db) = cmd.arg_text(0) {
                debug!(%db, "session selected database");
                database.clone_from(&db);
                *self.database.write().expect("database selector poisoned") = db;
            }
        }

        match cmd.keys() {
            Ok(keys) => {
                // a write locks its own keys, then blocks on them below
                // until the replication consumer confirms durability
                if cmd.is_write() {
                    self.locks.lock_keys(&keys)?;
                }
                debug!(cmd = %cmd.name, db = %database, "awaiting release of locks");
                self.locks.await_unlocked(&keys, cancel).await?;
            }
            Err(e) if e.is_benign() => {
                debug!(cmd = %cmd.name, "{e}; forwarding without key handling");
            }
            Err(e) => return Err(e.into()),
        }

        client.write_message(&resp).await?;
        Ok(())
    }
}
