//! Durable transaction log.
//!
//! The [`Appender`] trait is the proxy's durability boundary: a
//! replicated command is confirmed to the client only after
//! `append` returns. The bundled [`FileAppender`] writes an
//! append-only file; anything that can persist bytes and report
//! success honestly can stand in for it.
//!
//! File layout:
//! ```text
//! [ALOG magic: 4B][version: 1B]
//! [record]*
//! ```
//!
//! Record layout (all integers little-endian):
//! ```text
//! [db_len: 4B][db bytes][frame_len: 4B][frame bytes][crc32: 4B]
//! ```
//! The frame bytes are the command's full RESP wire representation.
//! The CRC32 covers the db and frame fields including their lengths.

use std::future::Future;
use std::io::{self, Read};
use std::path::Path;

use bytes::BytesMut;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use anarcho_protocol::{Message, ProtocolError};

/// Magic bytes for the log file header.
pub const LOG_MAGIC: &[u8; 4] = b"ALOG";

/// Current log format version.
pub const LOG_VERSION: u8 = 1;

/// Errors from the durable log.
#[derive(Debug, Error)]
pub enum AppendError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unencodable message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid log header")]
    InvalidHeader,

    #[error("unsupported log version: {0}")]
    UnsupportedVersion(u8),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// When the log file is flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every record. The only policy under which "appended"
    /// strictly means "on disk".
    Always,
    /// fsync at most once per second.
    EverySec,
    /// Leave flushing to the OS.
    No,
}

/// The durable log the replication consumer writes to.
///
/// `append` receives the replicated command's frame and the database
/// selector in effect on the replication stream. Success means
/// "durably persisted"; failure cancels the consumer and, transitively,
/// the transactor.
pub trait Appender: Send + Sync + 'static {
    fn append(
        &self,
        message: &Message,
        database: &str,
    ) -> impl Future<Output = Result<(), AppendError>> + Send;
}

struct LogFile {
    file: File,
    last_sync: Instant,
}

/// Append-only file implementation of [`Appender`].
pub struct FileAppender {
    inner: Mutex<LogFile>,
    policy: FsyncPolicy,
}

impl FileAppender {
    /// Opens (or creates) the log at `path`. A fresh file gets the
    /// magic/version header; an existing one keeps appending after it.
    pub async fn open(path: &Path, policy: FsyncPolicy) -> Result<FileAppender, AppendError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        if file.metadata().await?.len() == 0 {
            file.write_all(LOG_MAGIC).await?;
            file.write_all(&[LOG_VERSION]).await?;
            file.sync_data().await?;
            debug!(path = %path.display(), "created transaction log");
        }

        Ok(FileAppender {
            inner: Mutex::new(LogFile {
                file,
                last_sync: Instant::now(),
            }),
            policy,
        })
    }
}

impl Appender for FileAppender {
    async fn append(&self, message: &Message, database: &str) -> Result<(), AppendError> {
        let mut frame = BytesMut::new();
        message.serialize(&mut frame)?;

        let mut record = Vec::with_capacity(frame.len() + database.len() + 12);
        record.extend_from_slice(&(database.len() as u32).to_le_bytes());
        record.extend_from_slice(database.as_bytes());
        record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        record.extend_from_slice(&frame);
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        let mut inner = self.inner.lock().await;
        inner.file.write_all(&record).await?;
        match self.policy {
            FsyncPolicy::Always => inner.file.sync_data().await?,
            FsyncPolicy::EverySec => {
                if inner.last_sync.elapsed() >= std::time::Duration::from_secs(1) {
                    inner.file.sync_data().await?;
                    inner.last_sync = Instant::now();
                }
            }
            FsyncPolicy::No => {}
        }
        Ok(())
    }
}

/// One record read back from a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub database: String,
    pub frame: Vec<u8>,
}

/// Reads a whole log file back, verifying the header and every
/// record's checksum. Synchronous; meant for recovery tooling and
/// tests, not the hot path.
pub fn read_log(path: &Path) -> Result<Vec<LogRecord>, AppendError> {
    let mut file = std::fs::File::open(path)?;

    let mut header = [0u8; 5];
    file.read_exact(&mut header)?;
    if &header[..4] != LOG_MAGIC {
        return Err(AppendError::InvalidHeader);
    }
    if header[4] != LOG_VERSION {
        return Err(AppendError::UnsupportedVersion(header[4]));
    }

    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let db_len = u32::from_le_bytes(len_buf) as usize;
        let mut db = vec![0u8; db_len];
        file.read_exact(&mut db)?;

        file.read_exact(&mut len_buf)?;
        let frame_len = u32::from_le_bytes(len_buf) as usize;
        let mut frame = vec![0u8; frame_len];
        file.read_exact(&mut frame)?;

        let mut crc_buf = [0u8; 4];
        file.read_exact(&mut crc_buf)?;
        let expected = u32::from_le_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(db_len as u32).to_le_bytes());
        hasher.update(&db);
        hasher.update(&(frame_len as u32).to_le_bytes());
        hasher.update(&frame);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(AppendError::ChecksumMismatch { expected, actual });
        }

        records.push(LogRecord {
            database: String::from_utf8_lossy(&db).into_owned(),
            frame,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("test.txnlog")
    }

    #[tokio::test]
    async fn append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        let appender = FileAppender::open(&path, FsyncPolicy::Always).await.unwrap();
        let set = Message::command(["SET", "k", "v"]);
        let mset = Message::command(["MSET", "a", "1", "b", "2"]);
        appender.append(&set, "0").await.unwrap();
        appender.append(&mset, "3").await.unwrap();

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].database, "0");
        assert_eq!(records[1].database, "3");

        // frames are the commands' exact wire bytes
        let mut wire = BytesMut::new();
        set.serialize(&mut wire).unwrap();
        assert_eq!(records[0].frame, &wire[..]);
    }

    #[tokio::test]
    async fn reopen_appends_after_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        {
            let appender = FileAppender::open(&path, FsyncPolicy::Always).await.unwrap();
            appender
                .append(&Message::command(["SET", "a", "1"]), "0")
                .await
                .unwrap();
        }
        {
            let appender = FileAppender::open(&path, FsyncPolicy::Always).await.unwrap();
            appender
                .append(&Message::command(["SET", "b", "2"]), "0")
                .await
                .unwrap();
        }

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn corrupted_record_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);

        let appender = FileAppender::open(&path, FsyncPolicy::Always).await.unwrap();
        appender
            .append(&Message::command(["SET", "k", "v"]), "0")
            .await
            .unwrap();
        drop(appender);

        // flip a byte inside the record body
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() - 8;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = read_log(&path).unwrap_err();
        assert!(matches!(err, AppendError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(&dir);
        std::fs::write(&path, b"NOPE\x01").unwrap();

        let err = read_log(&path).unwrap_err();
        assert!(matches!(err, AppendError::InvalidHeader));
    }
}
