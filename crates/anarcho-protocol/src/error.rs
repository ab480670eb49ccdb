//! Protocol error types for RESP parsing, encoding, and classification.

use thiserror::Error;

/// Errors that can occur on the RESP wire or in the command classifier.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The stream closed before a full frame could be read.
    #[error("stream closed mid-message")]
    Eof,

    /// The first byte of a frame didn't match any known RESP type prefix.
    #[error("unknown type prefix: {0:#04x}")]
    UnknownKind(u8),

    /// Malformed frame contents: a bad length field, a non-numeric byte
    /// where a number was expected, an invalid boolean, a missing CRLF.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The encoder was handed a message it cannot represent on the wire.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The frame is not a well-formed command (not an array of bulk
    /// strings, or an empty one).
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The classifier has no entry for this command name. Non-fatal:
    /// the proxy forwards the command and skips key handling.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The command's key extractor needs more (or differently shaped)
    /// arguments than were supplied. Non-fatal, like [`UnknownCommand`].
    ///
    /// [`UnknownCommand`]: ProtocolError::UnknownCommand
    #[error("wrong number of arguments for '{0}'")]
    UnsupportedArity(String),

    /// Socket-level failure underneath the codec.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for the classifier outcomes a session survives: the command
    /// is still forwarded upstream, only lock/await handling is skipped.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownCommand(_) | ProtocolError::UnsupportedArity(_)
        )
    }
}
