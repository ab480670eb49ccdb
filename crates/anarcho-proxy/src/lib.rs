//! anarcho-proxy: a transactional proxy for a primary-replica
//! key-value server.
//!
//! Clients connect here instead of the upstream primary. Every command
//! is forwarded, but the success reply to a write is withheld until
//! the write has been observed on the replication stream and appended
//! to a durable log. Reads and subsequent writes on the same keys wait
//! for that confirmation through a local key-lock table.

pub mod config;
pub mod replication;
pub mod server;
pub mod session;
pub mod txnlog;

pub use config::Config;
pub use replication::Subscriber;
pub use session::Transactor;
pub use txnlog::{Appender, FileAppender};
