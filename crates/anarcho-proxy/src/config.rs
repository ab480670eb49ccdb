//! Proxy configuration from the environment.
//!
//! The proxy is configured entirely through environment variables:
//!
//! | Variable          | Effect                                          |
//! |-------------------|-------------------------------------------------|
//! | `LISTEN_ADDRESS`  | `host:port` to serve on; advertised in REPLCONF |
//! | `REDIS_ADDRESS`   | upstream primary `host:port`                    |
//! | `LOCAL_STATE_DIR` | key-lock store path; empty means in-memory      |
//! | `LOCK_TTL`        | lock staleness bound, default 10s               |
//! | `TXN_LOG_PATH`    | durable log file, default `anarcho.txnlog`      |
//! | `TXN_LOG_FSYNC`   | `always` (default), `everysec`, or `no`         |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::txnlog::FsyncPolicy;

/// Default lock TTL. Recommended to stay at least an order of magnitude
/// above the expected worst-case append latency.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

const DEFAULT_TXN_LOG_PATH: &str = "anarcho.txnlog";

/// Errors from reading and validating the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: String,
    pub redis_address: String,
    pub local_state_dir: Option<PathBuf>,
    pub lock_ttl: Duration,
    pub txn_log_path: PathBuf,
    pub txn_log_fsync: FsyncPolicy,
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        let listen_address = require("LISTEN_ADDRESS")?;
        let redis_address = require("REDIS_ADDRESS")?;

        let local_state_dir = optional("LOCAL_STATE_DIR").map(PathBuf::from);

        let lock_ttl = match optional("LOCK_TTL") {
            Some(raw) => parse_duration(&raw).map_err(|reason| ConfigError::Invalid {
                name: "LOCK_TTL",
                reason,
            })?,
            None => DEFAULT_LOCK_TTL,
        };

        let txn_log_path = optional("TXN_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TXN_LOG_PATH));

        let txn_log_fsync = match optional("TXN_LOG_FSYNC") {
            Some(raw) => parse_fsync_policy(&raw).map_err(|reason| ConfigError::Invalid {
                name: "TXN_LOG_FSYNC",
                reason,
            })?,
            None => FsyncPolicy::Always,
        };

        Ok(Config {
            listen_address,
            redis_address,
            local_state_dir,
            lock_ttl,
            txn_log_path,
            txn_log_fsync,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parses a human-readable duration string.
///
/// Supports suffixes: ms (milliseconds), s (seconds), m (minutes),
/// h (hours). Plain numbers are treated as seconds.
///
/// # Examples
///
/// - "900ms" → 900 milliseconds
/// - "10s" → 10 seconds
/// - "2m" → 2 minutes
/// - "30" → 30 seconds
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration string".into());
    }

    let lower = input.to_ascii_lowercase();

    // check "ms" before "s" or the millisecond suffix never matches
    let (num_str, unit_ms) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 60 * 1_000)
    } else if let Some(n) = lower.strip_suffix('h') {
        (n, 60 * 60 * 1_000)
    } else {
        (lower.as_str(), 1_000)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("invalid duration: '{input}'"))?;

    num.checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration overflow: '{input}'"))
}

/// Parses an fsync policy name.
pub fn parse_fsync_policy(input: &str) -> Result<FsyncPolicy, String> {
    match input.to_ascii_lowercase().as_str() {
        "always" => Ok(FsyncPolicy::Always),
        "everysec" => Ok(FsyncPolicy::EverySec),
        "no" => Ok(FsyncPolicy::No),
        _ => Err(format!(
            "unknown fsync policy '{input}'. valid options: always, everysec, no"
        )),
    }
}
