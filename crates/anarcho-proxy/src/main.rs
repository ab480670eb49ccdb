use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use anarcho_locks::KeyLockStore;
use anarcho_proxy::{server, Config, FileAppender, Subscriber, Transactor};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anarcho=info".into()),
        )
        .init();

    if let Err(e) = run().await {
        error!("exiting; {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let conf = Config::from_env()?;
    info!(?conf, "env loaded");

    let cancel = CancellationToken::new();

    let locks = KeyLockStore::open(conf.local_state_dir.as_deref(), conf.lock_ttl)?;
    let appender = Arc::new(FileAppender::open(&conf.txn_log_path, conf.txn_log_fsync).await?);
    let subscriber = Arc::new(Subscriber::new(
        conf.redis_address.clone(),
        conf.listen_address.clone(),
    ));

    let listener = TcpListener::bind(&conf.listen_address).await?;

    let transactor = Arc::new(Transactor::new(
        conf,
        locks.clone(),
        Arc::clone(&subscriber),
        appender,
    ));

    // lock TTL safety net
    tokio::spawn({
        let locks = locks.clone();
        let cancel = cancel.clone();
        async move { locks.run_ttl_sweeper(cancel).await }
    });

    // the subscriber feeds decoded replication frames to the consumer,
    // which appends them durably and releases key locks
    let (updates_tx, updates_rx) = mpsc::channel(64);
    tokio::spawn({
        let subscriber = Arc::clone(&subscriber);
        let cancel = cancel.clone();
        async move {
            if let Err(e) = subscriber.stream_updates(cancel.clone(), updates_tx).await {
                error!("replication subscriber failed: {e}");
                cancel.cancel();
            }
        }
    });
    tokio::spawn({
        let transactor = Arc::clone(&transactor);
        let cancel = cancel.clone();
        async move {
            if let Err(e) = transactor.run_consumer(updates_rx, cancel.clone()).await {
                error!("replication consumer failed: {e}");
                cancel.cancel();
            }
        }
    });

    // ctrl-c cancels everything cooperatively
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        }
    });

    server::run(listener, transactor, cancel).await?;
    Ok(())
}
