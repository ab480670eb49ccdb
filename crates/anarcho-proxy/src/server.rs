//! TCP accept loop.
//!
//! Accepts client connections and spawns one session task per
//! connection. Each session gets a child of the server-wide
//! cancellation token; a session failing takes down that session only.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::session::Transactor;
use crate::txnlog::Appender;

/// Runs the accept loop on an already-bound listener until `cancel`
/// fires.
pub async fn run<A: Appender>(
    listener: TcpListener,
    transactor: Arc<Transactor<A>>,
    cancel: CancellationToken,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                info!(%peer, "client connected");

                let transactor = Arc::clone(&transactor);
                let session_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = transactor.transact(stream, session_cancel).await {
                        error!(%peer, "session ended: {e}");
                    }
                });
            }
        }
    }
}
