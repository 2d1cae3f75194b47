//! Bridge runtime
//!
//! Owns the one thread that reads the replication stream. The thread runs a
//! current-thread tokio runtime driving a [`Supervisor`], and the router is
//! called inline for every payload, so events are applied one at a time in
//! stream order.
//!
//! Startup connects before the supervisor exists: if the first connection
//! fails, [`Bridge::start`] returns the error and nothing keeps running.

use rivven_walstream::{
    AbortFlag, Connect, ReplicationConfig, SessionStats, Supervisor, SupervisorReport,
};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::{FanoutError, Result};
use crate::router::ChangeRouter;

const THREAD_NAME: &str = "rivven-walstream";

/// Starts the replication thread.
pub struct Bridge;

impl Bridge {
    /// Connect, then hand the connection to a supervisor on a dedicated
    /// thread. Returns once the first connection is established or has
    /// failed.
    pub async fn start<C>(
        connector: C,
        config: ReplicationConfig,
        router: Arc<ChangeRouter>,
    ) -> Result<BridgeHandle>
    where
        C: Connect + 'static,
    {
        config.validate()?;

        let abort = AbortFlag::new();
        let thread_abort = abort.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<Arc<SessionStats>>>();
        let slot = config.slot.clone();

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = ?e, "Failed to create runtime for replication");
                        let _ = ready_tx.send(Err(FanoutError::Io(e)));
                        return SupervisorReport::default();
                    }
                };

                runtime.block_on(async move {
                    let conn = match connector.connect().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            let _ = ready_tx.send(Err(FanoutError::startup(format!(
                                "could not connect to replication source: {e}"
                            ))));
                            return SupervisorReport::default();
                        }
                    };

                    let mut supervisor = Supervisor::new(connector, config, thread_abort);
                    let _ = ready_tx.send(Ok(supervisor.session_stats()));
                    supervisor
                        .run(Some(conn), |payload| router.apply(payload))
                        .await
                })
            })?;

        let stats = match ready_rx.await {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(FanoutError::Runtime(
                    "replication thread exited during startup".to_string(),
                ));
            }
        };

        info!(slot = %slot, "Replication bridge started");
        Ok(BridgeHandle {
            abort,
            stats,
            thread,
        })
    }
}

/// Control over a running bridge.
pub struct BridgeHandle {
    abort: AbortFlag,
    stats: Arc<SessionStats>,
    thread: JoinHandle<SupervisorReport>,
}

impl BridgeHandle {
    /// The flag that stops the stream; raising it is enough to end the
    /// bridge within about a second.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    pub fn session_stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// Whether the replication thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the replication thread to exit on its own. Blocks.
    pub fn join(self) -> Result<SupervisorReport> {
        self.thread
            .join()
            .map_err(|_| FanoutError::Runtime("replication thread panicked".to_string()))
    }

    /// Raise the abort flag and wait for the replication thread. Blocks.
    pub fn shutdown(self) -> Result<SupervisorReport> {
        info!("Stopping replication bridge");
        self.abort.raise();
        self.join()
    }
}
