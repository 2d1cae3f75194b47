//! Reconnect supervisor
//!
//! Runs stream sessions back to back. After a session ends the supervisor
//! stops if the abort flag is raised or the session ended intentionally;
//! otherwise it sleeps for the reconnect delay and starts a fresh session on
//! a new connection. There is no retry limit and no backoff.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::abort::AbortFlag;
use crate::config::{ReplicationConfig, ResumePolicy};
use crate::connection::{Connect, ReplicationConnection};
use crate::lsn::Lsn;
use crate::session::{SessionStats, StreamSession, TerminationReason};

/// Abort checks during the reconnect delay happen at least this often
const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    Stopped,
}

/// Summary returned when the supervisor stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Sessions that obtained a connection
    pub sessions_started: u64,
    /// Connection attempts that failed
    pub failed_connects: u64,
    /// Sessions that ended with an error
    pub failed_sessions: u64,
    /// How the last session ended
    pub last_termination: Option<String>,
}

/// Keeps a replication stream alive across failures.
pub struct Supervisor<C: Connect> {
    connector: C,
    config: ReplicationConfig,
    abort: AbortFlag,
    session: StreamSession,
    state: SupervisorState,
    report: SupervisorReport,
}

impl<C: Connect> Supervisor<C> {
    pub fn new(connector: C, config: ReplicationConfig, abort: AbortFlag) -> Self {
        let session = StreamSession::new(&config, abort.clone());
        Self {
            connector,
            config,
            abort,
            session,
            state: SupervisorState::Stopped,
            report: SupervisorReport::default(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Counters shared with the stream sessions
    pub fn session_stats(&self) -> Arc<SessionStats> {
        self.session.stats()
    }

    /// Run sessions until the abort flag is raised or a session ends
    /// intentionally.
    ///
    /// `initial` is used for the first session; later sessions connect
    /// through the connector.
    pub async fn run<F>(
        &mut self,
        initial: Option<ReplicationConnection<C::Stream>>,
        mut on_data: F,
    ) -> SupervisorReport
    where
        F: FnMut(&[u8]),
    {
        self.state = SupervisorState::Running;
        let mut pending = initial;
        let mut start = self.config.start_lsn;

        loop {
            let connection = match pending.take() {
                Some(conn) => Ok(conn),
                None => self.connector.connect().await,
            };

            let reason = match connection {
                Ok(conn) => {
                    self.report.sessions_started += 1;
                    self.session.run(conn, start, &mut on_data).await
                }
                Err(e) => {
                    self.report.failed_connects += 1;
                    error!("Could not connect to server: {}", e);
                    TerminationReason::Error(e)
                }
            };
            if reason.is_error() {
                self.report.failed_sessions += 1;
            }
            self.report.last_termination = Some(reason.to_string());

            if self.abort.is_raised() || reason.is_intentional() {
                break;
            }

            start = self.next_start(start);
            let delay = self.config.reconnect_delay();
            warn!(
                "Disconnected; waiting {} seconds to try again",
                delay.as_secs()
            );
            if self.sleep_unless_aborted(delay).await {
                break;
            }
        }

        self.state = SupervisorState::Stopped;
        info!(
            sessions = self.report.sessions_started,
            "Replication supervisor stopped"
        );
        self.report.clone()
    }

    fn next_start(&self, current: Lsn) -> Lsn {
        match self.config.resume {
            ResumePolicy::Configured => current,
            ResumePolicy::LastFlushed => {
                let flushed = self.session.positions().flushed();
                if flushed.is_invalid() {
                    current
                } else {
                    flushed
                }
            }
        }
    }

    /// Sleep for `delay`, waking early if the abort flag is raised.
    /// Returns `true` if it was.
    async fn sleep_unless_aborted(&self, delay: Duration) -> bool {
        let mut remaining = delay;
        while !remaining.is_zero() {
            if self.abort.is_raised() {
                return true;
            }
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
        self.abort.is_raised()
    }
}
