//! Stream session
//!
//! One session owns one connection from `START_REPLICATION` until it ends.
//! Every loop iteration:
//!
//! 1. flushes if the flush interval has elapsed,
//! 2. sends a forced status update if the status interval has elapsed,
//! 3. waits for the next message, but never past the next scheduled status
//!    update or pending flush and never longer than one second,
//! 4. handles the message: end of copy, keepalive or data.
//!
//! The data callback runs inline, so the next frame is not read until it
//! returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::abort::AbortFlag;
use crate::config::ReplicationConfig;
use crate::connection::ReplicationConnection;
use crate::error::{Result, WalStreamError};
use crate::lsn::Lsn;
use crate::position::PositionTracker;
use crate::protocol::wire::tag;
use crate::protocol::{pg_now_micros, start_replication_command, PluginOption, ReplicationFrame};

/// Upper bound on a single wait for socket data
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Lower bound on a single wait, so an already-due target cannot spin
const MIN_WAIT: Duration = Duration::from_millis(1);

/// How long to wait for the server to finish after it ended the copy
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a session ended.
#[derive(Debug)]
pub enum TerminationReason {
    /// Abort flag raised or end position reached
    Intentional,
    /// The server ended the stream cleanly
    EndOfStream,
    /// Protocol, transport or server failure
    Error(WalStreamError),
}

impl TerminationReason {
    pub fn is_intentional(&self) -> bool {
        matches!(self, Self::Intentional)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intentional => f.write_str("intentional"),
            Self::EndOfStream => f.write_str("end of stream"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Counters for the sessions run by one [`StreamSession`].
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_received: AtomicU64,
    keepalives: AtomicU64,
    data_frames: AtomicU64,
    bytes_received: AtomicU64,
    feedback_sent: AtomicU64,
    feedback_skipped: AtomicU64,
}

impl SessionStats {
    fn record_keepalive(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.keepalives.fetch_add(1, Ordering::Relaxed);
    }

    fn record_data(&self, len: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.data_frames.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Frames received, both kinds
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Keepalive frames received
    pub fn keepalives(&self) -> u64 {
        self.keepalives.load(Ordering::Relaxed)
    }

    /// Data frames received (delivered or not)
    pub fn data_frames(&self) -> u64 {
        self.data_frames.load(Ordering::Relaxed)
    }

    /// Payload bytes received in data frames
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Status updates written to the wire
    pub fn feedback_sent(&self) -> u64 {
        self.feedback_sent.load(Ordering::Relaxed)
    }

    /// Non-forced status updates suppressed because nothing changed
    pub fn feedback_skipped(&self) -> u64 {
        self.feedback_skipped.load(Ordering::Relaxed)
    }
}

/// Per-session mutable state, reset at the start of every session.
#[derive(Debug, Default)]
struct SessionState {
    positions: PositionTracker,
    last_status: Option<Instant>,
    last_flush: Option<Instant>,
}

/// How the end position was detected.
enum Cutoff {
    Keepalive,
    Record(Lsn),
}

/// Runs stream sessions for one slot.
pub struct StreamSession {
    slot: String,
    end_lsn: Option<Lsn>,
    options: Vec<PluginOption>,
    status_interval: Duration,
    fsync_interval: Duration,
    abort: AbortFlag,
    stats: Arc<SessionStats>,
    state: SessionState,
}

impl StreamSession {
    pub fn new(config: &ReplicationConfig, abort: AbortFlag) -> Self {
        Self {
            slot: config.slot.clone(),
            end_lsn: config.end_position(),
            options: config.plugin_options.clone(),
            status_interval: config.status_interval(),
            fsync_interval: config.fsync_interval(),
            abort,
            stats: Arc::new(SessionStats::default()),
            state: SessionState::default(),
        }
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Positions of the current or most recent session
    pub fn positions(&self) -> &PositionTracker {
        &self.state.positions
    }

    /// Stream from `start` until the session terminates.
    ///
    /// `on_data` receives each delivered payload. The connection is closed
    /// before returning, whatever the outcome.
    pub async fn run<S, F>(
        &mut self,
        mut conn: ReplicationConnection<S>,
        start: Lsn,
        mut on_data: F,
    ) -> TerminationReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        F: FnMut(&[u8]),
    {
        self.state = SessionState::default();

        let reason = match self.stream(&mut conn, start, &mut on_data).await {
            Ok(reason) => reason,
            Err(e) => TerminationReason::Error(e),
        };
        conn.close().await;

        match &reason {
            TerminationReason::Error(e) => {
                error!(slot = %self.slot, code = e.error_code(), "Stream session failed: {}", e)
            }
            other => info!(slot = %self.slot, "Stream session ended: {}", other),
        }
        reason
    }

    async fn stream<S, F>(
        &mut self,
        conn: &mut ReplicationConnection<S>,
        start: Lsn,
        on_data: &mut F,
    ) -> Result<TerminationReason>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        F: FnMut(&[u8]),
    {
        let command = start_replication_command(&self.slot, start, &self.options);
        info!(slot = %self.slot, "Starting log streaming at {}", start);
        if !conn.start_replication(&command, &self.abort).await? {
            info!(slot = %self.slot, "Abort requested before streaming started");
            return Ok(TerminationReason::Intentional);
        }
        debug!("Streaming initiated");

        loop {
            if self.abort.is_raised() {
                return Ok(self.wind_down(conn).await);
            }

            let now = Instant::now();
            if interval_elapsed(self.state.last_flush, now, self.fsync_interval) {
                self.flush(now);
            }
            if !self.status_interval.is_zero()
                && interval_elapsed(self.state.last_status, now, self.status_interval)
            {
                self.send_feedback(conn, true).await?;
                self.state.last_status = Some(now);
            }

            let deadline = self.wake_deadline(now);
            let Some(msg) = conn.read_message_until(deadline).await? else {
                continue;
            };

            match msg.tag {
                tag::COPY_DATA => {}
                tag::COPY_DONE => return self.finish(conn).await,
                tag::ERROR_RESPONSE => {
                    return Err(WalStreamError::server(msg.error_message()));
                }
                other => {
                    return Err(WalStreamError::protocol(format!(
                        "unexpected message \"{}\" in copy stream",
                        other.escape_ascii()
                    )));
                }
            }

            let frame = ReplicationFrame::parse(msg.body)?;
            self.state.positions.absorb(frame.position());

            match frame {
                ReplicationFrame::Keepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    self.stats.record_keepalive();

                    let reached = self.end_lsn.is_some_and(|end| wal_end >= end);
                    if reply_requested || reached {
                        self.flush_and_send_feedback(conn).await?;
                    }
                    if reached {
                        self.terminate(conn, Cutoff::Keepalive).await;
                        return Ok(TerminationReason::Intentional);
                    }
                }
                ReplicationFrame::XLogData {
                    wal_start, data, ..
                } => {
                    self.stats.record_data(data.len());

                    if self.end_lsn.is_some_and(|end| wal_start > end) {
                        self.flush_and_send_feedback(conn).await?;
                        self.terminate(conn, Cutoff::Record(wal_start)).await;
                        return Ok(TerminationReason::Intentional);
                    }

                    self.state.positions.mark_pending();
                    on_data(&data[..]);

                    if self.end_lsn == Some(wal_start) {
                        self.flush_and_send_feedback(conn).await?;
                        self.terminate(conn, Cutoff::Record(wal_start)).await;
                        return Ok(TerminationReason::Intentional);
                    }
                }
            }
        }
    }

    /// Earliest of: one interval before the next status update, one
    /// interval before a pending flush, and `now + MAX_WAIT`.
    fn wake_deadline(&self, now: Instant) -> Instant {
        let mut deadline = now + MAX_WAIT;

        if !self.status_interval.is_zero() {
            if let Some(last) = self.state.last_status {
                deadline = deadline.min(last + self.status_interval.saturating_sub(MIN_WAIT));
            }
        }
        if !self.fsync_interval.is_zero() && self.state.positions.is_flush_pending() {
            if let Some(last) = self.state.last_flush {
                deadline = deadline.min(last + self.fsync_interval.saturating_sub(MIN_WAIT));
            }
        }

        deadline.max(now + MIN_WAIT)
    }

    fn flush(&mut self, now: Instant) {
        self.state.positions.flush();
        self.state.last_flush = Some(now);
    }

    /// Send a status update unless it is non-forced and would repeat the
    /// previous one.
    async fn send_feedback<S>(&mut self, conn: &mut ReplicationConnection<S>, force: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(update) = self.state.positions.feedback(force, pg_now_micros()) else {
            self.stats.feedback_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        debug!(
            "Confirming write up to {}, flush to {} (slot {})",
            update.written, update.flushed, self.slot
        );
        conn.send_copy_data(&update.encode()).await?;
        self.stats.feedback_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush_and_send_feedback<S>(&mut self, conn: &mut ReplicationConnection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.flush(Instant::now());
        self.send_feedback(conn, true).await?;
        self.state.last_status = Some(Instant::now());
        Ok(())
    }

    /// Tell the server we are leaving. Best-effort.
    async fn terminate<S>(&mut self, conn: &mut ReplicationConnection<S>, cutoff: Cutoff)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Err(e) = conn.send_copy_done().await {
            debug!("Could not send end of copy: {}", e);
        }

        let end = self.end_lsn.unwrap_or(Lsn::INVALID);
        match cutoff {
            Cutoff::Keepalive => info!("End position {} reached by keepalive", end),
            Cutoff::Record(lsn) => {
                info!("End position {} reached by WAL record at {}", end, lsn)
            }
        }
    }

    /// Abort requested: report what was flushed and end the copy.
    async fn wind_down<S>(&mut self, conn: &mut ReplicationConnection<S>) -> TerminationReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        info!(slot = %self.slot, "Abort requested, stopping stream");
        self.flush(Instant::now());
        if let Err(e) = self.send_feedback(conn, false).await {
            debug!("Could not send final status update: {}", e);
        }
        if let Err(e) = conn.send_copy_done().await {
            debug!("Could not send end of copy: {}", e);
        }
        TerminationReason::Intentional
    }

    /// The server ended the copy stream: acknowledge, close our half and
    /// wait for the final result.
    async fn finish<S>(&mut self, conn: &mut ReplicationConnection<S>) -> Result<TerminationReason>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!("Server ended the copy stream");
        self.flush(Instant::now());
        self.send_feedback(conn, false).await?;
        conn.send_copy_done().await?;

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let Some(msg) = conn.read_message_until(deadline).await? else {
                return Err(WalStreamError::timeout(
                    "no final result after end of replication stream",
                ));
            };
            match msg.tag {
                tag::READY_FOR_QUERY => return Ok(TerminationReason::EndOfStream),
                tag::ERROR_RESPONSE => {
                    return Err(WalStreamError::server(format!(
                        "unexpected termination of replication stream: {}",
                        msg.error_message()
                    )));
                }
                tag::COPY_DATA => {
                    warn!("Discarding data received after end of copy");
                }
                // timeline switch result set and the final tag
                tag::ROW_DESCRIPTION | tag::DATA_ROW | tag::COMMAND_COMPLETE => {}
                other => debug!("Ignoring message \"{}\" after end of copy", other.escape_ascii()),
            }
        }
    }
}

fn interval_elapsed(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last {
        Some(last) => now.duration_since(last) >= interval,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockWalSender;

    fn config(end: Option<Lsn>) -> ReplicationConfig {
        let mut builder = ReplicationConfig::builder()
            .user("repl")
            .database("app")
            .slot("s1")
            .status_interval(Duration::from_secs(10));
        if let Some(end) = end {
            builder = builder.end_lsn(end);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_interval_elapsed() {
        let now = Instant::now();
        assert!(interval_elapsed(None, now, Duration::from_secs(10)));
        assert!(!interval_elapsed(Some(now), now, Duration::from_secs(10)));
        assert!(interval_elapsed(Some(now), now, Duration::ZERO));
        assert!(interval_elapsed(
            Some(now),
            now + Duration::from_secs(10),
            Duration::from_secs(10)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_deadline_is_bounded() {
        let mut session = StreamSession::new(&config(None), AbortFlag::new());
        let now = Instant::now() + Duration::from_secs(120);

        // nothing scheduled yet: one second
        assert_eq!(session.wake_deadline(now), now + MAX_WAIT);

        // status due in 300ms
        session.state.last_status = Some(now - Duration::from_millis(9_700));
        let deadline = session.wake_deadline(now);
        assert!(deadline <= now + Duration::from_millis(300));
        assert!(deadline > now);

        // overdue target still waits a little
        session.state.last_status = Some(now - Duration::from_secs(60));
        assert_eq!(session.wake_deadline(now), now + MIN_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_flush_shortens_wait() {
        let mut cfg = config(None);
        cfg.status_interval_ms = 0;
        cfg.fsync_interval_ms = 500;
        let mut session = StreamSession::new(&cfg, AbortFlag::new());
        let now = Instant::now();

        session.state.last_flush = Some(now);
        assert_eq!(session.wake_deadline(now), now + MAX_WAIT);

        session.state.positions.mark_pending();
        assert!(session.wake_deadline(now) < now + Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_frame_ends_session_with_error() {
        let (client, mut server) = MockWalSender::pair();
        let server_task = tokio::spawn(async move {
            server.accept_start_replication().await;
            server.read_status_update().await;
            server.send_copy_data(b"x-garbage").await;
            server.read_until_closed().await;
        });

        let mut session = StreamSession::new(&config(None), AbortFlag::new());
        let mut delivered = 0;
        let reason = session
            .run(ReplicationConnection::new(client), Lsn::INVALID, |_: &[u8]| delivered += 1)
            .await;

        match reason {
            TerminationReason::Error(WalStreamError::Protocol(msg)) => {
                assert!(msg.contains("unrecognized streaming header"))
            }
            other => panic!("unexpected termination: {other}"),
        }
        assert_eq!(delivered, 0);
        server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejection_is_an_error() {
        let (client, mut server) = MockWalSender::pair();
        let server_task = tokio::spawn(async move {
            server.read_query().await;
            server.send_error("replication slot \"s1\" is active").await;
            server.send_ready().await;
            server.read_until_closed().await;
        });

        let mut session = StreamSession::new(&config(None), AbortFlag::new());
        let reason = session
            .run(ReplicationConnection::new(client), Lsn::INVALID, |_: &[u8]| {})
            .await;
        assert!(matches!(
            reason,
            TerminationReason::Error(WalStreamError::StartRejected(_))
        ));
        server_task.await.unwrap();
    }
}
