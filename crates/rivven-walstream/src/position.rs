//! Position tracking and acknowledgment bookkeeping
//!
//! Pure state: which WAL position has been received (`written`), which has
//! been durably handed off (`flushed`), and what was last reported to the
//! server. No I/O happens here.

use crate::lsn::Lsn;
use crate::protocol::StandbyStatusUpdate;

/// Written/flushed positions of one stream session.
///
/// `flushed <= written` always holds, and `written` never moves backwards.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    written: Lsn,
    flushed: Lsn,
    flush_pending: bool,
    last_reported: Option<(Lsn, Lsn)>,
}

impl PositionTracker {
    /// Fresh tracker; both positions start invalid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest position received
    pub fn written(&self) -> Lsn {
        self.written
    }

    /// Highest position flushed
    pub fn flushed(&self) -> Lsn {
        self.flushed
    }

    /// Fold a position from a received frame into `written`.
    ///
    /// Returns `true` if `written` advanced.
    pub fn absorb(&mut self, position: Lsn) -> bool {
        if position > self.written {
            self.written = position;
            true
        } else {
            false
        }
    }

    /// Record that delivered data has not been flushed yet.
    pub fn mark_pending(&mut self) {
        self.flush_pending = true;
    }

    /// Data was delivered since the last flush
    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Declare everything received so far flushed.
    ///
    /// Idempotent: with nothing pending, `flushed` simply stays equal to
    /// `written`.
    pub fn flush(&mut self) {
        self.flushed = self.written;
        self.flush_pending = false;
    }

    /// Build the next status update, or `None` when a non-forced update
    /// would repeat the previous one.
    ///
    /// A returned update is recorded as sent.
    pub fn feedback(&mut self, force: bool, client_time: i64) -> Option<StandbyStatusUpdate> {
        let current = (self.written, self.flushed);
        if !force && self.last_reported == Some(current) {
            return None;
        }
        self.last_reported = Some(current);
        Some(StandbyStatusUpdate::new(self.written, self.flushed, client_time))
    }
}
