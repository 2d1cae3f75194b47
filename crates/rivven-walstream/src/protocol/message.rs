//! Streaming replication sub-protocol messages
//!
//! These travel inside CopyData frames once the connection is in CopyBoth
//! mode:
//!
//! ```text
//! server → client   'w'  XLogData          1 + 8 + 8 + 8 header, then payload
//! server → client   'k'  PrimaryKeepalive  1 + 8 + 8 + 1 = 18 bytes
//! client → server   'r'  StandbyStatus     1 + 8 + 8 + 8 + 8 + 1 = 34 bytes
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime};

use crate::error::{Result, WalStreamError};
use crate::lsn::Lsn;

/// Tag of an XLogData frame
pub const XLOG_DATA_TAG: u8 = b'w';
/// Tag of a primary keepalive frame
pub const KEEPALIVE_TAG: u8 = b'k';
/// Tag of a standby status update
pub const STATUS_UPDATE_TAG: u8 = b'r';

const XLOG_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01 UTC)
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// A frame received from the WAL sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    /// Change data (`'w'`)
    XLogData {
        /// WAL position of the first byte of `data`
        wal_start: Lsn,
        /// Server's current end of WAL
        wal_end: Lsn,
        /// Server clock, microseconds since 2000-01-01
        send_time: i64,
        /// Output plugin payload
        data: Bytes,
    },
    /// Keepalive (`'k'`)
    Keepalive {
        /// Server's current end of WAL
        wal_end: Lsn,
        /// Server clock, microseconds since 2000-01-01
        send_time: i64,
        /// The server disconnects unless a status update follows promptly
        reply_requested: bool,
    },
}

impl ReplicationFrame {
    /// Classify and decode the payload of a CopyData message.
    ///
    /// A data frame must carry at least one payload byte and a keepalive
    /// must be complete; anything shorter, and any other leading byte, is a
    /// protocol error.
    pub fn parse(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Err(WalStreamError::protocol("empty streaming message"));
        }

        match buf[0] {
            XLOG_DATA_TAG => {
                if buf.len() < XLOG_DATA_HEADER_LEN + 1 {
                    return Err(WalStreamError::protocol(format!(
                        "streaming header too small: {}",
                        buf.len()
                    )));
                }
                buf.advance(1);
                let wal_start = Lsn::new(buf.get_u64());
                let wal_end = Lsn::new(buf.get_u64());
                let send_time = buf.get_i64();
                Ok(Self::XLogData {
                    wal_start,
                    wal_end,
                    send_time,
                    data: buf,
                })
            }
            KEEPALIVE_TAG => {
                if buf.len() < KEEPALIVE_LEN {
                    return Err(WalStreamError::protocol(format!(
                        "streaming header too small: {}",
                        buf.len()
                    )));
                }
                buf.advance(1);
                let wal_end = Lsn::new(buf.get_u64());
                let send_time = buf.get_i64();
                let reply_requested = buf.get_u8() != 0;
                Ok(Self::Keepalive {
                    wal_end,
                    send_time,
                    reply_requested,
                })
            }
            tag => Err(WalStreamError::protocol(format!(
                "unrecognized streaming header: \"{}\"",
                tag.escape_ascii()
            ))),
        }
    }

    /// The position this frame reports: `wal_start` for data, `wal_end` for
    /// keepalives.
    pub fn position(&self) -> Lsn {
        match self {
            Self::XLogData { wal_start, .. } => *wal_start,
            Self::Keepalive { wal_end, .. } => *wal_end,
        }
    }
}

/// Standby status update, the client's acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    /// Highest position received
    pub written: Lsn,
    /// Highest position durably processed
    pub flushed: Lsn,
    /// Highest position applied; this client always reports `Lsn::INVALID`
    pub applied: Lsn,
    /// Client clock, microseconds since 2000-01-01
    pub client_time: i64,
    /// Ask the server to reply immediately
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Encoded size in bytes
    pub const LEN: usize = 34;

    /// Build an update from tracked positions.
    pub fn new(written: Lsn, flushed: Lsn, client_time: i64) -> Self {
        Self {
            written,
            flushed,
            applied: Lsn::INVALID,
            client_time,
            reply_requested: false,
        }
    }

    /// Encode to the 34-byte wire layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(STATUS_UPDATE_TAG);
        buf.put_u64(self.written.as_u64());
        buf.put_u64(self.flushed.as_u64());
        buf.put_u64(self.applied.as_u64());
        buf.put_i64(self.client_time);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }

    /// Decode an update, as a WAL sender would.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() != Self::LEN || buf[0] != STATUS_UPDATE_TAG {
            return Err(WalStreamError::protocol(format!(
                "invalid standby status update ({} bytes)",
                buf.len()
            )));
        }
        buf.advance(1);
        Ok(Self {
            written: Lsn::new(buf.get_u64()),
            flushed: Lsn::new(buf.get_u64()),
            applied: Lsn::new(buf.get_u64()),
            client_time: buf.get_i64(),
            reply_requested: buf.get_u8() != 0,
        })
    }
}

/// Current time as microseconds since the PostgreSQL epoch.
pub fn pg_now_micros() -> i64 {
    let pg_epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(PG_EPOCH_OFFSET_SECS);
    SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlog(start: u64, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(start);
        buf.put_u64(start + 100);
        buf.put_i64(42);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn keepalive(end: u64, reply: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(end);
        buf.put_i64(7);
        buf.put_u8(u8::from(reply));
        buf.freeze()
    }

    #[test]
    fn test_parse_xlog_data() {
        let frame = ReplicationFrame::parse(xlog(0x1_0000_0100, b"{\"a\":0}")).unwrap();
        match frame {
            ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                send_time,
                ref data,
            } => {
                assert_eq!(wal_start, Lsn::new(0x1_0000_0100));
                assert_eq!(wal_end, Lsn::new(0x1_0000_0164));
                assert_eq!(send_time, 42);
                assert_eq!(&data[..], b"{\"a\":0}");
            }
            _ => panic!("expected XLogData"),
        }
        assert_eq!(frame.position(), Lsn::new(0x1_0000_0100));
    }

    #[test]
    fn test_parse_keepalive() {
        let frame = ReplicationFrame::parse(keepalive(500, true)).unwrap();
        assert_eq!(
            frame,
            ReplicationFrame::Keepalive {
                wal_end: Lsn::new(500),
                send_time: 7,
                reply_requested: true,
            }
        );
        assert_eq!(frame.position(), Lsn::new(500));
    }

    #[test]
    fn test_data_frame_without_payload_is_rejected() {
        let err = ReplicationFrame::parse(xlog(1, b"")).unwrap_err();
        assert!(err.to_string().contains("streaming header too small: 25"));
    }

    #[test]
    fn test_truncated_keepalive_is_rejected() {
        let full = keepalive(9, false);
        let err = ReplicationFrame::parse(full.slice(..17)).unwrap_err();
        assert!(matches!(err, WalStreamError::Protocol(_)));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let err = ReplicationFrame::parse(Bytes::from_static(b"x0000")).unwrap_err();
        assert!(err.to_string().contains("unrecognized streaming header"));
        assert!(ReplicationFrame::parse(Bytes::new()).is_err());
    }

    #[test]
    fn test_status_update_layout() {
        let update = StandbyStatusUpdate::new(Lsn::new(0x20), Lsn::new(0x10), 99);
        let bytes = update.encode();
        assert_eq!(bytes.len(), StandbyStatusUpdate::LEN);
        assert_eq!(bytes[0], b'r');
        assert_eq!(&bytes[1..9], &0x20u64.to_be_bytes());
        assert_eq!(&bytes[9..17], &0x10u64.to_be_bytes());
        assert_eq!(&bytes[17..25], &[0u8; 8]);
        assert_eq!(&bytes[25..33], &99i64.to_be_bytes());
        assert_eq!(bytes[33], 0);
        assert_eq!(StandbyStatusUpdate::decode(bytes).unwrap(), update);
    }

    #[test]
    fn test_pg_clock_is_after_pg_epoch() {
        // 2020-01-01 in PostgreSQL microseconds
        assert!(pg_now_micros() > 631_152_000_000_000);
    }
}
