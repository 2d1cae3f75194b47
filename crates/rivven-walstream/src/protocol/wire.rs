//! Backend message framing
//!
//! Splits the raw byte stream from the server into `tag + length + body`
//! messages and encodes the few frontend messages the replication client
//! sends that `postgres_protocol::message::frontend` has no helper for.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WalStreamError};

/// Largest backend message accepted (64 MiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Backend message tags the client cares about
pub mod tag {
    /// Authentication request
    pub const AUTHENTICATION: u8 = b'R';
    /// Run-time parameter status
    pub const PARAMETER_STATUS: u8 = b'S';
    /// Cancellation key data
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// Ready for a new query
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// Error report
    pub const ERROR_RESPONSE: u8 = b'E';
    /// Notice report
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// Result set header
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// Result row
    pub const DATA_ROW: u8 = b'D';
    /// Query finished
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// Entered CopyBoth mode (replication streaming)
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    /// Copy payload
    pub const COPY_DATA: u8 = b'd';
    /// Copy finished
    pub const COPY_DONE: u8 = b'c';
}

/// One message from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    /// Message type byte
    pub tag: u8,
    /// Message body, length prefix stripped
    pub body: Bytes,
}

impl BackendMessage {
    /// Rebuild the raw message, tag and length included.
    ///
    /// `postgres_protocol::message::backend::Message::parse` expects this form.
    pub fn to_raw(&self) -> BytesMut {
        let mut raw = BytesMut::with_capacity(5 + self.body.len());
        raw.put_u8(self.tag);
        raw.put_i32((self.body.len() + 4) as i32);
        raw.put_slice(&self.body);
        raw
    }

    /// Human-readable text of an ErrorResponse body.
    pub fn error_message(&self) -> String {
        parse_error_fields(&self.body)
    }
}

/// Take one complete message off the front of `buf`.
///
/// Returns `Ok(None)` while the message is still incomplete; nothing is
/// consumed in that case.
pub fn split_message(buf: &mut BytesMut) -> Result<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(WalStreamError::protocol(format!(
            "invalid message length {len} for message type \"{}\"",
            tag.escape_ascii()
        )));
    }
    let len = len as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(WalStreamError::protocol(format!(
            "message size {len} bytes exceeds maximum {MAX_MESSAGE_SIZE}"
        )));
    }
    if buf.len() < 1 + len {
        buf.reserve(1 + len - buf.len());
        return Ok(None);
    }

    buf.advance(5);
    let body = buf.split_to(len - 4).freeze();
    Ok(Some(BackendMessage { tag, body }))
}

/// Extract `severity: message (detail)` from ErrorResponse/NoticeResponse
/// fields. Each field is a type byte followed by a NUL-terminated string;
/// a zero type byte ends the list.
pub fn parse_error_fields(body: &[u8]) -> String {
    let mut severity = None;
    let mut message = None;
    let mut detail = None;

    let mut rest = body;
    while let Some((&field_type, tail)) = rest.split_first() {
        if field_type == 0 {
            break;
        }
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let value = String::from_utf8_lossy(&tail[..end]).into_owned();
        match field_type {
            b'S' => severity = Some(value),
            b'M' => message = Some(value),
            b'D' => detail = Some(value),
            _ => {}
        }
        rest = tail.get(end + 1..).unwrap_or_default();
    }

    let mut text = match (severity, message) {
        (Some(severity), Some(message)) => format!("{severity}: {message}"),
        (None, Some(message)) => message,
        (Some(severity), None) => severity,
        (None, None) => "unknown error".to_string(),
    };
    if let Some(detail) = detail {
        text.push_str(&format!(" ({detail})"));
    }
    text
}

/// Decode a DataRow body into nullable text columns.
pub fn parse_data_row(mut body: Bytes) -> Result<Vec<Option<String>>> {
    if body.remaining() < 2 {
        return Err(WalStreamError::protocol("truncated DataRow"));
    }
    let count = body.get_i16();
    let mut columns = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if body.remaining() < 4 {
            return Err(WalStreamError::protocol("truncated DataRow"));
        }
        let len = body.get_i32();
        if len < 0 {
            columns.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            return Err(WalStreamError::protocol("truncated DataRow column"));
        }
        let value = body.split_to(len);
        columns.push(Some(String::from_utf8_lossy(&value).into_owned()));
    }
    Ok(columns)
}

/// Frame `payload` as a CopyData (`'d'`) message.
pub fn copy_data(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(5 + payload.len());
    buf.put_u8(tag::COPY_DATA);
    buf.put_i32((payload.len() + 4) as i32);
    buf.put_slice(payload);
}
