//! Testing utilities
//!
//! An in-memory stand-in for the server side of a replication connection,
//! built on `tokio::io::duplex`, and a [`Connect`] implementation that hands
//! out such connections on demand.
//!
//! ```rust,ignore
//! let (client, mut server) = MockWalSender::pair();
//! tokio::spawn(async move {
//!     server.accept_start_replication().await;
//!     server.send_xlog(Lsn::new(0x100), br#"{"a":0}"#).await;
//!     server.finish_copy().await;
//! });
//! session.run(ReplicationConnection::new(client), Lsn::INVALID, |data| ...).await;
//! ```
//!
//! Helpers panic on unexpected traffic; they are meant for tests only.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex};

use crate::connection::{Connect, ReplicationConnection};
use crate::error::{Result, WalStreamError};
use crate::lsn::Lsn;
use crate::protocol::{StandbyStatusUpdate, STATUS_UPDATE_TAG};

const DUPLEX_CAPACITY: usize = 256 * 1024;

/// A message written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Simple query text
    Query(String),
    /// Standby status update inside CopyData
    StatusUpdate(StandbyStatusUpdate),
    /// Any other CopyData payload
    CopyData(Bytes),
    /// End of the client's copy stream
    CopyDone,
    /// Connection termination
    Terminate,
    /// Anything else
    Other(u8, Bytes),
}

/// Server side of an in-memory replication connection.
pub struct MockWalSender {
    stream: DuplexStream,
    buf: BytesMut,
}

impl MockWalSender {
    /// Create a connected `(client stream, server)` pair.
    pub fn pair() -> (DuplexStream, Self) {
        let (client, server) = duplex(DUPLEX_CAPACITY);
        (
            client,
            Self {
                stream: server,
                buf: BytesMut::new(),
            },
        )
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Write raw bytes. Writes to a client that already hung up are dropped.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes).await;
    }

    /// Write one backend message.
    pub async fn send_raw(&mut self, tag: u8, body: &[u8]) {
        let mut msg = BytesMut::with_capacity(5 + body.len());
        msg.put_u8(tag);
        msg.put_i32((body.len() + 4) as i32);
        msg.put_slice(body);
        self.send_bytes(&msg).await;
    }

    /// ReadyForQuery, idle
    pub async fn send_ready(&mut self) {
        self.send_raw(b'Z', b"I").await;
    }

    /// ErrorResponse with severity ERROR
    pub async fn send_error(&mut self, message: &str) {
        let mut body = BytesMut::new();
        body.put_slice(b"SERROR\0C55000\0M");
        body.put_slice(message.as_bytes());
        body.put_slice(b"\0\0");
        self.send_raw(b'E', &body).await;
    }

    /// A complete single-row result: RowDescription, DataRow,
    /// CommandComplete, ReadyForQuery.
    pub async fn send_row_set(&mut self, row: &[Option<&str>]) {
        let mut desc = BytesMut::new();
        desc.put_i16(row.len() as i16);
        for i in 0..row.len() {
            desc.put_slice(format!("col{i}\0").as_bytes());
            desc.put_i32(0); // table oid
            desc.put_i16(0); // column number
            desc.put_i32(25); // text
            desc.put_i16(-1);
            desc.put_i32(-1);
            desc.put_i16(0); // text format
        }
        self.send_raw(b'T', &desc).await;

        let mut data = BytesMut::new();
        data.put_i16(row.len() as i16);
        for value in row {
            match value {
                Some(v) => {
                    data.put_i32(v.len() as i32);
                    data.put_slice(v.as_bytes());
                }
                None => data.put_i32(-1),
            }
        }
        self.send_raw(b'D', &data).await;
        self.send_raw(b'C', b"IDENTIFY_SYSTEM\0").await;
        self.send_ready().await;
    }

    /// CopyData carrying `payload`.
    pub async fn send_copy_data(&mut self, payload: &[u8]) {
        self.send_raw(b'd', payload).await;
    }

    /// XLogData frame starting at `start`.
    pub async fn send_xlog(&mut self, start: Lsn, payload: &[u8]) {
        let mut frame = BytesMut::with_capacity(25 + payload.len());
        frame.put_u8(b'w');
        frame.put_u64(start.as_u64());
        frame.put_u64(start.as_u64() + payload.len() as u64);
        frame.put_i64(0);
        frame.put_slice(payload);
        self.send_copy_data(&frame).await;
    }

    /// Primary keepalive reporting `end`.
    pub async fn send_keepalive(&mut self, end: Lsn, reply_requested: bool) {
        let mut frame = BytesMut::with_capacity(18);
        frame.put_u8(b'k');
        frame.put_u64(end.as_u64());
        frame.put_i64(0);
        frame.put_u8(u8::from(reply_requested));
        self.send_copy_data(&frame).await;
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    async fn fill(&mut self, needed: usize) -> bool {
        while self.buf.len() < needed {
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
        }
        true
    }

    /// Read the startup packet and return its parameters.
    pub async fn read_startup(&mut self) -> HashMap<String, String> {
        assert!(self.fill(4).await, "client closed before startup");
        let len = i32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        assert!(self.fill(len).await, "truncated startup packet");

        let mut packet = self.buf.split_to(len).freeze();
        packet.advance(4);
        let version = packet.get_i32();
        assert_eq!(version, 196_608, "unexpected protocol version");

        let fields: Vec<String> = packet[..]
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        fields
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// Read one tagged frontend message, or `None` once the client is gone.
    pub async fn try_read_frontend(&mut self) -> Option<(u8, Bytes)> {
        if !self.fill(5).await {
            return None;
        }
        let tag = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if !self.fill(1 + len).await {
            return None;
        }
        self.buf.advance(5);
        Some((tag, self.buf.split_to(len - 4).freeze()))
    }

    /// Read one tagged frontend message.
    pub async fn read_frontend(&mut self) -> (u8, Bytes) {
        self.try_read_frontend()
            .await
            .expect("client closed the connection")
    }

    /// Read and classify the next client message, or `None` once the client
    /// is gone.
    pub async fn try_read_client_message(&mut self) -> Option<ClientMessage> {
        let (tag, body) = self.try_read_frontend().await?;
        Some(match tag {
            b'Q' => {
                let text = body.strip_suffix(b"\0").unwrap_or(&body[..]);
                ClientMessage::Query(String::from_utf8_lossy(text).into_owned())
            }
            b'd' if body.first() == Some(&STATUS_UPDATE_TAG) => ClientMessage::StatusUpdate(
                StandbyStatusUpdate::decode(body).expect("malformed status update"),
            ),
            b'd' => ClientMessage::CopyData(body),
            b'c' => ClientMessage::CopyDone,
            b'X' => ClientMessage::Terminate,
            other => ClientMessage::Other(other, body),
        })
    }

    /// Read and classify the next client message.
    pub async fn read_client_message(&mut self) -> ClientMessage {
        self.try_read_client_message()
            .await
            .expect("client closed the connection")
    }

    /// Read a simple query and return its text.
    pub async fn read_query(&mut self) -> String {
        match self.read_client_message().await {
            ClientMessage::Query(text) => text,
            other => panic!("expected a query, got {other:?}"),
        }
    }

    /// Read a simple query and check its text.
    pub async fn expect_query(&mut self, expected: &str) {
        let query = self.read_query().await;
        assert_eq!(query, expected);
    }

    /// Read the next standby status update.
    pub async fn read_status_update(&mut self) -> StandbyStatusUpdate {
        match self.read_client_message().await {
            ClientMessage::StatusUpdate(update) => update,
            other => panic!("expected a status update, got {other:?}"),
        }
    }

    /// Accept `START_REPLICATION`: read the command, enter CopyBoth mode and
    /// return the command text.
    pub async fn accept_start_replication(&mut self) -> String {
        let query = self.read_query().await;
        assert!(
            query.starts_with("START_REPLICATION SLOT "),
            "unexpected command: {query}"
        );
        // overall format text, zero columns
        self.send_raw(b'W', &[0, 0, 0]).await;
        query
    }

    /// End the copy from the server side and complete the exchange the way
    /// a WAL sender does once the client answers with CopyDone.
    pub async fn finish_copy(&mut self) -> Vec<ClientMessage> {
        self.send_raw(b'c', &[]).await;
        let mut seen = Vec::new();
        loop {
            match self.try_read_client_message().await {
                Some(ClientMessage::CopyDone) => break,
                Some(other) => seen.push(other),
                None => return seen,
            }
        }
        self.send_raw(b'C', b"START_STREAMING\0").await;
        self.send_ready().await;
        seen
    }

    /// Collect client messages until the client closes the connection.
    pub async fn read_until_closed(&mut self) -> Vec<ClientMessage> {
        let mut seen = Vec::new();
        while let Some(msg) = self.try_read_client_message().await {
            seen.push(msg);
        }
        seen
    }
}

/// Hands out in-memory connections queued through a [`MockServers`] handle.
///
/// With nothing queued, `connect` fails the way a refused TCP connect does.
pub struct MockConnector {
    streams: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

/// Queues connections for a [`MockConnector`].
#[derive(Clone)]
pub struct MockServers {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

impl MockConnector {
    pub fn new() -> (Self, MockServers) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                streams: Mutex::new(rx),
            },
            MockServers { tx },
        )
    }
}

impl MockServers {
    /// Queue one connection and return its server side.
    pub fn push(&self) -> MockWalSender {
        let (client, server) = MockWalSender::pair();
        // The receiver lives as long as the connector.
        let _ = self.tx.send(client);
        server
    }
}

#[async_trait]
impl Connect for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<ReplicationConnection<DuplexStream>> {
        let mut streams = self.streams.lock().await;
        match streams.try_recv() {
            Ok(stream) => Ok(ReplicationConnection::new(stream)),
            Err(_) => Err(WalStreamError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
        }
    }
}
