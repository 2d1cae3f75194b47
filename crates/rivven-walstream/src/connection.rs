//! Replication connections
//!
//! [`ReplicationConnection`] wraps any byte stream that has completed (or is
//! about to perform) the PostgreSQL startup handshake in replication mode.
//! It owns a read buffer so backend messages can be taken off the stream
//! with a deadline without losing partially received data.
//!
//! [`PgConnector`] opens such connections over TCP, authenticates with
//! cleartext or MD5 passwords and identifies the system before handing the
//! connection to a stream session.

use async_trait::async_trait;
use bytes::BytesMut;
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::abort::AbortFlag;
use crate::config::ReplicationConfig;
use crate::error::{Result, WalStreamError};
use crate::lsn::Lsn;
use crate::protocol::wire::{self, tag, BackendMessage};
use crate::protocol::IDENTIFY_SYSTEM;

/// Longest wait for the start reply between abort checks
const ABORT_POLL: Duration = Duration::from_secs(1);

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    /// Cluster system identifier
    pub system_id: String,
    /// Current timeline
    pub timeline: u32,
    /// Current WAL flush position
    pub xlog_pos: Lsn,
    /// Database the connection is bound to; `None` for physical replication
    /// connections
    pub database: Option<String>,
}

/// Startup parameters for the replication handshake.
#[derive(Debug, Clone)]
pub struct StartupParams<'a> {
    pub user: &'a str,
    pub database: &'a str,
    pub password: Option<&'a str>,
    pub application_name: &'a str,
}

/// A connection in replication-database mode.
pub struct ReplicationConnection<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> ReplicationConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a stream that is already past authentication.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    /// Run the startup handshake on a fresh stream: send the startup packet,
    /// answer the authentication request and wait for ReadyForQuery.
    pub async fn handshake(stream: S, params: StartupParams<'_>) -> Result<Self> {
        let mut conn = Self::new(stream);

        let startup = [
            ("user", params.user),
            ("database", params.database),
            ("replication", "database"),
            ("application_name", params.application_name),
        ];
        frontend::startup_message(startup.into_iter(), &mut conn.write_buf)?;
        conn.flush_write_buf().await?;

        loop {
            let msg = conn.read_message().await?;
            match msg.tag {
                tag::AUTHENTICATION => {
                    if conn.authenticate(&msg, &params).await? {
                        debug!("Authentication successful");
                        break;
                    }
                }
                tag::ERROR_RESPONSE => {
                    return Err(WalStreamError::auth(msg.error_message()));
                }
                other => {
                    return Err(WalStreamError::protocol(format!(
                        "unexpected message \"{}\" during authentication",
                        other.escape_ascii()
                    )));
                }
            }
        }

        loop {
            let msg = conn.read_message().await?;
            match msg.tag {
                tag::READY_FOR_QUERY => break,
                tag::ERROR_RESPONSE => {
                    return Err(WalStreamError::server(msg.error_message()));
                }
                tag::PARAMETER_STATUS | tag::BACKEND_KEY_DATA => {}
                other => {
                    debug!("Ignoring message \"{}\" during startup", other.escape_ascii());
                }
            }
        }

        Ok(conn)
    }

    /// Answer one authentication request. Returns `true` on AuthenticationOk.
    async fn authenticate(
        &mut self,
        msg: &BackendMessage,
        params: &StartupParams<'_>,
    ) -> Result<bool> {
        let mut raw = msg.to_raw();
        let parsed = backend::Message::parse(&mut raw)?
            .ok_or_else(|| WalStreamError::protocol("failed to parse authentication message"))?;

        match parsed {
            backend::Message::AuthenticationOk => Ok(true),
            backend::Message::AuthenticationCleartextPassword => {
                warn!("Server requested a cleartext password");
                let password = params
                    .password
                    .ok_or_else(|| WalStreamError::auth("password required but not provided"))?;
                frontend::password_message(password.as_bytes(), &mut self.write_buf)?;
                self.flush_write_buf().await?;
                Ok(false)
            }
            backend::Message::AuthenticationMd5Password(body) => {
                let password = params
                    .password
                    .ok_or_else(|| WalStreamError::auth("password required but not provided"))?;
                let hash = hash_md5_password(params.user, password, &body.salt());
                frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                self.flush_write_buf().await?;
                Ok(false)
            }
            backend::Message::AuthenticationSasl(_) => Err(WalStreamError::auth(
                "SASL authentication is not supported",
            )),
            _ => Err(WalStreamError::auth("unsupported authentication method")),
        }
    }

    /// Read the next backend message, waiting as long as it takes.
    ///
    /// Notices are logged and skipped.
    pub async fn read_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = self.try_read_message()? {
                return Ok(msg);
            }
            self.fill_read_buf().await?;
        }
    }

    /// Read the next backend message, giving up at `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes first. Bytes received
    /// before the deadline stay buffered for the next call.
    pub async fn read_message_until(&mut self, deadline: Instant) -> Result<Option<BackendMessage>> {
        loop {
            if let Some(msg) = self.try_read_message()? {
                return Ok(Some(msg));
            }
            match timeout_at(deadline, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(Ok(0)) => return Err(WalStreamError::ConnectionClosed),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Take a complete message from the buffer without touching the stream.
    pub fn try_read_message(&mut self) -> Result<Option<BackendMessage>> {
        while let Some(msg) = wire::split_message(&mut self.read_buf)? {
            if msg.tag == tag::NOTICE_RESPONSE {
                info!("Server notice: {}", msg.error_message());
                continue;
            }
            return Ok(Some(msg));
        }
        Ok(None)
    }

    async fn fill_read_buf(&mut self) -> Result<()> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(WalStreamError::ConnectionClosed);
        }
        Ok(())
    }

    async fn flush_write_buf(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        Ok(())
    }

    /// Send a simple query without waiting for the reply.
    pub async fn send_query(&mut self, query: &str) -> Result<()> {
        frontend::query(query, &mut self.write_buf)?;
        self.flush_write_buf().await
    }

    /// Run a simple query and collect its rows as text.
    ///
    /// The reply is consumed up to ReadyForQuery even when the server
    /// reports an error, so the connection stays usable.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<Vec<Option<String>>>> {
        self.send_query(query).await?;

        let mut rows = Vec::new();
        let mut error = None;
        loop {
            let msg = self.read_message().await?;
            match msg.tag {
                tag::DATA_ROW => rows.push(wire::parse_data_row(msg.body)?),
                tag::ERROR_RESPONSE => error = Some(msg.error_message()),
                tag::READY_FOR_QUERY => break,
                tag::ROW_DESCRIPTION | tag::COMMAND_COMPLETE => {}
                other => {
                    debug!("Ignoring message \"{}\" in query reply", other.escape_ascii());
                }
            }
        }

        match error {
            Some(message) => Err(WalStreamError::server(message)),
            None => Ok(rows),
        }
    }

    /// Ask the server who it is and which database this connection serves.
    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let rows = self.simple_query(IDENTIFY_SYSTEM).await?;
        let row = match rows.as_slice() {
            [row] if row.len() >= 3 => row,
            _ => {
                return Err(WalStreamError::protocol(format!(
                    "could not identify system: got {} rows, expected 1 row with 3 or more fields",
                    rows.len()
                )))
            }
        };

        let system_id = row[0].clone().unwrap_or_default();
        let timeline = row[1]
            .as_deref()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| WalStreamError::protocol("could not parse timeline"))?;
        let xlog_pos = row[2]
            .as_deref()
            .ok_or_else(|| WalStreamError::protocol("missing WAL position"))?
            .parse()
            .map_err(|_| WalStreamError::protocol("could not parse WAL position"))?;
        let database = row.get(3).cloned().flatten();

        Ok(SystemIdentity {
            system_id,
            timeline,
            xlog_pos,
            database,
        })
    }

    /// Send `START_REPLICATION` and wait for CopyBoth mode.
    ///
    /// The wait is checked against `abort` at least once per `ABORT_POLL`.
    /// Returns `false` if the flag was raised before the server answered.
    pub async fn start_replication(&mut self, command: &str, abort: &AbortFlag) -> Result<bool> {
        self.send_query(command).await?;
        loop {
            let Some(msg) = self.read_message_until(Instant::now() + ABORT_POLL).await? else {
                if abort.is_raised() {
                    return Ok(false);
                }
                continue;
            };
            match msg.tag {
                tag::COPY_BOTH_RESPONSE => return Ok(true),
                tag::ERROR_RESPONSE => {
                    let message = msg.error_message();
                    // Drain the trailing ReadyForQuery; the error is what matters.
                    let _ = self.read_message_until(Instant::now() + ABORT_POLL).await;
                    return Err(WalStreamError::start_rejected(message));
                }
                tag::PARAMETER_STATUS => {}
                other => {
                    return Err(WalStreamError::start_rejected(format!(
                        "unexpected response \"{}\"",
                        other.escape_ascii()
                    )))
                }
            }
        }
    }

    /// Send one CopyData message carrying `payload`.
    pub async fn send_copy_data(&mut self, payload: &[u8]) -> Result<()> {
        wire::copy_data(payload, &mut self.write_buf);
        self.flush_write_buf().await
    }

    /// Send CopyDone, ending the client's half of the copy stream.
    pub async fn send_copy_done(&mut self) -> Result<()> {
        frontend::copy_done(&mut self.write_buf);
        self.flush_write_buf().await
    }

    /// Send Terminate and shut the stream down. Failures are ignored.
    pub async fn close(mut self) {
        frontend::terminate(&mut self.write_buf);
        let _ = self.flush_write_buf().await;
        let _ = self.stream.shutdown().await;
    }
}

/// Produces authenticated, identified replication connections.
///
/// The supervisor calls this once per session.
#[async_trait]
pub trait Connect: Send + Sync {
    /// Underlying byte stream
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Open a new connection
    async fn connect(&self) -> Result<ReplicationConnection<Self::Stream>>;
}

/// TCP connector for a PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: ReplicationConfig,
}

impl PgConnector {
    pub fn new(config: ReplicationConfig) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<ReplicationConnection<TcpStream>> {
        let config = &self.config;
        info!(
            "Connecting to {}:{} as {} (database {})",
            config.host, config.port, config.user, config.database
        );

        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;

        let params = StartupParams {
            user: &config.user,
            database: &config.database,
            password: config.password.as_ref().map(|p| p.expose()),
            application_name: "rivven-walstream",
        };
        let mut conn = ReplicationConnection::handshake(stream, params).await?;

        let identity = conn.identify_system().await?;
        if identity.database.is_none() {
            return Err(WalStreamError::config(
                "could not establish database-specific replication connection",
            ));
        }
        debug!(
            system_id = %identity.system_id,
            timeline = identity.timeline,
            xlog_pos = %identity.xlog_pos,
            "Identified system"
        );

        Ok(conn)
    }
}

#[async_trait]
impl Connect for PgConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<ReplicationConnection<TcpStream>> {
        let limit = self.config.connect_timeout();
        timeout(limit, self.open()).await.map_err(|_| {
            WalStreamError::timeout(format!("connection timeout after {}s", limit.as_secs()))
        })?
    }
}

fn hash_md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(user);
    let first = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(salt);
    let second = hex::encode(hasher.finalize());

    format!("md5{}", second)
}
