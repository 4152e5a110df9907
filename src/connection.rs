//! Tenant Session
//!
//! One authenticated Postgres session driven through:
//!   Connect → (SSLRequest → TLS) → Startup → Authenticate → ReadyForQuery → Query*
//!
//! Sessions are not shared between tasks; `pool::TenantPool` hands them out one
//! query at a time.

use bytes::BytesMut;
use rustls::ClientConfig;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::auth;
use crate::error::{ConnectError, QueryError};
use crate::protocol::{
    BackendMessage, SSL_ACCEPT, SSL_REFUSE, backend, build_query_message, build_ssl_request,
    build_startup_message, build_terminate, parse_data_row, parse_row_description,
    try_read_backend_message,
};
use crate::query::{Column, QueryResult};
use crate::stream::TenantStream;
use crate::tls;

const APPLICATION_NAME: &str = "tenant-sql-exporter";

/// Session settings sent with every startup message. Read-only sessions keep
/// a trailing `; delete ...` in a simple query from writing anything, and
/// UTF8 keeps label text intact on non-UTF8 databases.
const SESSION_SETTINGS: [(&str, &str); 3] = [
    ("application_name", APPLICATION_NAME),
    ("client_encoding", "UTF8"),
    ("default_transaction_read_only", "on"),
];

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// An authenticated session, idle at ReadyForQuery between calls.
pub struct PgConnection {
    stream: TenantStream,
    buf: BytesMut,
}

impl PgConnection {
    /// Open a session: TCP, optional TLS, startup, authentication.
    pub async fn connect(
        target: &ConnectTarget,
        tls: Option<&Arc<ClientConfig>>,
    ) -> Result<Self, ConnectError> {
        let tcp = TcpStream::connect((target.host.as_str(), target.port)).await?;
        tcp.set_nodelay(true)?;

        let stream = match tls {
            Some(config) => negotiate_tls(tcp, &target.host, config).await?,
            None => TenantStream::Plain(tcp),
        };

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(8192),
        };

        let mut params = vec![
            ("user", target.user.as_str()),
            ("database", target.database.as_str()),
        ];
        params.extend(SESSION_SETTINGS);
        let startup = build_startup_message(&params);
        conn.send(&startup).await?;

        auth::authenticate(&mut conn, &target.user, &target.password).await?;

        // ParameterStatus, BackendKeyData, NoticeResponse until ReadyForQuery
        loop {
            let msg = conn.next_message().await?;
            if msg.is_ready_for_query() {
                break;
            }
            if msg.is_error_response() {
                return Err(ConnectError::Server(msg.error_message()));
            }
        }

        debug!(
            host = %target.host,
            port = target.port,
            database = %target.database,
            tls = conn.stream.is_tls(),
            "tenant session ready"
        );
        Ok(conn)
    }

    /// Run one simple query and collect its first result set.
    ///
    /// Rows belonging to later statements of a multi-statement query are
    /// ignored. A server error still drains to ReadyForQuery, so the session
    /// stays reusable.
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryResult, QueryError> {
        self.send(&build_query_message(sql)).await?;

        let mut columns: Option<Vec<Column>> = None;
        let mut rows = Vec::new();
        let mut first_set_done = false;
        let mut server_error = None;

        loop {
            let msg = self.next_message().await?;
            match msg.msg_type {
                backend::ROW_DESCRIPTION => {
                    if columns.is_none() {
                        let parsed = parse_row_description(&msg.payload)
                            .ok_or_else(|| QueryError::Protocol("malformed RowDescription".into()))?;
                        columns = Some(parsed);
                    }
                }
                backend::DATA_ROW => {
                    if !first_set_done {
                        let row = parse_data_row(&msg.payload)
                            .ok_or_else(|| QueryError::Protocol("malformed DataRow".into()))?;
                        rows.push(row);
                    }
                }
                backend::COMMAND_COMPLETE | backend::EMPTY_QUERY_RESPONSE => {
                    if columns.is_some() {
                        first_set_done = true;
                    }
                }
                backend::ERROR_RESPONSE => {
                    if server_error.is_none() {
                        server_error = Some(msg.error_message());
                    }
                }
                backend::READY_FOR_QUERY => break,
                _ => {} // NoticeResponse, ParameterStatus, etc.
            }
        }

        if let Some(e) = server_error {
            return Err(QueryError::Server(e));
        }

        Ok(QueryResult {
            columns: columns.unwrap_or_default(),
            rows,
        })
    }

    /// Send Terminate and close the socket. Errors are irrelevant at this point.
    pub async fn terminate(mut self) {
        let _ = self.send(&build_terminate()).await;
        let _ = self.stream.shutdown().await;
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Next complete backend message, reading from the socket as needed.
    pub(crate) async fn next_message(&mut self) -> io::Result<BackendMessage> {
        loop {
            if let Some(msg) = try_read_backend_message(&mut self.buf)? {
                return Ok(msg);
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tenant database closed the connection",
                ));
            }
        }
    }
}

async fn negotiate_tls(
    mut tcp: TcpStream,
    host: &str,
    config: &Arc<ClientConfig>,
) -> Result<TenantStream, ConnectError> {
    tcp.write_all(&build_ssl_request()).await?;
    let mut answer = [0u8; 1];
    tcp.read_exact(&mut answer).await?;

    match answer[0] {
        SSL_ACCEPT => {
            let connector = TlsConnector::from(Arc::clone(config));
            let tls_stream = connector
                .connect(tls::server_name(host)?, tcp)
                .await
                .map_err(|e| ConnectError::Tls(format!("handshake with {host}: {e}")))?;
            Ok(TenantStream::Tls(Box::new(tls_stream)))
        }
        SSL_REFUSE => Err(ConnectError::Tls(format!("{host} does not accept TLS connections"))),
        other => Err(ConnectError::Tls(format!(
            "unexpected SSLRequest answer 0x{other:02x} from {host}"
        ))),
    }
}
