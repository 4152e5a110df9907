//! Test doubles: an in-memory `QueryExecutor` and a minimal fake Postgres server.

use bytes::{BufMut, BytesMut};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::QueryError;
use crate::query::{Column, QueryExecutor, QueryResult};
use crate::tenant::Tenant;

// ─── In-memory executor ─────────────────────────────────────────────────────

pub enum Canned {
    Rows(QueryResult),
    Fail(String),
    /// Never completes.
    Hang,
    Delay(Duration, QueryResult),
}

/// Executor answering from a fixed statement → response table.
/// Unknown statements fail like a missing relation would.
#[derive(Default)]
pub struct MemoryExecutor {
    responses: HashMap<String, Canned>,
    pub calls: AtomicUsize,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, sql: &str, canned: Canned) -> Self {
        self.responses.insert(sql.to_string(), canned);
        self
    }
}

impl QueryExecutor for MemoryExecutor {
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<QueryResult, QueryError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            match self.responses.get(sql) {
                Some(Canned::Rows(result)) => Ok(result.clone()),
                Some(Canned::Fail(msg)) => Err(QueryError::Server(msg.clone())),
                Some(Canned::Hang) => std::future::pending().await,
                Some(Canned::Delay(delay, result)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(result.clone())
                }
                None => Err(QueryError::Server(format!("relation in '{sql}' does not exist"))),
            }
        })
    }
}

/// Build a result from `(name, type_oid)` columns and text cells.
pub fn result(columns: &[(&str, u32)], rows: &[&[Option<&str>]]) -> QueryResult {
    QueryResult {
        columns: columns.iter().map(|(n, t)| Column::new(*n, *t)).collect(),
        rows: rows
            .iter()
            .map(|r| r.iter().map(|c| c.map(str::to_string)).collect())
            .collect(),
    }
}

/// A ready tenant backed by the given executor.
pub fn tenant(
    name: &str,
    usage: &str,
    tags: &[&str],
    schemas: &[&str],
    executor: MemoryExecutor,
) -> Arc<Tenant> {
    Arc::new(Tenant {
        name: name.to_string(),
        user: "monitor".to_string(),
        tags: tags.iter().map(|s| s.to_string()).collect(),
        usage: usage.to_string(),
        schemas: schemas.iter().map(|s| s.to_string()).collect(),
        executor: Arc::new(executor),
    })
}

// ─── Fake Postgres server ───────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub enum FakeAuth {
    Trust,
    Cleartext(&'static str),
}

pub enum FakeReply {
    Rows {
        columns: Vec<(String, u32)>,
        rows: Vec<Vec<Option<String>>>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl FakeReply {
    pub fn rows(columns: &[(&str, u32)], rows: &[&[Option<&str>]]) -> Self {
        Self::Rows {
            columns: columns.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.map(str::to_string)).collect())
                .collect(),
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }
}

type Handler = Arc<dyn Fn(&str) -> FakeReply + Send + Sync>;

/// Speaks just enough of the backend protocol for the client in `connection`.
pub struct FakeServer {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    /// Startup parameters of the most recent session.
    pub startup: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeServer {
    pub async fn start(
        auth: FakeAuth,
        handler: impl Fn(&str) -> FakeReply + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let startup = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let counter = Arc::clone(&accepted);
        let seen = Arc::clone(&startup);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let _ = serve_session(socket, auth, handler, seen).await;
                });
            }
        });

        Self {
            addr,
            accepted,
            startup,
        }
    }

    pub fn startup_param(&self, key: &str) -> Option<String> {
        let params = self.startup.lock().unwrap();
        params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }
}

async fn serve_session(
    mut socket: TcpStream,
    auth: FakeAuth,
    handler: Handler,
    seen: Arc<Mutex<Vec<(String, String)>>>,
) -> std::io::Result<()> {
    // StartupMessage: length-prefixed, no type byte.
    let len = socket.read_i32().await? as usize;
    let mut startup = vec![0u8; len - 4];
    socket.read_exact(&mut startup).await?;

    // Protocol version, then NUL-terminated key/value pairs.
    let fields: Vec<String> = startup[4..]
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect();
    *seen.lock().unwrap() = fields
        .chunks(2)
        .filter_map(|kv| Some((kv.first()?.clone(), kv.get(1)?.clone())))
        .collect();

    if let FakeAuth::Cleartext(expected) = auth {
        socket.write_all(&message(b'R', &3i32.to_be_bytes())).await?;
        let (_, body) = read_frontend(&mut socket).await?;
        let given = body.strip_suffix(&[0]).unwrap_or(&body[..]);
        if given != expected.as_bytes() {
            socket
                .write_all(&error_response("28P01", "password authentication failed"))
                .await?;
            return Ok(());
        }
    }

    socket.write_all(&message(b'R', &0i32.to_be_bytes())).await?;
    socket.write_all(&message(b'S', b"server_version\x0017.0\x00")).await?;
    socket.write_all(&message(b'K', &[0, 0, 0, 1, 0, 0, 0, 2])).await?;
    socket.write_all(&message(b'Z', b"I")).await?;

    loop {
        let (msg_type, body) = read_frontend(&mut socket).await?;
        match msg_type {
            b'Q' => {
                let sql = String::from_utf8_lossy(body.strip_suffix(&[0]).unwrap_or(&body[..])).into_owned();
                let mut out = BytesMut::new();
                match handler(&sql) {
                    FakeReply::Rows { columns, .. } if columns.is_empty() => {
                        out.extend_from_slice(&message(b'I', &[]));
                    }
                    FakeReply::Rows { columns, rows } => {
                        out.extend_from_slice(&row_description(&columns));
                        for row in &rows {
                            out.extend_from_slice(&data_row(row));
                        }
                        out.extend_from_slice(&message(b'C', format!("SELECT {}\0", rows.len()).as_bytes()));
                    }
                    FakeReply::Error { code, message: text } => {
                        out.extend_from_slice(&error_response(&code, &text));
                    }
                }
                out.extend_from_slice(&message(b'Z', b"I"));
                socket.write_all(&out).await?;
            }
            b'X' => return Ok(()),
            _ => {}
        }
    }
}

async fn read_frontend(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let msg_type = socket.read_u8().await?;
    let len = socket.read_i32().await? as usize;
    let mut body = vec![0u8; len - 4];
    socket.read_exact(&mut body).await?;
    Ok((msg_type, body))
}

fn message(msg_type: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(msg_type);
    buf.put_i32(4 + body.len() as i32);
    buf.put_slice(body);
    buf
}

fn row_description(columns: &[(String, u32)]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(columns.len() as i16);
    for (name, type_oid) in columns {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_u32(0);
        body.put_i16(0);
        body.put_u32(*type_oid);
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);
    }
    message(b'T', &body)
}

fn data_row(cells: &[Option<String>]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(cells.len() as i16);
    for cell in cells {
        match cell {
            Some(v) => {
                body.put_i32(v.len() as i32);
                body.put_slice(v.as_bytes());
            }
            None => body.put_i32(-1),
        }
    }
    message(b'D', &body)
}

fn error_response(code: &str, text: &str) -> BytesMut {
    let mut body = BytesMut::new();
    for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', text)] {
        body.put_u8(field);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    message(b'E', &body)
}
