//! Postgres Wire Protocol Primitives
//!
//! The frontend half of the Postgres v3 protocol needed to run simple queries:
//! startup and SSL negotiation, password/SASL responses, Query and Terminate,
//! and decoding of the backend messages a simple query produces.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, BytesMut};
use std::io;

use crate::query::Column;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Postgres protocol version 3.0
const PROTOCOL_VERSION_30: i32 = 196608; // 0x00030000

/// SSLRequest magic number
const SSL_REQUEST_CODE: i32 = 80877103;

/// Server's one-byte answers to SSLRequest
pub const SSL_ACCEPT: u8 = b'S';
pub const SSL_REFUSE: u8 = b'N';

/// Upper bound on a single backend message; anything larger is corruption.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Backend message types a query client sees.
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
}

/// Authentication request subtypes.
pub mod auth {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

// ─── Backend Message ────────────────────────────────────────────────────────

/// A complete message from the Postgres backend.
pub struct BackendMessage {
    /// Message type byte (e.g., b'T' for RowDescription)
    pub msg_type: u8,
    /// Payload after the length field
    pub payload: BytesMut,
}

impl BackendMessage {
    /// Authentication subtype, if this is an Authentication message.
    pub fn auth_subtype(&self) -> Option<i32> {
        if self.msg_type != backend::AUTHENTICATION || self.payload.len() < 4 {
            return None;
        }
        Some((&self.payload[..4]).get_i32())
    }

    pub fn is_ready_for_query(&self) -> bool {
        self.msg_type == backend::READY_FOR_QUERY
    }

    pub fn is_error_response(&self) -> bool {
        self.msg_type == backend::ERROR_RESPONSE
    }

    /// Bytes following the 4-byte auth subtype (SASL data, MD5 salt, ...).
    pub fn auth_data(&self) -> &[u8] {
        self.payload.get(4..).unwrap_or_default()
    }

    /// Extract human-readable error message from an ErrorResponse.
    pub fn error_message(&self) -> String {
        if !self.is_error_response() {
            return String::from("not an error");
        }
        let mut message = None;
        let mut detail = None;
        let mut code = None;

        for (field_type, value) in error_fields(&self.payload) {
            match field_type {
                b'M' => message = Some(value),
                b'D' => detail = Some(value),
                b'C' => code = Some(value),
                _ => {}
            }
        }

        let Some(message) = message else {
            return String::from("unknown error");
        };
        let mut out = match code {
            Some(code) => format!("{message} (SQLSTATE {code})"),
            None => message,
        };
        if let Some(detail) = detail {
            out.push_str(": ");
            out.push_str(&detail);
        }
        out
    }
}

/// Iterate `(field_type, value)` pairs of an ErrorResponse/NoticeResponse body.
fn error_fields(data: &[u8]) -> Vec<(u8, String)> {
    let mut fields = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let field_type = data[offset];
        if field_type == 0 {
            break;
        }
        offset += 1;
        let Some((value, next)) = read_cstr(data, offset) else {
            break;
        };
        fields.push((field_type, value));
        offset = next;
    }
    fields
}

/// Read a NUL-terminated string at `offset`. Returns the string and the offset
/// just past its terminator.
fn read_cstr(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let rest = data.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    let value = String::from_utf8_lossy(&rest[..end]).into_owned();
    Some((value, offset + end + 1))
}

// ─── Parsing ────────────────────────────────────────────────────────────────

/// Try to read a complete backend message from the buffer.
///
/// Backend messages: `u8 type | i32 length | payload`
/// Length includes itself (4 bytes) but not the type byte.
/// Returns `Ok(None)` if not enough data. Consumes the message from `buf` on success.
pub fn try_read_backend_message(buf: &mut BytesMut) -> io::Result<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let msg_type = buf[0];
    let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if length < 4 || length as usize > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid backend message length {length} for type '{}'", msg_type as char),
        ));
    }
    let total_length = 1 + length as usize;

    if buf.len() < total_length {
        return Ok(None);
    }

    let mut msg = buf.split_to(total_length);
    msg.advance(5);

    Ok(Some(BackendMessage {
        msg_type,
        payload: msg,
    }))
}

/// Parse column names and type OIDs from a RowDescription payload.
///
/// Per field: name (cstr), table_oid(4), col_num(2), type_oid(4), type_size(2),
/// type_modifier(4), format_code(2).
pub fn parse_row_description(payload: &[u8]) -> Option<Vec<Column>> {
    let field_count = i16::from_be_bytes([*payload.first()?, *payload.get(1)?]);
    let field_count = usize::try_from(field_count).ok()?;
    let mut columns = Vec::with_capacity(field_count);
    let mut offset = 2;

    for _ in 0..field_count {
        let (name, next) = read_cstr(payload, offset)?;
        let type_at = next + 6;
        let type_bytes = payload.get(type_at..type_at + 4)?;
        let type_oid = u32::from_be_bytes([type_bytes[0], type_bytes[1], type_bytes[2], type_bytes[3]]);
        offset = next + 18;
        if offset > payload.len() {
            return None;
        }
        columns.push(Column { name, type_oid });
    }

    Some(columns)
}

/// Parse a DataRow payload into text cells. Length -1 is SQL NULL.
pub fn parse_data_row(payload: &[u8]) -> Option<Vec<Option<String>>> {
    let field_count = i16::from_be_bytes([*payload.first()?, *payload.get(1)?]);
    let field_count = usize::try_from(field_count).ok()?;
    let mut cells = Vec::with_capacity(field_count);
    let mut offset = 2;

    for _ in 0..field_count {
        let len_bytes = payload.get(offset..offset + 4)?;
        let len = i32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        offset += 4;

        if len < 0 {
            cells.push(None);
            continue;
        }

        let len = len as usize;
        let value = payload.get(offset..offset + len)?;
        cells.push(Some(String::from_utf8_lossy(value).into_owned()));
        offset += len;
    }

    Some(cells)
}

/// SASL mechanisms advertised in an AuthenticationSASL body.
pub fn parse_sasl_mechanisms(data: &[u8]) -> Vec<String> {
    let mut mechanisms = Vec::new();
    let mut offset = 0;
    while let Some((name, next)) = read_cstr(data, offset) {
        if name.is_empty() {
            break;
        }
        mechanisms.push(name);
        offset = next;
    }
    mechanisms
}

// ─── Building ───────────────────────────────────────────────────────────────

/// Build a StartupMessage with the given parameters, in order.
pub fn build_startup_message(params: &[(&str, &str)]) -> BytesMut {
    let body_len: usize = params.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
    let total_len = 4 + 4 + body_len + 1;
    let mut buf = BytesMut::with_capacity(total_len);

    buf.put_i32(total_len as i32);
    buf.put_i32(PROTOCOL_VERSION_30);
    for (key, value) in params {
        put_cstr(&mut buf, key.as_bytes());
        put_cstr(&mut buf, value.as_bytes());
    }
    buf.put_u8(0); // terminal null

    buf
}

/// Build an SSLRequest.
pub fn build_ssl_request() -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32(8);
    buf.put_i32(SSL_REQUEST_CODE);
    buf
}

/// Build a SimpleQuery ('Q') message.
pub fn build_query_message(sql: &str) -> BytesMut {
    let mut buf = frame(b'Q', sql.len() + 1);
    put_cstr(&mut buf, sql.as_bytes());
    buf
}

/// Build a PasswordMessage ('p') carrying a NUL-terminated password or hash.
pub fn build_password_message(password: &[u8]) -> BytesMut {
    let mut buf = frame(b'p', password.len() + 1);
    put_cstr(&mut buf, password);
    buf
}

/// Build a SASLInitialResponse ('p').
pub fn build_sasl_initial_response(mechanism: &str, data: &[u8]) -> BytesMut {
    let mut buf = frame(b'p', mechanism.len() + 1 + 4 + data.len());
    put_cstr(&mut buf, mechanism.as_bytes());
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
    buf
}

/// Build a SASLResponse ('p').
pub fn build_sasl_response(data: &[u8]) -> BytesMut {
    let mut buf = frame(b'p', data.len());
    buf.put_slice(data);
    buf
}

/// Build a Terminate ('X') message.
pub fn build_terminate() -> BytesMut {
    frame(b'X', 0)
}

/// Start a typed frontend message whose body will be `body_len` bytes.
fn frame(msg_type: u8, body_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + 4 + body_len);
    buf.put_u8(msg_type);
    buf.put_i32((4 + body_len) as i32);
    buf
}

fn put_cstr(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(bytes);
    buf.put_u8(0);
}

// ─── Tests ──────────────────────────────────────────────────────────────────
