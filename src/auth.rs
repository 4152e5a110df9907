//! Authentication to tenant databases: cleartext, MD5, and SCRAM-SHA-256.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::connection::PgConnection;
use crate::error::ConnectError;
use crate::protocol::{
    auth, build_password_message, build_sasl_initial_response, build_sasl_response,
    parse_sasl_mechanisms,
};

type HmacSha256 = Hmac<Sha256>;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Answer authentication requests until the server sends AuthenticationOk.
pub async fn authenticate(
    conn: &mut PgConnection,
    user: &str,
    password: &str,
) -> Result<(), ConnectError> {
    loop {
        let msg = conn.next_message().await?;
        if msg.is_error_response() {
            return Err(ConnectError::Auth(msg.error_message()));
        }
        let Some(subtype) = msg.auth_subtype() else {
            return Err(ConnectError::Auth(format!(
                "unexpected message '{}' before authentication completed",
                msg.msg_type as char
            )));
        };

        match subtype {
            auth::OK => {
                debug!(user, "authenticated");
                return Ok(());
            }
            auth::CLEARTEXT_PASSWORD => {
                debug!(user, "server wants cleartext password");
                conn.send(&build_password_message(password.as_bytes())).await?;
            }
            auth::MD5_PASSWORD => {
                debug!(user, "server wants MD5 password");
                let salt = msg
                    .auth_data()
                    .get(..4)
                    .ok_or_else(|| ConnectError::Auth("MD5 request without salt".into()))?;
                let hashed = md5_password(user, password, salt);
                conn.send(&build_password_message(hashed.as_bytes())).await?;
            }
            auth::SASL => {
                let mechanisms = parse_sasl_mechanisms(msg.auth_data());
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(ConnectError::Auth(format!(
                        "no supported SASL mechanism in {mechanisms:?}"
                    )));
                }
                debug!(user, "server wants SCRAM-SHA-256");
                scram_exchange(conn, password).await?;
            }
            other => {
                return Err(ConnectError::Auth(format!(
                    "unsupported authentication method {other}"
                )));
            }
        }
    }
}

/// Run the SASL conversation. AuthenticationOk is left for the caller.
async fn scram_exchange(conn: &mut PgConnection, password: &str) -> Result<(), ConnectError> {
    // Postgres takes the user from the startup message and ignores n= here.
    let mut scram = ScramClient::new("", password);

    let first = scram.client_first();
    conn.send(&build_sasl_initial_response(SCRAM_SHA_256, first.as_bytes()))
        .await?;

    let server_first = expect_sasl(conn, auth::SASL_CONTINUE).await?;
    let client_final = scram.client_final(&server_first)?;
    conn.send(&build_sasl_response(client_final.as_bytes())).await?;

    let server_final = expect_sasl(conn, auth::SASL_FINAL).await?;
    scram.verify_server_final(&server_final)
}

async fn expect_sasl(conn: &mut PgConnection, subtype: i32) -> Result<String, ConnectError> {
    let msg = conn.next_message().await?;
    if msg.is_error_response() {
        return Err(ConnectError::Auth(msg.error_message()));
    }
    if msg.auth_subtype() != Some(subtype) {
        return Err(ConnectError::Auth(format!(
            "expected SASL step {subtype}, got {:?}",
            msg.auth_subtype()
        )));
    }
    Ok(String::from_utf8_lossy(msg.auth_data()).into_owned())
}

// ─── MD5 ────────────────────────────────────────────────────────────────────

/// `md5` || hex(md5(hex(md5(password || user)) || salt))
pub fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let inner = hex(&Md5::new()
        .chain_update(password.as_bytes())
        .chain_update(user.as_bytes())
        .finalize());
    let outer = hex(&Md5::new()
        .chain_update(inner.as_bytes())
        .chain_update(salt)
        .finalize());
    format!("md5{outer}")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ─── SCRAM-SHA-256 (RFC 5802 / RFC 7677) ────────────────────────────────────

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramClient {
    password: String,
    nonce: String,
    client_first_bare: String,
    expected_server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        Self::with_nonce(user, password, &generate_nonce())
    }

    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first_bare: format!("n={user},r={nonce}"),
            expected_server_signature: None,
        }
    }

    /// client-first-message, without channel binding.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume server-first-message and produce client-final-message.
    pub fn client_final(&mut self, server_first: &str) -> Result<String, ConnectError> {
        let (server_nonce, salt_b64, iterations) = parse_server_first(server_first)?;
        if !server_nonce.starts_with(&self.nonce) {
            return Err(ConnectError::Auth(
                "SCRAM server nonce does not extend client nonce".into(),
            ));
        }
        let salt = B64
            .decode(salt_b64)
            .map_err(|e| ConnectError::Auth(format!("SCRAM salt is not base64: {e}")))?;

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let server_key = hmac_sha256(&salted_password, b"Server Key");

        let without_proof = format!("c=biws,r={server_nonce}");
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.expected_server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));
        Ok(format!("{without_proof},p={}", B64.encode(proof)))
    }

    /// Check the server's signature from server-final-message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), ConnectError> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ConnectError::Auth(format!("SCRAM rejected: {err}")));
        }
        let expected = self
            .expected_server_signature
            .as_ref()
            .ok_or_else(|| ConnectError::Auth("SCRAM final before client proof".into()))?;
        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| ConnectError::Auth("SCRAM server-final without verifier".into()))?;
        let signature = B64
            .decode(verifier)
            .map_err(|e| ConnectError::Auth(format!("SCRAM verifier is not base64: {e}")))?;
        if &signature != expected {
            return Err(ConnectError::Auth("SCRAM server signature mismatch".into()));
        }
        Ok(())
    }
}

/// Parse server-first-message into (nonce, salt_b64, iterations).
fn parse_server_first(msg: &str) -> Result<(&str, &str, u32), ConnectError> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(v) = part.strip_prefix("r=") {
            nonce = Some(v);
        } else if let Some(v) = part.strip_prefix("s=") {
            salt = Some(v);
        } else if let Some(v) = part.strip_prefix("i=") {
            let parsed = v
                .parse::<u32>()
                .map_err(|e| ConnectError::Auth(format!("SCRAM iteration count: {e}")))?;
            iterations = Some(parsed);
        }
    }

    match (nonce, salt, iterations) {
        (Some(n), Some(s), Some(i)) if i > 0 => Ok((n, s, i)),
        _ => Err(ConnectError::Auth(format!("incomplete SCRAM server-first: {msg}"))),
    }
}

/// PBKDF2-HMAC-SHA256 (Hi from RFC 5802).
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn generate_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    B64.encode(bytes)
}
