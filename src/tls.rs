//! TLS client configuration for tenant connections.

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use crate::error::ConnectError;

/// How a tenant connection should verify the server certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Accept any certificate (dev / self-signed).
    Skip,
    /// Trust the bundled web PKI roots.
    WebPki,
    /// Trust only the CAs in the given PEM file.
    CustomCa(String),
}

impl Verification {
    pub fn from_settings(verify: bool, ca_path: Option<&str>) -> Self {
        match (verify, ca_path) {
            (false, _) => Self::Skip,
            (true, Some(ca)) => Self::CustomCa(ca.to_string()),
            (true, None) => Self::WebPki,
        }
    }
}

/// Build a `ClientConfig` for TLS to a tenant database.
pub fn client_config(verification: &Verification) -> Result<Arc<ClientConfig>, ConnectError> {
    let config = match verification {
        Verification::Skip => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
        Verification::WebPki => {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        Verification::CustomCa(path) => ClientConfig::builder()
            .with_root_certificates(load_roots(path)?)
            .with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Parse the tenant host into a `ServerName` for the handshake.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ConnectError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ConnectError::Tls(format!("invalid server name '{host}': {e}")))
}

fn load_roots(path: &str) -> Result<RootCertStore, ConnectError> {
    let file = File::open(path).map_err(|e| ConnectError::Tls(format!("{path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| ConnectError::Tls(format!("{path}: {e}")))?;
    if certs.is_empty() {
        return Err(ConnectError::Tls(format!("{path}: no certificates found")));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| ConnectError::Tls(format!("{path}: {e}")))?;
    }
    Ok(roots)
}

// ─── AcceptAnyCert (skip-verify mode) ───────────────────────────────────────

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_from_settings() {
        assert_eq!(Verification::from_settings(false, Some("/ca.pem")), Verification::Skip);
        assert_eq!(Verification::from_settings(true, None), Verification::WebPki);
        assert_eq!(
            Verification::from_settings(true, Some("/ca.pem")),
            Verification::CustomCa("/ca.pem".into())
        );
    }

    #[test]
    fn missing_ca_file_is_tls_error() {
        let err = client_config(&Verification::CustomCa("/nonexistent/ca.pem".into())).unwrap_err();
        assert!(matches!(err, ConnectError::Tls(_)));
    }

    #[test]
    fn server_name_accepts_dns_and_ip() {
        assert!(server_name("db1.internal").is_ok());
        assert!(server_name("10.0.0.5").is_ok());
    }
}
