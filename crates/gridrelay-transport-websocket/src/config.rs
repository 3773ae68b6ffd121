//! WebSocket transport configuration

use gridrelay_transport::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// PEM bundle of trusted roots for the coordinator (webpki roots when unset)
    pub ca_bundle: Option<PathBuf>,

    /// Whether to verify the coordinator's certificate
    pub verify_server_cert: bool,

    /// Time allowed for TCP connect + TLS + WebSocket handshake
    pub connect_timeout: Duration,

    /// Maximum inbound message size
    pub max_message_size: usize,

    /// Capacity of the inbound/outbound frame queues
    pub queue_capacity: usize,
}

impl WebSocketConfig {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            ca_bundle: None,
            verify_server_cert: true,
            connect_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024 * 1024, // 64MB
            queue_capacity: 256,
        }
    }

    /// Trust only the certificates in the given PEM bundle
    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle = Some(path.into());
        self
    }

    /// Set custom handshake timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.queue_capacity == 0 {
            return Err(TransportError::ConfigurationError(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(path) = &self.ca_bundle {
            if !path.exists() {
                return Err(TransportError::ConfigurationError(format!(
                    "CA bundle not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Build rustls ClientConfig for the coordinator handshake
    pub(crate) fn build_tls_config(&self) -> TransportResult<Arc<rustls::ClientConfig>> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();

        match &self.ca_bundle {
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            Some(path) => {
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
                }
            }
        }

        let client_crypto = if self.verify_server_cert {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        Ok(Arc::new(client_crypto))
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self::client_default()
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open CA bundle: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse CA bundle: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = WebSocketConfig::client_default();
        assert!(config.verify_server_cert);
        assert!(config.ca_bundle.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_ca_bundle_is_rejected() {
        let config = WebSocketConfig::client_default().with_ca_bundle("/nonexistent/websocket.pem");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_roots_build() {
        let config = WebSocketConfig::client_default();
        assert!(config.build_tls_config().is_ok());
        assert!(config.with_insecure_skip_verify().build_tls_config().is_ok());
    }
}
