//! TLS for the transfer socket
//!
//! The byte protocol is the same with or without TLS; this module only
//! builds the acceptor and connector that wrap the TCP stream. When a CA
//! certificate is configured both sides authenticate (mutual TLS).
//!
//! A node's identity comes from `cert_path` + `key_path`, or from a single
//! PEM keystore holding chain and key. Trusted roots are the CA certificate
//! plus the truststore bundle, falling back to the platform roots when
//! neither is set.

use crate::config::ClusterTlsConfig;
use crate::error::{ClusterError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Either side of a transfer connection
pub(crate) trait TransferStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransferStream for T {}

pub(crate) type BoxedStream = Box<dyn TransferStream>;

/// Stream wrappers for both ends; plain TCP when TLS is disabled
#[derive(Clone, Default)]
pub(crate) struct TransferTls {
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
}

impl TransferTls {
    pub(crate) fn from_config(config: &ClusterTlsConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::default());
        }
        Ok(Self {
            acceptor: Some(TlsAcceptor::from(Arc::new(build_server_config(config)?))),
            connector: Some(TlsConnector::from(Arc::new(build_client_config(config)?))),
        })
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.acceptor.is_some()
    }

    pub(crate) async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        match &self.acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ClusterError::Tls(format!("TLS accept failed: {}", e)))?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }

    pub(crate) async fn connect(&self, host: &str, stream: TcpStream) -> Result<BoxedStream> {
        match &self.connector {
            Some(connector) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| ClusterError::Tls(format!("Invalid server name {}: {}", host, e)))?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| ClusterError::Tls(format!("TLS connect to {} failed: {}", host, e)))?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

/// Pinned to ring; the process-wide default is ambiguous when another
/// dependency enables a second provider
fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn build_server_config(config: &ClusterTlsConfig) -> Result<rustls::ServerConfig> {
    let (certs, key) = load_identity(config)?;
    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ClusterError::Tls(format!("Unsupported TLS versions: {}", e)))?;

    let builder = if config.ca_cert_path.is_some() {
        let roots = configured_roots(config)?.unwrap_or_else(RootCertStore::empty);
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .map_err(|e| ClusterError::Tls(format!("Failed to build client verifier: {}", e)))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| ClusterError::Tls(format!("Failed to build server TLS config: {}", e)))
}

fn build_client_config(config: &ClusterTlsConfig) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ClusterError::Tls(format!("Unsupported TLS versions: {}", e)))?;
    let builder = if config.skip_verify {
        tracing::warn!("Transfer TLS verification disabled - INSECURE");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    } else {
        let roots = match configured_roots(config)? {
            Some(roots) => roots,
            None => native_roots(),
        };
        builder.with_root_certificates(roots)
    };

    // Present our own certificate when the peers verify clients
    if config.ca_cert_path.is_some() {
        let (certs, key) = load_identity(config)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClusterError::Tls(format!("Failed to set client certificate: {}", e)))
    } else {
        Ok(builder.with_no_client_auth())
    }
}

/// CA certificate plus truststore; `None` when neither is configured
fn configured_roots(config: &ClusterTlsConfig) -> Result<Option<RootCertStore>> {
    let sources: Vec<&Path> = [&config.ca_cert_path, &config.truststore_path]
        .into_iter()
        .flatten()
        .map(PathBuf::as_path)
        .collect();
    if sources.is_empty() {
        return Ok(None);
    }

    let mut roots = RootCertStore::empty();
    for path in sources {
        let certs = load_certs(path)?;
        if certs.is_empty() {
            return Err(ClusterError::Tls(format!(
                "No CA certificates found in {:?}",
                path
            )));
        }
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| ClusterError::Tls(format!("Failed to add CA cert from {:?}: {}", path, e)))?;
        }
    }
    Ok(Some(roots))
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::debug!(error = %error, "Skipping unreadable system certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "Loaded system root certificates");
    roots
}

fn load_identity(
    config: &ClusterTlsConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let (cert_path, key_path) = match (&config.cert_path, &config.key_path, &config.keystore_path) {
        (Some(cert), Some(key), _) => (cert.as_path(), key.as_path()),
        (_, _, Some(keystore)) => (keystore.as_path(), keystore.as_path()),
        _ => {
            return Err(ClusterError::Tls(
                "no TLS identity: set tls.cert_path and tls.key_path, or tls.keystore_path".into(),
            ))
        }
    };

    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(ClusterError::Tls(format!(
            "No certificates found in {:?}",
            cert_path
        )));
    }
    Ok((certs, load_key(key_path)?))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ClusterError::Tls(format!("Failed to open cert file {:?}: {}", path, e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ClusterError::Tls(format!("Failed to parse certificates in {:?}: {}", path, e)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ClusterError::Tls(format!("Failed to open key file {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ClusterError::Tls(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| ClusterError::Tls(format!("No private key found in {:?}", path)))
}

/// Certificate verifier that accepts anything (INSECURE)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures/tls")
            .join(name)
    }

    #[test]
    fn test_disabled_is_plain() {
        let tls = TransferTls::from_config(&ClusterTlsConfig::default()).unwrap();
        assert!(!tls.is_enabled());
    }

    #[test]
    fn test_missing_material_is_tls_error() {
        let config = ClusterTlsConfig {
            enabled: true,
            cert_path: Some(PathBuf::from("/nonexistent/node.pem")),
            key_path: Some(PathBuf::from("/nonexistent/node.key")),
            ..Default::default()
        };
        let err = TransferTls::from_config(&config).err().unwrap();
        assert_eq!(err.error_type(), "tls");
    }

    #[test]
    fn test_keystore_supplies_chain_and_key() {
        let config = ClusterTlsConfig {
            enabled: true,
            keystore_path: Some(fixture("node-keystore.pem")),
            ..Default::default()
        };
        let (certs, _key) = load_identity(&config).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(TransferTls::from_config(&config).unwrap().is_enabled());
    }

    #[test]
    fn test_truststore_joins_ca_roots() {
        let config = ClusterTlsConfig {
            ca_cert_path: Some(fixture("ca.pem")),
            truststore_path: Some(fixture("ca.pem")),
            ..Default::default()
        };
        assert_eq!(configured_roots(&config).unwrap().unwrap().len(), 2);

        let only_truststore = ClusterTlsConfig {
            truststore_path: Some(fixture("ca.pem")),
            ..Default::default()
        };
        assert_eq!(configured_roots(&only_truststore).unwrap().unwrap().len(), 1);
        assert!(configured_roots(&ClusterTlsConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_key_file_is_not_a_truststore() {
        let config = ClusterTlsConfig {
            truststore_path: Some(fixture("node.key")),
            ..Default::default()
        };
        let err = configured_roots(&config).unwrap_err();
        assert_eq!(err.error_type(), "tls");
    }
}
