//! TLS configuration, connector and acceptor builders.

use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS configuration for dialed connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, system roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to hostname from address).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// TLS configuration for listening servers.
#[derive(Debug, Clone, Default)]
pub struct TlsServerConfig {
    /// Path to the PEM-encoded server certificate chain.
    pub cert_path: Option<PathBuf>,
    /// Path to the PEM-encoded server private key.
    pub key_path: Option<PathBuf>,
    /// Require and verify client certificates (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) validating client certs.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsServerConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: Some(cert_path.into()),
            key_path: Some(key_path.into()),
            ..Default::default()
        }
    }

    pub fn with_client_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_ca_path = Some(path.into());
        self.require_client_cert = true;
        self
    }
}

/// Creates a TLS connector from client configuration.
pub fn create_tls_connector(
    config: &TlsClientConfig,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), Error> {
    let root_store = if let Some(ref ca_path) = config.ca_cert_path {
        let certs = load_certs(ca_path)?;
        let mut store = RootCertStore::empty();
        for cert in certs {
            store
                .add(cert)
                .map_err(|e| Error::TlsConfig(format!("invalid CA cert: {}", e)))?;
        }
        store
    } else {
        let mut store = RootCertStore::empty();
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        store
    };

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

    let client_config = if let (Some(cert_path), Some(key_path)) =
        (&config.client_cert_path, &config.client_key_path)
    {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| Error::TlsConfig(format!("invalid client cert/key: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };

    let connector = TlsConnector::from(Arc::new(client_config));
    Ok((connector, server_name(config, server_host)?))
}

/// Creates an insecure TLS connector that skips certificate verification.
/// WARNING: Only use for development/testing.
pub fn create_insecure_tls_connector(
    config: &TlsClientConfig,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::UnixTime;
    use rustls::DigitallySignedStruct;

    #[derive(Debug)]
    struct InsecureVerifier;

    impl ServerCertVerifier for InsecureVerifier {
        fn verify_server_cert(
            &self,
            _: &CertificateDer<'_>,
            _: &[CertificateDer<'_>],
            _: &ServerName<'_>,
            _: &[u8],
            _: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _: &[u8],
            _: &CertificateDer<'_>,
            _: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::RSA_PKCS1_SHA384,
                rustls::SignatureScheme::RSA_PKCS1_SHA512,
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
                rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA384,
                rustls::SignatureScheme::RSA_PSS_SHA512,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }

    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(client_config));
    Ok((connector, server_name(config, server_host)?))
}

/// Creates a TLS acceptor from server configuration.
pub fn create_tls_acceptor(config: &TlsServerConfig) -> Result<TlsAcceptor, Error> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| Error::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| Error::TlsConfig("key_path not set".into()))?;

    if config.require_client_cert && config.client_ca_path.is_none() {
        return Err(Error::TlsConfig("client_ca_path not set for mTLS".into()));
    }

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = if config.require_client_cert {
        let client_ca_path = config.client_ca_path.as_ref().expect("already validated");

        let client_certs = load_certs(client_ca_path)?;
        let mut root_store = RootCertStore::empty();
        for cert in client_certs {
            root_store
                .add(cert)
                .map_err(|e| Error::TlsConfig(format!("invalid client CA cert: {}", e)))?;
        }

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| Error::TlsConfig(format!("failed to build client verifier: {}", e)))?;

        rustls::ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsConfig(format!("invalid server cert/key: {}", e)))?
    } else {
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsConfig(format!("invalid server cert/key: {}", e)))?
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn server_name(
    config: &TlsClientConfig,
    server_host: &str,
) -> Result<ServerName<'static>, Error> {
    let name = config.server_name.as_deref().unwrap_or(server_host);
    ServerName::try_from(name.to_string())
        .map_err(|_| Error::TlsConfig(format!("invalid server name: {}", name)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path)
        .map_err(|e| Error::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(Error::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}
