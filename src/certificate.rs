//! TLS material for the proxy
//! Loads the listener certificate and builds the upstream client connector

use anyhow::{anyhow, bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Read every certificate in a PEM file (a chain is allowed)
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate {}", path.display()))?;

    if certs.is_empty() {
        bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open key {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("Failed to parse key {}", path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}

/// Build the acceptor for the TLS-terminated endpoint
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<TlsAcceptor> {
    if passphrase.is_some_and(|p| !p.is_empty()) {
        bail!("Encrypted private keys are not supported; provide an unencrypted key");
    }

    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Certificate and key do not match")?;

    // The listener only speaks HTTP/1.1
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!("Loaded TLS certificate from {}", cert_path.display());

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for HTTPS origins, trusting the webpki roots plus `extra_roots`
pub fn client_connector(extra_roots: &[CertificateDer<'static>]) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for cert in extra_roots {
        root_store
            .add(cert.clone())
            .context("Failed to add trust anchor")?;
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}
