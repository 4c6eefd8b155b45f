//! TLS material and certificate policy
//!
//! Both the relay-facing listener and (optionally) the management listener
//! require mutual TLS: clients must present a certificate signed by the
//! configured CA before the dispatcher will talk to them. This module loads
//! that material from PEM files and builds the `rustls` server
//! configurations, plus the certificate acceptance predicate the source
//! dispatcher calls a client's "passport".

use crate::config::{CertPolicyConfig, TlsConfig};
use anyhow::Context;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

/// Load a chain of PEM-encoded certificates from `path`.
fn load_certs(path: &Path) -> crate::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open certificate file: {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in: {}", path.display()))
}

/// Load a single PEM-encoded private key from `path`.
fn load_private_key(path: &Path) -> crate::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open private key file: {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key in: {}", path.display()))?
        .with_context(|| format!("no private key found in: {}", path.display()))
}

/// Build a root store containing the CA certificate(s) at `path`.
fn load_root_store(path: &Path) -> crate::Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .with_context(|| format!("invalid CA certificate in: {}", path.display()))?;
    }
    Ok(store)
}

/// Identity and trust material loaded from disk, ready to build
/// `rustls::ServerConfig`s for the dispatcher's listeners.
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    relay_ca: RootCertStore,
    management_ca: Option<RootCertStore>,
}

impl TlsMaterial {
    /// Load the dispatcher's own certificate/key and CA trust roots from the
    /// paths named in configuration. Any failure here is fatal at startup.
    pub fn load(config: &TlsConfig) -> crate::Result<Self> {
        let certs = load_certs(&config.cert_file)?;
        let key = load_private_key(&config.key_file)?;
        let relay_ca = load_root_store(&config.relay_ca_file)?;
        let management_ca = config
            .management_ca_file
            .as_deref()
            .map(load_root_store)
            .transpose()?;

        Ok(Self {
            certs,
            key,
            relay_ca,
            management_ca,
        })
    }

    /// Build the `rustls::ServerConfig` for the relay-facing listener,
    /// requiring every connecting relay to present a certificate signed by
    /// `relay_ca_file`.
    pub fn relay_server_config(&self) -> crate::Result<Arc<RustlsServerConfig>> {
        self.mutual_tls_config(&self.relay_ca)
    }

    /// Build the `rustls::ServerConfig` for the management listener, when
    /// `management_use_tls` is set. Requires `management_ca_file` to have
    /// been configured; validated ahead of time in [`crate::config`].
    pub fn management_server_config(&self) -> crate::Result<Arc<RustlsServerConfig>> {
        let ca = self
            .management_ca
            .as_ref()
            .context("management TLS requested but no management CA was loaded")?;
        self.mutual_tls_config(ca)
    }

    fn mutual_tls_config(&self, ca: &RootCertStore) -> crate::Result<Arc<RustlsServerConfig>> {
        let verifier = WebPkiClientVerifier::builder(Arc::new(ca.clone()))
            .build()
            .context("failed to build client certificate verifier")?;

        let config = RustlsServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("failed to build TLS server configuration")?;

        Ok(Arc::new(config))
    }
}

/// An accept/reject predicate over a peer's TLS certificate -- the source
/// dispatcher's "passport". An empty fingerprint list accepts any peer the
/// handshake already mutually authenticated; a non-empty list additionally
/// requires the peer certificate's SHA-256 fingerprint to be present in it.
#[derive(Debug, Clone, Default)]
pub struct CertPolicy {
    fingerprints: Vec<String>,
}

impl CertPolicy {
    pub fn new(config: &CertPolicyConfig) -> Self {
        Self {
            fingerprints: config
                .fingerprints
                .iter()
                .map(|fp| fp.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Decide whether to accept a peer, given the certificate the TLS
    /// handshake authenticated (if any). Mutual TLS means a `None` here
    /// indicates the handshake itself didn't require a client certificate;
    /// a configured policy always rejects that case.
    pub fn accept(&self, peer_cert: Option<&CertificateDer<'_>>) -> bool {
        if self.fingerprints.is_empty() {
            return peer_cert.is_some();
        }

        let Some(cert) = peer_cert else {
            return false;
        };

        let fingerprint = Self::fingerprint(cert);
        self.fingerprints.contains(&fingerprint)
    }

    /// Lowercase hex SHA-256 fingerprint of a DER-encoded certificate.
    pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
        let digest = Sha256::digest(cert.as_ref());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_policy_accepts_any_authenticated_peer() {
        let policy = CertPolicy::new(&CertPolicyConfig::default());
        assert!(!policy.accept(None));

        let cert = CertificateDer::from(vec![9, 9, 9]);
        assert!(policy.accept(Some(&cert)));
    }

    #[test]
    fn nonempty_policy_requires_matching_fingerprint() {
        let policy = CertPolicy::new(&CertPolicyConfig {
            fingerprints: vec!["aa".repeat(32)],
        });
        let cert = CertificateDer::from(vec![1, 2, 3]);
        assert!(!policy.accept(Some(&cert)));
    }
}
