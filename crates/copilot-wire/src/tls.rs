//! Node TLS identity and certificate pinning.
//!
//! Every node owns one self-signed ECDSA P-384 certificate whose subject CN
//! is the node name. Both ends of a connection present their certificate;
//! neither validates a chain. Instead the verifiers below accept any
//! certificate (while still checking the handshake signatures, which proves
//! possession of the key) and the session pins the fingerprint afterwards.
//! The pinned fingerprint is the certificate's signature, so a certificate
//! is only accepted when that signature verifies against its own key.

use crate::error::{WireError, WireResult};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;
use x509_parser::prelude::{FromDer, X509Certificate};

/// The identity facts a session needs from a peer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Subject common name; the peer's node name.
    pub common_name: String,
    /// Lowercase hex of the certificate's signature bytes.
    pub fingerprint: String,
}

impl PeerCertificate {
    /// Parse a DER certificate.
    ///
    /// The certificate must carry a valid signature by its own key, since the
    /// signature bytes are what gets pinned.
    pub fn from_der(der: &[u8]) -> WireResult<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| WireError::Certificate(format!("unparsable certificate: {e}")))?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .ok_or_else(|| WireError::Certificate("certificate has no common name".into()))?
            .to_string();
        cert.verify_signature(None).map_err(|e| {
            WireError::Certificate(format!(
                "certificate of '{common_name}' is not self-signed by its key: {e}"
            ))
        })?;
        Ok(Self {
            common_name,
            fingerprint: hex::encode(&cert.signature_value.data),
        })
    }

    /// Pick the end-entity certificate out of a handshake's peer chain.
    pub fn from_chain(chain: Option<&[CertificateDer<'_>]>) -> WireResult<Self> {
        let first = chain
            .and_then(|certs| certs.first())
            .ok_or(WireError::MissingPeerCertificate)?;
        Self::from_der(first.as_ref())
    }
}

/// This node's certificate and private key.
pub struct TlsIdentity {
    node_name: String,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    fingerprint: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("node_name", &self.node_name)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Generate a self-signed certificate for `node_name`. Returns `(cert_pem, key_pem)`.
pub fn generate_pem(node_name: &str) -> WireResult<(String, String)> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "DE");
    dn.push(DnType::StateOrProvinceName, "UNKNOWN");
    dn.push(DnType::LocalityName, "UNKNOWN");
    dn.push(DnType::OrganizationName, "COPILOTD");
    dn.push(DnType::OrganizationalUnitName, "DAEMON");
    dn.push(DnType::CommonName, node_name);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?;
    let cert = params.self_signed(&key_pair)?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

impl TlsIdentity {
    /// Build an identity from PEM text.
    pub fn from_pem(node_name: &str, cert_pem: &str, key_pem: &str) -> WireResult<Self> {
        let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()?;
        if cert_chain.is_empty() {
            return Err(WireError::Certificate("no certificate in PEM".into()));
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
            .ok_or_else(|| WireError::Certificate("no private key in PEM".into()))?;
        let fingerprint = PeerCertificate::from_der(cert_chain[0].as_ref())?.fingerprint;
        Ok(Self {
            node_name: node_name.to_string(),
            cert_chain,
            key,
            fingerprint,
        })
    }

    /// A fresh identity that only lives in memory.
    pub fn generate(node_name: &str) -> WireResult<Self> {
        let (cert_pem, key_pem) = generate_pem(node_name)?;
        Self::from_pem(node_name, &cert_pem, &key_pem)
    }

    /// Paths of the certificate and key files for `node_name` under `dir`.
    pub fn paths(dir: &Path, node_name: &str) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{node_name}.crt")),
            dir.join(format!("{node_name}.key")),
        )
    }

    /// Load `<node>.crt` / `<node>.key` from `dir`, generating them first if
    /// either is missing.
    pub fn load_or_generate(dir: &Path, node_name: &str) -> WireResult<Self> {
        let (cert_path, key_path) = Self::paths(dir, node_name);
        if !cert_path.exists() || !key_path.exists() {
            let (cert_pem, key_pem) = generate_pem(node_name)?;
            std::fs::create_dir_all(dir)?;
            std::fs::write(&cert_path, cert_pem)?;
            write_private(&key_path, key_pem.as_bytes())?;
            info!(node = %node_name, path = %cert_path.display(), "Generated node certificate");
        }
        let cert_pem = std::fs::read_to_string(&cert_path)?;
        let key_pem = zeroize::Zeroizing::new(std::fs::read_to_string(&key_path)?);
        Self::from_pem(node_name, &cert_pem, &key_pem)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Fingerprint peers pin for this node.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Server side: demand a client certificate, accept any.
    pub fn server_config(&self) -> WireResult<Arc<ServerConfig>> {
        let provider = crypto_provider();
        let verifier = Arc::new(AnyClientCert {
            provider: Arc::clone(&provider),
        });
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    /// Client side: present our certificate, accept any server certificate.
    pub fn client_config(&self) -> WireResult<Arc<ClientConfig>> {
        let provider = crypto_provider();
        let verifier = Arc::new(AnyServerCert {
            provider: Arc::clone(&provider),
        });
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> WireResult<TlsAcceptor> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }

    pub fn connector(&self) -> WireResult<TlsConnector> {
        Ok(TlsConnector::from(self.client_config()?))
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Accepts every client certificate; identity is settled by pinning.
#[derive(Debug)]
struct AnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AnyClientCert {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts every server certificate; identity is settled by pinning.
#[derive(Debug)]
struct AnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
