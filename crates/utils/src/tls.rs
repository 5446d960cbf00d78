use std::{
    error::Error,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    server::ServerSessionMemoryCache,
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tracing::warn;

/// Client side TLS settings used for the `STARTTLS` upgrade.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM file with additional CA certificates to trust.
    pub ca_cert: Option<PathBuf>,

    /// Additional trusted certificates, already in DER form.
    pub root_certs: Vec<CertificateDer<'static>>,

    /// Skips certificate verification altogether, only meant for local
    /// servers using self-signed certificates.
    pub accept_invalid_certs: bool,

    /// Name to verify the certificate against, defaults to the host.
    pub server_name: Option<String>,
}

/// Builds the client configuration from the options, trusting the
/// webpki roots plus the configured CA certificates.
pub fn load_tls_client_config(options: &TlsOptions) -> Result<ClientConfig, Box<dyn Error + Send + Sync>> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_path) = &options.ca_cert {
        let (added, ignored) = root_store.add_parsable_certificates(load_certs(ca_path)?);
        if ignored > 0 {
            warn!(path = %ca_path.display(), added, ignored, "Some CA certificates were ignored");
        }
    }
    root_store.add_parsable_certificates(options.root_certs.iter().cloned());

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if options.accept_invalid_certs {
        warn!("TLS certificate verification disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    }

    Ok(config)
}

/// Loads the TLS server configuration from PEM files.
///
/// The files should be structured as follows:
/// cert: the certificate chain, leaf first.
/// key: the private key, PKCS8 or PKCS1 (RSA).
pub fn load_tls_server_config(
    cert_path: impl Into<PathBuf>,
    key_path: impl Into<PathBuf>,
) -> Result<ServerConfig, Box<dyn Error + Send + Sync>> {
    let cert_chain = load_certs(&cert_path.into())?;
    let key = load_private_key(&key_path.into())?;
    tls_server_config(cert_chain, key)
}

/// Creates a server configuration from an in-memory chain and key.
pub fn tls_server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, Box<dyn Error + Send + Sync>> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    // Allow multiple sessions per client, making it possible to
    // re-use the same TLS connection for multiple SMTP sessions
    config.session_storage = ServerSessionMemoryCache::new(256);
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Box<dyn Error + Send + Sync>> {
    let reader = &mut BufReader::new(File::open(path)?);
    let chain: Vec<CertificateDer<'static>> = certs(reader)?
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    if chain.is_empty() {
        return Err(format!("No certificates found in {}", path.display()).into());
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Box<dyn Error + Send + Sync>> {
    let mut keys = pkcs8_private_keys(&mut BufReader::new(File::open(path)?))?;
    if !keys.is_empty() {
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(keys.remove(0))));
    }

    let mut keys = rsa_private_keys(&mut BufReader::new(File::open(path)?))?;
    if !keys.is_empty() {
        return Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(keys.remove(0))));
    }

    Err(format!("No private key found in {}", path.display()).into())
}

/// Verifier that trusts any certificate, used when verification is
/// explicitly disabled.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
