//! TLS client configuration and client certificate loading.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName, UnixTime,
};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use x509_parser::pem::Pem;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::error::{ProbeError, Result};

/// ALPN protocols offered on direct TLS connections.
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// A client certificate and the private key belonging to it.
#[derive(Debug)]
pub struct ClientCredential {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for ClientCredential {
    fn clone(&self) -> Self {
        Self {
            cert: self.cert.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Kind of PEM block, judged by the suffix of its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemKind {
    PrivateKey,
    Certificate,
    Other,
}

pub fn classify_pem_label(label: &str) -> PemKind {
    if label.ends_with("PRIVATE KEY") {
        PemKind::PrivateKey
    } else if label.ends_with("CERTIFICATE") {
        PemKind::Certificate
    } else {
        PemKind::Other
    }
}

fn private_key_from_pem(label: &str, contents: Vec<u8>) -> Option<PrivateKeyDer<'static>> {
    match label {
        "PRIVATE KEY" => Some(PrivatePkcs8KeyDer::from(contents).into()),
        "RSA PRIVATE KEY" => Some(PrivatePkcs1KeyDer::from(contents).into()),
        "EC PRIVATE KEY" => Some(PrivateSec1KeyDer::from(contents).into()),
        _ => None,
    }
}

/// Read a PEM bundle holding one private key and one certificate, in any
/// order. The last block of each kind wins. The pair is checked for
/// consistency here so a bad bundle fails before the handshake.
pub fn load_client_cert(path: &Path) -> Result<ClientCredential> {
    let cert_err = |reason: String| ProbeError::ClientCert {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = std::fs::read(path)
        .map_err(|e| cert_err(format!("failed to read client certificate file: {e}")))?;

    let mut key_pem: Option<Pem> = None;
    let mut cert_pem: Option<Pem> = None;
    for block in Pem::iter_from_buffer(&bytes) {
        let block = block.map_err(|e| cert_err(format!("malformed PEM data: {e}")))?;
        match classify_pem_label(&block.label) {
            PemKind::PrivateKey => key_pem = Some(block),
            PemKind::Certificate => cert_pem = Some(block),
            PemKind::Other => log::debug!("Skipping PEM block {:?}", block.label),
        }
    }

    let key_pem = key_pem.ok_or_else(|| cert_err("no private key found".to_string()))?;
    let cert_pem = cert_pem.ok_or_else(|| cert_err("no certificate found".to_string()))?;

    let key = private_key_from_pem(&key_pem.label, key_pem.contents)
        .ok_or_else(|| cert_err(format!("unsupported private key type {:?}", key_pem.label)))?;
    let cert = CertificateDer::from(cert_pem.contents);

    let credential = ClientCredential { cert, key };
    check_key_pair(&credential).map_err(cert_err)?;

    log::debug!("Loaded client certificate from {}", path.display());
    Ok(credential)
}

/// Verify that the private key parses and matches the certificate's public key.
fn check_key_pair(credential: &ClientCredential) -> std::result::Result<(), String> {
    let (_, cert) = x509_parser::parse_x509_certificate(credential.cert.as_ref())
        .map_err(|e| format!("invalid certificate: {e}"))?;

    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(credential.key.clone_key())
        .map_err(|e| format!("invalid private key: {e}"))?;

    let Some(key_spki) = signing_key.public_key() else {
        return Ok(());
    };
    let (_, key_spki) = SubjectPublicKeyInfo::from_der(key_spki.as_ref())
        .map_err(|e| format!("invalid private key: {e}"))?;

    if key_spki.subject_public_key.data != cert.public_key().subject_public_key.data {
        return Err("private key does not match certificate public key".to_string());
    }
    Ok(())
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Build the client TLS configuration shared by every hop of a probe.
///
/// TLS 1.2 is the minimum protocol version. `insecure` disables server
/// certificate verification entirely.
pub fn build_tls_config(
    insecure: bool,
    credential: Option<&ClientCredential>,
) -> Result<Arc<ClientConfig>> {
    let provider = crypto_provider();

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ProbeError::TlsConfig(e.to_string()))?
        .with_root_certificates(root_store);

    let mut config = match credential {
        Some(credential) => builder
            .with_client_auth_cert(vec![credential.cert.clone()], credential.key.clone_key())
            .map_err(|e| ProbeError::TlsConfig(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };

    if insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));
    }
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Server name sent in the SNI extension.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::TlsConfig(format!("invalid server name {host:?}: {e}")))
}

/// Certificate verifier used in insecure mode. Handshake signatures are still
/// checked so the negotiated keys stay meaningful.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_bundle(parts: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for part in parts {
            file.write_all(part.as_bytes()).unwrap();
            file.write_all(b"\n").unwrap();
        }
        file
    }

    #[test]
    fn test_classify_pem_labels() {
        assert_eq!(classify_pem_label("RSA PRIVATE KEY"), PemKind::PrivateKey);
        assert_eq!(classify_pem_label("EC PRIVATE KEY"), PemKind::PrivateKey);
        assert_eq!(classify_pem_label("PRIVATE KEY"), PemKind::PrivateKey);
        assert_eq!(classify_pem_label("CERTIFICATE"), PemKind::Certificate);
        assert_eq!(classify_pem_label("TRUSTED CERTIFICATE"), PemKind::Certificate);
        assert_eq!(classify_pem_label("CERTIFICATE REQUEST"), PemKind::Other);
        assert_eq!(classify_pem_label("PUBLIC KEY"), PemKind::Other);
    }

    #[test]
    fn test_load_client_cert_in_either_order() {
        let generated = rcgen::generate_simple_self_signed(vec!["client.test".to_string()]).unwrap();
        let cert_pem = generated.cert.pem();
        let key_pem = generated.key_pair.serialize_pem();

        for bundle in [
            write_bundle(&[&cert_pem, &key_pem]),
            write_bundle(&[&key_pem, &cert_pem]),
        ] {
            let credential = load_client_cert(bundle.path()).unwrap();
            assert_eq!(credential.cert.as_ref(), generated.cert.der().as_ref());
            assert!(build_tls_config(false, Some(&credential)).is_ok());
        }
    }

    #[test]
    fn test_missing_key_is_fatal_at_load_time() {
        let generated = rcgen::generate_simple_self_signed(vec!["client.test".to_string()]).unwrap();
        let bundle = write_bundle(&[&generated.cert.pem()]);

        let err = load_client_cert(bundle.path()).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("no private key found"));
    }

    #[test]
    fn test_mismatched_pair_is_fatal_at_load_time() {
        let first = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        let second = rcgen::generate_simple_self_signed(vec!["b.test".to_string()]).unwrap();
        let bundle = write_bundle(&[&first.cert.pem(), &second.key_pair.serialize_pem()]);

        let err = load_client_cert(bundle.path()).unwrap_err();
        assert!(matches!(err, ProbeError::ClientCert { .. }));
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_unreadable_cert_file() {
        let err = load_client_cert(Path::new("/nonexistent/client.pem")).unwrap_err();
        assert!(matches!(err, ProbeError::ClientCert { .. }));
    }

    #[test]
    fn test_tls_config_offers_alpn() {
        let config = build_tls_config(true, None).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_server_name_accepts_ip_literals() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
        assert!(server_name("bad host").is_err());
    }
}
