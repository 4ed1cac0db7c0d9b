//! HTTP agents configured with the TLS verification mode.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

use crate::config::{RetrievalConfig, TlsVerification};

use super::HttpError;

/// Build an agent for a single operation.
///
/// Redirects are never followed, so the caller can see the `Location`
/// header of the response.
pub(super) fn agent(config: &RetrievalConfig) -> Result<ureq::Agent, HttpError> {
    let timeout = config.timeout_duration();

    let builder = ureq::AgentBuilder::new()
        .redirects(0)
        .timeout_connect(timeout)
        .timeout_read(timeout);

    let builder = match &config.verify_ca {
        TlsVerification::System => builder,
        TlsVerification::Disabled => builder.tls_config(Arc::new(insecure_config()?)),
        TlsVerification::CaBundle(path) => builder.tls_config(Arc::new(bundle_config(path)?)),
    };

    Ok(builder.build())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// TLS configuration to trust only the certificates in the PEM file `path`.
fn bundle_config(path: &Path) -> Result<ClientConfig, HttpError> {
    let file = File::open(path).map_err(|e| HttpError::CaBundle(e, path.to_owned()))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|e| HttpError::CaBundle(e, path.to_owned()))?;
        roots.add(cert)?;
    }

    if roots.is_empty() {
        return Err(HttpError::NoCertificates(path.to_owned()));
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}

/// TLS configuration to accept any certificate.
fn insecure_config() -> Result<ClientConfig, HttpError> {
    let provider = provider();

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();

    Ok(config)
}

/// Certificate verifier that skips the validation of the certificate chain.
///
/// Handshake signatures are still verified.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[test]
fn build_agents_for_all_modes() {
    let config = RetrievalConfig::default();
    assert!(agent(&config).is_ok());

    let config = RetrievalConfig::default().verify_ca(TlsVerification::Disabled);
    assert!(agent(&config).is_ok());
}

#[test]
fn reject_invalid_ca_bundles() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing.pem");
    let config = RetrievalConfig::default().verify_ca(TlsVerification::CaBundle(missing));
    assert!(matches!(agent(&config), Err(HttpError::CaBundle(..))));

    let empty = dir.path().join("empty.pem");
    std::fs::write(&empty, "no certificates here\n").unwrap();
    let config = RetrievalConfig::default().verify_ca(TlsVerification::CaBundle(empty));
    assert!(matches!(agent(&config), Err(HttpError::NoCertificates(_))));
}
