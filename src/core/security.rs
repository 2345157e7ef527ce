use std::sync::Arc;
use std::time::SystemTime;

use log::warn;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::server::{ClientCertVerified, ClientCertVerifier};
use rustls::{Certificate, ClientConfig, DistinguishedNames, Error as TlsError, PrivateKey, ServerConfig, ServerName};

use crate::core::error::Kind;
use crate::core::identity::Certificate as IdentityCertificate;

fn decode_x509(der: &[u8]) -> Result<x509_parser::certificate::X509Certificate, TlsError> {
    x509_parser::parse_x509_certificate(der)
        .map(|(_, cert)| cert)
        .map_err(|e| TlsError::General(format!("certificate does not decode: {}", e)))
}

/// Server-side verifier for §4.7: a client certificate is mandatory, but any
/// certificate that decodes as valid X.509 is accepted. No chain-of-trust
/// check, since peer trust here comes from the `/Ask` consent dialog.
struct AcceptAnyDecodableClientCert;

impl ClientCertVerifier for AcceptAnyDecodableClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn client_auth_root_subjects(&self) -> Option<DistinguishedNames> {
        Some(DistinguishedNames::new())
    }

    fn verify_client_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> Result<ClientCertVerified, TlsError> {
        decode_x509(&end_entity.0)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &Certificate,
        dss: &rustls::internal::msgs::handshake::DigitallySignedStruct,
    ) -> Result<rustls::client::HandshakeSignatureValid, TlsError> {
        rustls::client::verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &Certificate,
        dss: &rustls::internal::msgs::handshake::DigitallySignedStruct,
    ) -> Result<rustls::client::HandshakeSignatureValid, TlsError> {
        rustls::client::verify_tls13_signature(message, cert, dss)
    }
}

/// Client-side verifier for §4.7: rejects a server certificate only when it
/// fails to decode or is already expired. Chain-of-trust failures are
/// explicitly tolerated (self-signed peers are the norm here).
struct AcceptUnexpiredServerCert;

impl ServerCertVerifier for AcceptUnexpiredServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let cert = decode_x509(&end_entity.0)?;
        let not_after = cert.validity().not_after.timestamp();
        let now_unix = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if not_after < now_unix {
            return Err(TlsError::General("peer certificate has expired".into()));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &Certificate,
        dss: &rustls::internal::msgs::handshake::DigitallySignedStruct,
    ) -> Result<rustls::client::HandshakeSignatureValid, TlsError> {
        rustls::client::verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &Certificate,
        dss: &rustls::internal::msgs::handshake::DigitallySignedStruct,
    ) -> Result<rustls::client::HandshakeSignatureValid, TlsError> {
        rustls::client::verify_tls13_signature(message, cert, dss)
    }
}

/// Assembles the mutual-TLS 1.2+ server and client configs from the local
/// identity's certificate/key (§4.7). Both sides present the same
/// certificate and key; only the verifiers differ.
pub fn build_tls_configs(identity_cert: &IdentityCertificate) -> Result<(ServerConfig, ClientConfig), Kind> {
    let certs = vec![Certificate(identity_cert.cert_der.clone())];
    let key = PrivateKey(identity_cert.key_der.clone());

    let server_config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(AcceptAnyDecodableClientCert))
        .with_single_cert(certs.clone(), key.clone())
        .map_err(|e| Kind::TlsHandshakeFailure(format!("server config: {}", e)))?;

    let client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptUnexpiredServerCert))
        .with_client_auth_cert(certs, key)
        .map_err(|e| Kind::TlsHandshakeFailure(format!("client config: {}", e)))?;

    Ok((server_config, client_config))
}

/// Computes the SHA-256 thumbprint of a peer certificate seen mid-handshake,
/// used to correlate `/Ask` and `/Upload` by connection identity (§4.8).
pub fn thumbprint_of_der(cert_der: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(cert_der))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_garbage_der() {
        let garbage = vec![0u8, 1, 2, 3];
        assert!(decode_x509(&garbage).is_err());
    }

    #[test]
    fn decode_accepts_a_freshly_generated_certificate() {
        let cert = crate::core::identity::build_local_identity(
            &crate::core::config::IdentityConfig {
                display_name: Some("tester".into()),
                email: String::new(),
                phone: String::new(),
                visibility: crate::core::config::Visibility::Everyone,
            },
            std::env::temp_dir().join(format!("opendrop-security-test-{}", uuid::Uuid::new_v4())),
            std::env::temp_dir(),
            "tester-node",
            365,
            30,
        )
        .unwrap()
        .certificate;

        assert!(decode_x509(&cert.cert_der).is_ok());
    }
}
