//! # TLS Identity Binding
//!
//! Every meshchat connection runs over QUIC with mutual TLS 1.3. There is no
//! CA: each node signs its own certificate with its Ed25519 key, and the
//! verifiers below accept a certificate only when its public key is the
//! identity the caller expects.
//!
//! - **Server side**: client certificates are mandatory. Any valid Ed25519
//!   key is accepted; the resulting [`Identity`] is read back from the
//!   connection with [`extract_verified_identity`].
//! - **Client side**: the dialer encodes the expected identity into the SNI
//!   (see [`identity_to_sni`]) and the handshake fails unless the server's
//!   certificate carries exactly that key.
//!
//! The `dangerous()` rustls APIs are required for this model; chain
//! validation is replaced by key pinning.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Identity, Keypair};

static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN identifier shared by every meshchat endpoint.
pub const ALPN: &[u8] = b"meshchat/1";

/// Name placed in the certificate SAN. Never used for verification.
const CERT_SUBJECT_NAME: &str = "meshchat";

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const MAX_CONCURRENT_STREAMS: u32 = 64;

/// Builds a self-signed certificate whose subject public key is the node's
/// Ed25519 key, together with the matching PKCS#8 private key.
pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    // RFC 8410 PKCS#8 wrapping of a raw Ed25519 seed.
    const PKCS8_HEADER: [u8; 16] = [
        0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
        0x20,
    ];

    let mut pkcs8 = Vec::with_capacity(PKCS8_HEADER.len() + 32);
    pkcs8.extend_from_slice(&PKCS8_HEADER);
    pkcs8.extend_from_slice(&keypair.secret_key_bytes());

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to load Ed25519 key into certificate builder")?;

    let mut params = rcgen::CertificateParams::new(vec![CERT_SUBJECT_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.identity().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign node certificate")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of QUIC range")?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    Ok(transport)
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(PinnedClientVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));
    server_config.migration(true);

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    key_bytes.as_ref().try_into().ok()
}

/// Identity of the remote side of an established connection, taken from the
/// certificate the TLS handshake already verified.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    let public_key = extract_public_key_from_cert(certs.first()?.as_ref())?;
    Some(Identity::from_bytes(public_key))
}

/// DNS labels are capped at 63 bytes, so the 64 hex chars are split in two.
pub(crate) fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_identity_from_sni(sni: &str) -> Option<Identity> {
    let hex_str: String = sni.split('.').collect();
    Identity::from_hex(&hex_str).ok()
}

fn bad_cert(err: rustls::CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(err)
}

#[derive(Debug)]
struct PinnedClientVerifier;

impl rustls::server::danger::ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_cert(rustls::CertificateError::BadEncoding))?;

        if !Identity::from_bytes(public_key).is_valid() {
            return Err(bad_cert(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct PinnedServerVerifier;

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(bad_cert(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        };

        let expected = parse_identity_from_sni(name.as_ref())
            .ok_or(bad_cert(rustls::CertificateError::BadEncoding))?;
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_cert(rustls::CertificateError::BadEncoding))?;

        if Identity::from_bytes(public_key) != expected {
            return Err(bad_cert(rustls::CertificateError::NotValidForName));
        }

        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn certificate_carries_node_identity() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_ed25519_cert(&keypair).expect("cert generation");
            let extracted = extract_public_key_from_cert(certs[0].as_ref()).expect("extract");
            assert_eq!(extracted, *keypair.identity().as_bytes());
        }
    }

    #[test]
    fn sni_roundtrip_preserves_identity() {
        let identity = Keypair::generate().identity();
        let sni = identity_to_sni(&identity);
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(parse_identity_from_sni(&sni), Some(identity));
    }

    #[test]
    fn sni_rejects_garbage() {
        assert!(parse_identity_from_sni("not-hex.at-all").is_none());
        assert!(parse_identity_from_sni("abcd.ef").is_none());
    }

    #[test]
    fn garbage_der_has_no_public_key() {
        assert!(extract_public_key_from_cert(&[0x30, 0x03, 0x01, 0x01, 0x00]).is_none());
    }

    #[test]
    fn configs_build_from_generated_cert() {
        let keypair = Keypair::generate();
        let (certs, key) = generate_ed25519_cert(&keypair).expect("cert generation");
        create_server_config(certs.clone(), key.clone_key()).expect("server config");
        create_client_config(certs, key).expect("client config");
    }
}
