//! # Transport authentication
//!
//! The satellite's authenticated channel is QUIC with mutual TLS, where
//! both sides present self-signed certificates carrying their Ed25519
//! public key. Completing the handshake is the authentication step: the
//! peer id is extracted from the verified certificate, so there is no
//! separate identity exchange on the wire.
//!
//! Certificate verification is intentionally custom (`dangerous()` APIs):
//! there is no CA. A certificate is accepted iff it carries a usable
//! Ed25519 public key and its handshake signature checks out; the identity
//! the connection is attributed to is exactly that key. This is the
//! trust-on-first-use model the daemon's `--dial host:port` bootstrap
//! needs, where the remote identity is learned rather than pinned.

use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Identity, Keypair};

/// ALPN protocol identifier; prevents accidental cross-protocol connections.
pub const ALPN: &[u8] = b"satellite";

/// SNI placeholder used on outgoing connections. The verifier ignores the
/// server name entirely; identity comes from the certificate key.
pub const DIAL_SERVER_NAME: &str = "satellite";

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Build a self-signed certificate whose subject public key is the node's
/// Ed25519 identity key.
pub fn generate_identity_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();

    // Minimal PKCS#8 v1 wrapping of a raw Ed25519 seed.
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to load Ed25519 key for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![DIAL_SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.identity().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign identity certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(IdentityClientVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .expect("transport config is exclusively owned right after creation");
    transport_config.max_idle_timeout(Some(
        std::time::Duration::from_secs(30)
            .try_into()
            .expect("30 seconds is a valid VarInt duration"),
    ));
    // Overlay links are long-lived and often quiet; keep them from idling
    // out. One side keeping alive refreshes the timer for both.
    transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(10)));

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(IdentityServerVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));

    Ok(client_config)
}

/// Pull the raw Ed25519 subject public key out of a DER certificate.
pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Identity of the authenticated remote end of a connection, if the
/// handshake presented a usable certificate.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<rustls::pki_types::CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    let public_key = extract_public_key_from_cert(cert_der)?;
    let identity = Identity::from_bytes(public_key);
    identity.is_valid().then_some(identity)
}

fn validate_identity_cert(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
        rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
    )?;
    if !Identity::from_bytes(public_key).is_valid() {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::ApplicationVerificationFailure,
        ));
    }
    Ok(())
}

#[derive(Debug)]
struct IdentityClientVerifier;

impl rustls::server::danger::ClientCertVerifier for IdentityClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        validate_identity_cert(end_entity)?;
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
struct IdentityServerVerifier;

impl rustls::client::danger::ServerCertVerifier for IdentityServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        validate_identity_cert(end_entity)?;
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

    #[test]
    fn certificate_carries_identity_public_key() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) =
                generate_identity_cert(&keypair).expect("cert generation must succeed");

            let extracted = extract_public_key_from_cert(certs[0].as_ref())
                .expect("public key extraction must succeed");

            assert_eq!(extracted, keypair.public_key_bytes());
        }
    }

    #[test]
    fn distinct_keypairs_produce_distinct_cert_keys() {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        for _ in 0..50 {
            let keypair = Keypair::generate();
            let (certs, _) = generate_identity_cert(&keypair).unwrap();
            let pk = extract_public_key_from_cert(certs[0].as_ref()).unwrap();
            assert!(seen.insert(pk), "certificate public key collision");
        }
    }

    #[test]
    fn server_and_client_configs_build() {
        let keypair = Keypair::generate();
        let (certs, key) = generate_identity_cert(&keypair).unwrap();
        create_server_config(certs, key).expect("server config must build");

        let (certs, key) = generate_identity_cert(&keypair).unwrap();
        create_client_config(certs, key).expect("client config must build");
    }
}
