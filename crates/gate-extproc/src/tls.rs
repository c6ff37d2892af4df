//! TLS bootstrap for the ext-proc listener
//!
//! Operators supply a directory with `tls.crt` and `tls.key`; without one,
//! a self-signed certificate is synthesized. The self-signed path is for
//! development only.

use gate_core::{Error, Result};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::path::Path;
use tonic::transport::Identity;
use tracing::{info, warn};

const CERT_FILE: &str = "tls.crt";
const KEY_FILE: &str = "tls.key";

/// The server identity: loaded from the certificate directory when given,
/// otherwise synthesized.
pub fn server_identity(cert_path: Option<&Path>) -> Result<Identity> {
    match cert_path {
        Some(dir) => load_identity(dir),
        None => {
            warn!("No certificate directory given; synthesizing a self-signed certificate");
            synthesize_self_signed()
        }
    }
}

fn load_identity(dir: &Path) -> Result<Identity> {
    let cert_file = dir.join(CERT_FILE);
    let key_file = dir.join(KEY_FILE);

    let cert = std::fs::read(&cert_file).map_err(|e| {
        Error::certificate(format!("failed to read {}: {e}", cert_file.display()))
    })?;
    let key = std::fs::read(&key_file)
        .map_err(|e| Error::certificate(format!("failed to read {}: {e}", key_file.display())))?;

    info!(cert = %cert_file.display(), "Loaded certificate key pair");
    Ok(Identity::from_pem(cert, key))
}

/// Self-signed RSA-4096 certificate, valid ten years, server-auth EKU.
fn synthesize_self_signed() -> Result<Identity> {
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 4096)
        .map_err(|e| Error::certificate(format!("failed to generate RSA key: {e}")))?;
    let key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::certificate(format!("failed to encode private key: {e}")))?;

    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| Error::certificate(format!("failed to load generated key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Inference Ext");
    params.distinguished_name = dn;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365 * 10);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::certificate(format!("failed to self-sign certificate: {e}")))?;

    Ok(Identity::from_pem(cert.pem(), key_pem.as_str()))
}
