//! RSA key utilities for `ActivityPub` signatures.
//!
//! Every local actor that signs deliveries (users and the instance system
//! actor) owns one of these keypairs.

use std::fs;
use std::path::Path;

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use tracing::info;

use crate::{AppError, AppResult};

/// RSA key pair in PEM form.
#[derive(Debug, Clone)]
pub struct RsaKeypair {
    /// Public key in PEM format (SPKI encoding).
    pub public_key_pem: String,
    /// Private key in PEM format (PKCS#8 encoding).
    pub private_key_pem: String,
}

/// Default RSA key size (2048 bits).
const RSA_KEY_SIZE: usize = 2048;

/// Generate a new 2048-bit RSA key pair.
///
/// ```no_run
/// use apkernel_common::crypto::generate_rsa_keypair;
///
/// let keypair = generate_rsa_keypair().expect("keygen");
/// assert!(keypair.public_key_pem.starts_with("-----BEGIN PUBLIC KEY-----"));
/// ```
pub fn generate_rsa_keypair() -> AppResult<RsaKeypair> {
    let mut rng = rand::thread_rng();

    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_SIZE)
        .map_err(|e| AppError::Internal(format!("Failed to generate RSA key: {e}")))?;

    encode_keypair(&private_key)
}

/// Read the private key stored at `path`, or generate one and store it there.
///
/// Remote servers cache the published `#main-key`; the key must stay the
/// same across restarts.
pub fn load_or_generate_rsa_keypair(path: &Path) -> AppResult<RsaKeypair> {
    if path.exists() {
        let pem = fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read key {}: {e}", path.display()))
        })?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| {
            AppError::Config(format!("Invalid private key in {}: {e}", path.display()))
        })?;
        return encode_keypair(&private_key);
    }

    let keypair = generate_rsa_keypair()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            AppError::Config(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }
    fs::write(path, &keypair.private_key_pem).map_err(|e| {
        AppError::Config(format!("Failed to write key {}: {e}", path.display()))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
            AppError::Config(format!("Failed to restrict {}: {e}", path.display()))
        })?;
    }
    info!(path = %path.display(), "Generated new instance key");
    Ok(keypair)
}

fn encode_keypair(private_key: &RsaPrivateKey) -> AppResult<RsaKeypair> {
    let public_key = RsaPublicKey::from(private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("Failed to encode private key: {e}")))?
        .to_string();

    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("Failed to encode public key: {e}")))?;

    Ok(RsaKeypair {
        public_key_pem,
        private_key_pem,
    })
}
