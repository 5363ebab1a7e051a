//! HTTP Signatures (draft-cavage) for `ActivityPub` requests.
//!
//! Signing and verification sit behind [`RequestSigner`] and
//! [`SignatureVerifier`]; the RSA-SHA256 implementations here are the ones
//! the server wires in.

use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{SigningKey, VerifyingKey},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signature::{SignatureEncoding, Signer, Verifier};
use tracing::{debug, warn};
use url::Url;

/// HTTP Signature error.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
    #[error("Missing header: {0}")]
    MissingHeader(String),
    #[error("Invalid signature header")]
    InvalidSignatureHeader,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Signature expired: clock skew too large")]
    ExpiredSignature,
    #[error("Invalid date header format")]
    InvalidDateFormat,
    #[error("Digest mismatch")]
    DigestMismatch,
}

/// Key material an actor signs with.
#[derive(Clone)]
pub struct ActorKey {
    /// `<actor id>#main-key`
    pub key_id: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for ActorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Produces signature headers for an outgoing request.
pub trait RequestSigner: Send + Sync {
    /// Headers to add (`Host`, `Date`, optionally `Digest`, and `Signature`).
    fn sign(
        &self,
        key: &ActorKey,
        method: &str,
        url: &Url,
        body: Option<&[u8]>,
    ) -> Result<Vec<(String, String)>, SignatureError>;
}

/// Checks a parsed `Signature` header against a public key.
pub trait SignatureVerifier: Send + Sync {
    /// `headers` must be keyed by lowercase header name.
    fn verify(
        &self,
        public_key_pem: &str,
        components: &SignatureComponents,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
    ) -> Result<bool, SignatureError>;
}

/// RSA-SHA256 signer over `(request-target) host date [digest]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaRequestSigner;

impl RequestSigner for RsaRequestSigner {
    fn sign(
        &self,
        key: &ActorKey,
        method: &str,
        url: &Url,
        body: Option<&[u8]>,
    ) -> Result<Vec<(String, String)>, SignatureError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key_pem)
            .map_err(|e| SignatureError::InvalidPrivateKey(e.to_string()))?;

        let host = url
            .host_str()
            .ok_or_else(|| SignatureError::InvalidUrl("No host in URL".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let digest = body.map(calculate_digest);

        let mut values = vec![
            ("(request-target)", request_target(method, url)),
            ("host", host.clone()),
            ("date", date.clone()),
        ];
        if let Some(digest) = &digest {
            values.push(("digest", digest.clone()));
        }

        let signing_string = values
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join("\n");
        debug!(signing_string = %signing_string, "Signing string");

        let signing_key = SigningKey::<Sha256>::new(private_key);
        let signature_bytes = signing_key
            .try_sign(signing_string.as_bytes())
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;

        let signed_headers = values
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(" ");
        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{signed_headers}\",signature=\"{}\"",
            key.key_id,
            BASE64.encode(signature_bytes.to_bytes())
        );

        let mut headers = vec![
            ("Host".to_string(), host),
            ("Date".to_string(), date),
        ];
        if let Some(digest) = digest {
            headers.push(("Digest".to_string(), digest));
        }
        headers.push(("Signature".to_string(), signature_header));
        Ok(headers)
    }
}

fn request_target(method: &str, url: &Url) -> String {
    let query = url.query().map_or(String::new(), |q| format!("?{q}"));
    format!("{} {}{query}", method.to_lowercase(), url.path())
}

/// RSA-SHA256 verifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaSignatureVerifier;

impl SignatureVerifier for RsaSignatureVerifier {
    fn verify(
        &self,
        public_key_pem: &str,
        components: &SignatureComponents,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
    ) -> Result<bool, SignatureError> {
        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;

        let signing_string = components.signing_string(method, path, headers)?;
        debug!(signing_string = %signing_string, "Verifying signing string");

        let signature_bytes = BASE64
            .decode(&components.signature)
            .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;
        let signature = rsa::pkcs1v15::Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

        let verifying_key = VerifyingKey::<Sha256>::new(public_key);
        match verifying_key.verify(signing_string.as_bytes(), &signature) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, key_id = %components.key_id, "Signature verification failed");
                Ok(false)
            }
        }
    }
}

/// Parsed `Signature` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureComponents {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: String,
}

impl SignatureComponents {
    /// Parse a `Signature` header value.
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut key_id = None;
        let mut algorithm = None;
        let mut headers_list = None;
        let mut signature = None;

        for part in header.split(',') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim_matches('"');
                match key {
                    "keyId" => key_id = Some(value.to_string()),
                    "algorithm" => algorithm = Some(value.to_string()),
                    "headers" => headers_list = Some(value.to_string()),
                    "signature" => signature = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        Ok(Self {
            key_id: key_id.ok_or(SignatureError::InvalidSignatureHeader)?,
            algorithm: algorithm.unwrap_or_else(|| "rsa-sha256".to_string()),
            headers: headers_list
                .unwrap_or_else(|| "date".to_string())
                .split(' ')
                .map(String::from)
                .collect(),
            signature: signature.ok_or(SignatureError::InvalidSignatureHeader)?,
        })
    }

    /// Rebuild the string the sender signed.
    pub fn signing_string(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, SignatureError> {
        let mut parts = Vec::with_capacity(self.headers.len());
        for name in &self.headers {
            let value = match name.as_str() {
                "(request-target)" => format!("{} {path}", method.to_lowercase()),
                h => headers
                    .get(h)
                    .ok_or_else(|| SignatureError::MissingHeader(h.to_string()))?
                    .clone(),
            };
            parts.push(format!("{name}: {value}"));
        }
        Ok(parts.join("\n"))
    }

    /// Host part of the key id.
    #[must_use]
    pub fn key_host(&self) -> Option<String> {
        Url::parse(&self.key_id)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
    }
}

/// Calculate the SHA-256 `Digest` header value of a body.
#[must_use]
pub fn calculate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Verify that a digest header matches the body.
#[must_use]
pub fn verify_digest(body: &[u8], digest_header: &str) -> bool {
    calculate_digest(body) == digest_header
}
