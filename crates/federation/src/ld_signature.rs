//! Linked Data signatures (`RsaSignature2017`) on outgoing activities.
//!
//! Documents are canonicalized as JSON with recursively sorted keys rather
//! than by URDNA2015 normalization.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{SecondsFormat, Utc};
use pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use signature::{SignatureEncoding, Signer, Verifier};

use crate::signature::{ActorKey, SignatureError};

/// Signature suite name.
pub const LD_SIGNATURE_TYPE: &str = "RsaSignature2017";

/// Signs and verifies the `signature` block of a JSON-LD document.
pub trait LdSigner: Send + Sync {
    /// Return `document` with a `signature` block attached.
    fn sign(&self, document: Value, key: &ActorKey) -> Result<Value, SignatureError>;

    /// Verify the `signature` block of `document`.
    fn verify(&self, document: &Value, public_key_pem: &str) -> Result<bool, SignatureError>;
}

/// The `creator` key id of an attached LD signature.
#[must_use]
pub fn signature_creator(document: &Value) -> Option<&str> {
    document
        .get("signature")
        .and_then(|s| s.get("creator"))
        .and_then(Value::as_str)
}

/// RSA-SHA256 implementation of [`LdSigner`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaLdSigner;

impl LdSigner for RsaLdSigner {
    fn sign(&self, mut document: Value, key: &ActorKey) -> Result<Value, SignatureError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(&key.private_key_pem)
            .map_err(|e| SignatureError::InvalidPrivateKey(e.to_string()))?;

        let options = json!({
            "creator": key.key_id,
            "created": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        let to_be_signed = signing_input(&options, &document);

        let signing_key = SigningKey::<Sha256>::new(private_key);
        let signature = signing_key
            .try_sign(to_be_signed.as_bytes())
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;

        let mut block = options;
        if let Value::Object(map) = &mut block {
            map.insert("type".to_string(), Value::from(LD_SIGNATURE_TYPE));
            map.insert(
                "signatureValue".to_string(),
                Value::from(BASE64.encode(signature.to_bytes())),
            );
        }

        match &mut document {
            Value::Object(map) => {
                map.insert("signature".to_string(), block);
                Ok(document)
            }
            _ => Err(SignatureError::SigningFailed(
                "document is not an object".to_string(),
            )),
        }
    }

    fn verify(&self, document: &Value, public_key_pem: &str) -> Result<bool, SignatureError> {
        let block = document
            .get("signature")
            .and_then(Value::as_object)
            .ok_or_else(|| SignatureError::MissingHeader("signature".to_string()))?;

        if block.get("type").and_then(Value::as_str) != Some(LD_SIGNATURE_TYPE) {
            return Ok(false);
        }
        let signature_value = block
            .get("signatureValue")
            .and_then(Value::as_str)
            .ok_or(SignatureError::InvalidSignatureHeader)?;

        let options: Map<String, Value> = block
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "type" | "id" | "signatureValue"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut unsigned = document.clone();
        if let Value::Object(map) = &mut unsigned {
            map.remove("signature");
        }
        let to_be_signed = signing_input(&Value::Object(options), &unsigned);

        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
        let signature_bytes = BASE64
            .decode(signature_value)
            .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

        Ok(VerifyingKey::<Sha256>::new(public_key)
            .verify(to_be_signed.as_bytes(), &signature)
            .is_ok())
    }
}

fn signing_input(options: &Value, document: &Value) -> String {
    let mut options = options.clone();
    if let Value::Object(map) = &mut options {
        map.insert(
            "@context".to_string(),
            Value::from("https://w3id.org/identity/v1"),
        );
    }
    format!(
        "{}{}",
        sha256_hex(&canonicalize(&options)),
        sha256_hex(&canonicalize(document))
    )
}

fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Serialize with object keys sorted at every level.
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::from(k.as_str()), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    #[test]
    fn test_canonicalize_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": [true, null], "c": "x"}});
        assert_eq!(canonicalize(&value), r#"{"a":{"c":"x","d":[true,null]},"b":1}"#);
    }

    #[test]
    fn test_sign_and_verify() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let key = ActorKey {
            key_id: "https://local.example/users/1#main-key".to_string(),
            private_key_pem: private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
        };

        let activity = json!({
            "type": "Delete",
            "actor": "https://local.example/users/1",
            "object": "https://local.example/notes/1"
        });
        let signed = RsaLdSigner.sign(activity, &key).unwrap();

        assert_eq!(signature_creator(&signed), Some(key.key_id.as_str()));
        assert!(RsaLdSigner.verify(&signed, &public_pem).unwrap());

        let mut tampered = signed;
        tampered["object"] = json!("https://local.example/notes/2");
        assert!(!RsaLdSigner.verify(&tampered, &public_pem).unwrap());
    }
}
