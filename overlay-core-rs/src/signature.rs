//! Signature policy for envelopes crossing a hop boundary
//!
//! Signatures are computed over canonical bytes that cover the action,
//! request id and payload of a request (request id, result and payload of a
//! response). The routing header is not signed, so relaying hops can append
//! themselves to the network path without breaking upstream signatures.
//!
//! Every hop may append its own signature; verification checks each attached
//! signature against the key it claims.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::envelope::{Request, Response};

/// The only signature algorithm this policy produces and accepts
pub const ED25519: &str = "ed25519";

/// Signing method label carried on each signature
pub const SIGNING_METHOD: &str = "json-canonical";

/// A single signature attached to an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub key_id: String,
    pub algorithm: String,
    #[serde(default)]
    pub signing_method: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Hex encoded signature bytes
    pub value: String,
}

/// Signing or verification failure
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("no signing key configured")]
    NoSigningKey,

    #[error("message carries no valid signature")]
    Missing,

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature by unknown key {0}")]
    UnknownKey(String),

    #[error("required signature by key {0} is missing")]
    MissingRequiredKey(String),

    #[error("malformed signature value for key {0}")]
    MalformedValue(String),

    #[error("signature by key {0} does not verify")]
    Invalid(String),

    #[error("invalid key material for {key_id}: {reason}")]
    InvalidKey { key_id: String, reason: String },

    #[error("cannot canonicalize message: {0}")]
    Canonical(#[from] serde_json::Error),
}

/// A named Ed25519 signing key
#[derive(Clone)]
pub struct SigningIdentity {
    pub key_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    key: SigningKey,
}

impl SigningIdentity {
    /// Generate a fresh random key
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::from_key(key_id, SigningKey::generate(&mut OsRng))
    }

    /// Load from a 32-byte seed given as hex
    pub fn from_seed_hex(key_id: impl Into<String>, seed_hex: &str) -> Result<Self, SignatureError> {
        let key_id = key_id.into();
        let seed: [u8; 32] = decode_fixed(&key_id, seed_hex)?;
        Ok(Self::from_key(key_id, SigningKey::from_bytes(&seed)))
    }

    fn from_key(key_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            key_id: key_id.into(),
            name: None,
            description: None,
            key,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Secret seed as hex, the form [`from_seed_hex`](Self::from_seed_hex) loads
    pub fn seed_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    fn sign(&self, bytes: &[u8]) -> Signature {
        Signature {
            key_id: self.key_id.clone(),
            algorithm: ED25519.to_string(),
            signing_method: Some(SIGNING_METHOD.to_string()),
            timestamp: Utc::now(),
            name: self.name.clone(),
            description: self.description.clone(),
            value: hex::encode(self.key.sign(bytes).to_bytes()),
        }
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("key_id", &self.key_id)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Parse a public key given as hex
pub fn verifying_key_from_hex(key_id: &str, public_hex: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes: [u8; 32] = decode_fixed(key_id, public_hex)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| SignatureError::InvalidKey {
        key_id: key_id.to_string(),
        reason: e.to_string(),
    })
}

fn decode_fixed<const N: usize>(key_id: &str, text: &str) -> Result<[u8; N], SignatureError> {
    let invalid = |reason: String| SignatureError::InvalidKey {
        key_id: key_id.to_string(),
        reason,
    };
    let bytes = hex::decode(text.trim()).map_err(|e| invalid(e.to_string()))?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| invalid(format!("expected {} bytes, got {}", N, bytes.len())))
}

/// Canonical bytes signed for a request
pub fn canonical_request(request: &Request) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&serde_json::json!({
        "action": request.action,
        "requestId": request.request_id,
        "payload": request.payload,
    }))
}

/// Canonical bytes signed for a response
pub fn canonical_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&serde_json::json!({
        "requestId": response.request_id,
        "result": response.result,
        "payload": response.payload,
    }))
}

/// Per-node signing and verification rules
#[derive(Debug, Clone, Default)]
pub struct SignaturePolicy {
    signers: Vec<SigningIdentity>,
    trusted: HashMap<String, VerifyingKey>,
    required_keys: Vec<String>,
    require_outbound: bool,
    require_signatures: bool,
    reject_unknown_keys: bool,
}

impl SignaturePolicy {
    /// A policy that neither signs nor requires signatures
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign outbound envelopes with this key, and trust it inbound
    pub fn with_signer(mut self, identity: SigningIdentity) -> Self {
        self.trusted
            .insert(identity.key_id.clone(), identity.verifying_key());
        self.signers.push(identity);
        self
    }

    /// Trust signatures claiming `key_id`
    pub fn with_trusted_key(mut self, key_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.trusted.insert(key_id.into(), key);
        self
    }

    /// Inbound envelopes must carry a valid signature by `key_id`
    pub fn with_required_key(mut self, key_id: impl Into<String>) -> Self {
        self.required_keys.push(key_id.into());
        self
    }

    /// Fail outbound signing when no key is configured
    pub fn require_outbound(mut self, required: bool) -> Self {
        self.require_outbound = required;
        self
    }

    /// Inbound envelopes must carry at least one valid signature
    pub fn require_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    /// Treat signatures by keys we do not know as failures
    pub fn reject_unknown_keys(mut self, reject: bool) -> Self {
        self.reject_unknown_keys = reject;
        self
    }

    pub fn signer_ids(&self) -> impl Iterator<Item = &str> {
        self.signers.iter().map(|s| s.key_id.as_str())
    }

    /// Append this node's signatures to an outbound request
    pub fn sign_request(&self, request: &mut Request) -> Result<(), SignatureError> {
        if !self.can_sign()? {
            return Ok(());
        }
        let bytes = canonical_request(request)?;
        self.append_signatures(&bytes, &mut request.signatures);
        Ok(())
    }

    /// Append this node's signatures to an outbound response
    pub fn sign_response(&self, response: &mut Response) -> Result<(), SignatureError> {
        if !self.can_sign()? {
            return Ok(());
        }
        let bytes = canonical_response(response)?;
        self.append_signatures(&bytes, &mut response.signatures);
        Ok(())
    }

    /// Check the signatures of an inbound request
    pub fn verify_request(&self, request: &Request) -> Result<(), SignatureError> {
        let bytes = canonical_request(request)?;
        self.verify(&bytes, &request.signatures)
    }

    /// Check the signatures of an inbound response
    pub fn verify_response(&self, response: &Response) -> Result<(), SignatureError> {
        let bytes = canonical_response(response)?;
        self.verify(&bytes, &response.signatures)
    }

    fn can_sign(&self) -> Result<bool, SignatureError> {
        if self.signers.is_empty() {
            if self.require_outbound {
                return Err(SignatureError::NoSigningKey);
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn append_signatures(&self, bytes: &[u8], signatures: &mut Vec<Signature>) {
        for signer in &self.signers {
            // A retry through the same hop must not stack duplicate signatures
            if signatures.iter().any(|s| s.key_id == signer.key_id) {
                continue;
            }
            signatures.push(signer.sign(bytes));
        }
    }

    fn verify(&self, bytes: &[u8], signatures: &[Signature]) -> Result<(), SignatureError> {
        let mut verified: Vec<&str> = Vec::with_capacity(signatures.len());

        for signature in signatures {
            if signature.algorithm != ED25519 {
                return Err(SignatureError::UnsupportedAlgorithm(
                    signature.algorithm.clone(),
                ));
            }

            let Some(key) = self.trusted.get(&signature.key_id) else {
                if self.reject_unknown_keys {
                    return Err(SignatureError::UnknownKey(signature.key_id.clone()));
                }
                debug!("Ignoring signature by unknown key {}", signature.key_id);
                continue;
            };

            let raw = hex::decode(&signature.value)
                .map_err(|_| SignatureError::MalformedValue(signature.key_id.clone()))?;
            let raw: [u8; 64] = raw
                .as_slice()
                .try_into()
                .map_err(|_| SignatureError::MalformedValue(signature.key_id.clone()))?;

            key.verify(bytes, &ed25519_dalek::Signature::from_bytes(&raw))
                .map_err(|_| SignatureError::Invalid(signature.key_id.clone()))?;

            verified.push(&signature.key_id);
        }

        if let Some(missing) = self
            .required_keys
            .iter()
            .find(|k| !verified.contains(&k.as_str()))
        {
            return Err(SignatureError::MissingRequiredKey(missing.clone()));
        }

        if self.require_signatures && verified.is_empty() {
            return Err(SignatureError::Missing);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ResultCode;
    use crate::types::NodeId;
    use serde_json::json;

    fn request() -> Request {
        Request::new(
            "SetChargingProfile",
            NodeId::parse("CS1").unwrap(),
            json!({"evseId": 1, "limit": 11000.0}),
        )
    }

    #[test]
    fn test_sign_and_verify_request() {
        let k1 = SigningIdentity::generate("K1");
        let sender = SignaturePolicy::new().with_signer(k1.clone());
        let receiver = SignaturePolicy::new()
            .with_trusted_key("K1", k1.verifying_key())
            .with_required_key("K1");

        let mut req = request();
        sender.sign_request(&mut req).unwrap();

        assert_eq!(req.signatures.len(), 1);
        assert_eq!(req.signatures[0].algorithm, ED25519);
        assert!(receiver.verify_request(&req).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let k1 = SigningIdentity::generate("K1");
        let policy = SignaturePolicy::new().with_signer(k1);

        let mut req = request();
        policy.sign_request(&mut req).unwrap();
        req.payload = json!({"evseId": 1, "limit": 99000.0});

        assert!(matches!(
            policy.verify_request(&req),
            Err(SignatureError::Invalid(k)) if k == "K1"
        ));
    }

    #[test]
    fn test_path_changes_do_not_break_signature() {
        let k1 = SigningIdentity::generate("K1");
        let policy = SignaturePolicy::new().with_signer(k1);

        let mut req = request();
        policy.sign_request(&mut req).unwrap();
        req.network_path = req.network_path.append(NodeId::parse("GW").unwrap());

        assert!(policy.verify_request(&req).is_ok());
    }

    #[test]
    fn test_required_key_missing() {
        let k1 = SigningIdentity::generate("K1");
        let k2 = SigningIdentity::generate("K2");
        let sender = SignaturePolicy::new().with_signer(k1.clone());
        let receiver = SignaturePolicy::new()
            .with_trusted_key("K1", k1.verifying_key())
            .with_trusted_key("K2", k2.verifying_key())
            .with_required_key("K2");

        let mut req = request();
        sender.sign_request(&mut req).unwrap();

        assert!(matches!(
            receiver.verify_request(&req),
            Err(SignatureError::MissingRequiredKey(k)) if k == "K2"
        ));
    }

    #[test]
    fn test_unknown_keys() {
        let k1 = SigningIdentity::generate("K1");
        let sender = SignaturePolicy::new().with_signer(k1);

        let mut req = request();
        sender.sign_request(&mut req).unwrap();

        assert!(SignaturePolicy::new().verify_request(&req).is_ok());
        assert!(matches!(
            SignaturePolicy::new()
                .reject_unknown_keys(true)
                .verify_request(&req),
            Err(SignatureError::UnknownKey(_))
        ));
        assert!(matches!(
            SignaturePolicy::new()
                .require_signatures(true)
                .verify_request(&req),
            Err(SignatureError::Missing)
        ));
    }

    #[test]
    fn test_outbound_requirement() {
        let mut req = request();
        assert!(SignaturePolicy::new().sign_request(&mut req).is_ok());
        assert!(req.signatures.is_empty());

        assert!(matches!(
            SignaturePolicy::new()
                .require_outbound(true)
                .sign_request(&mut req),
            Err(SignatureError::NoSigningKey)
        ));
    }

    #[test]
    fn test_co_signing_is_not_duplicated() {
        let a = SignaturePolicy::new().with_signer(SigningIdentity::generate("A"));
        let b = SignaturePolicy::new().with_signer(SigningIdentity::generate("B"));

        let mut req = request();
        a.sign_request(&mut req).unwrap();
        b.sign_request(&mut req).unwrap();
        b.sign_request(&mut req).unwrap();

        let ids: Vec<_> = req.signatures.iter().map(|s| s.key_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[test]
    fn test_unsupported_algorithm() {
        let policy = SignaturePolicy::new().with_signer(SigningIdentity::generate("K1"));
        let mut req = request();
        policy.sign_request(&mut req).unwrap();
        req.signatures[0].algorithm = "secp256r1".to_string();

        assert!(matches!(
            policy.verify_request(&req),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_sign_and_verify_response() {
        let policy = SignaturePolicy::new().with_signer(SigningIdentity::generate("CSMS"));
        let mut resp = Response::ok("r-9".into(), json!({"status": "Accepted"}));
        policy.sign_response(&mut resp).unwrap();
        assert!(policy.verify_response(&resp).is_ok());

        resp.result = ResultCode::Server;
        assert!(policy.verify_response(&resp).is_err());
    }

    #[test]
    fn test_keys_from_hex() {
        let seed = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
        let identity = SigningIdentity::from_seed_hex("K1", seed).unwrap();
        let public = verifying_key_from_hex("K1", &identity.public_key_hex()).unwrap();
        assert_eq!(public, identity.verifying_key());
        assert_eq!(identity.seed_hex(), seed);

        assert!(SigningIdentity::from_seed_hex("K1", "abcd").is_err());
        assert!(verifying_key_from_hex("K1", "zz").is_err());
    }
}
