//! Signing preimage construction and signature verification for relay
//! messages.
//!
//! The preimage is `to ++ type ++ json(payload)` and the signature is ECDSA
//! over its digest (computed by the ledger collaborator). Both sides must
//! produce byte-identical JSON: serialization is compact and preserves the
//! payload's key order, with no canonicalization beyond that.

use serde_json::Value;

use crate::ledger::LedgerCrypto;
use crate::message::MsgKind;

/// Result of a signature check. Fails closed: any malformed input yields
/// `valid == false` with the underlying error as the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigCheck {
    pub valid: bool,
    pub reason: Option<String>,
}

impl SigCheck {
    fn invalid(reason: impl Into<String>) -> Self {
        Self { valid: false, reason: Some(reason.into()) }
    }
}

/// Canonical JSON for signing: compact, insertion-ordered keys.
pub fn canonical_json(payload: &Value) -> String {
    // Serializing a Value cannot fail; a null payload serializes as "null",
    // matching the sender side.
    serde_json::to_string(payload).unwrap_or_else(|_| "null".to_owned())
}

/// Byte string covered by the signature.
pub fn signing_preimage(to: &str, kind: &MsgKind, payload: &Value) -> Vec<u8> {
    let json = canonical_json(payload);
    let mut buf = Vec::with_capacity(to.len() + kind.as_str().len() + json.len());
    buf.extend_from_slice(to.as_bytes());
    buf.extend_from_slice(kind.as_str().as_bytes());
    buf.extend_from_slice(json.as_bytes());
    buf
}

/// Sign a relay message. Returns the DER signature in hex.
pub async fn sign(
    ledger: &dyn LedgerCrypto,
    to: &str,
    kind: &MsgKind,
    payload: &Value,
) -> Result<String, crate::ledger::LedgerError> {
    let preimage = signing_preimage(to, kind, payload);
    let der = ledger.sign_message(&preimage).await?;
    Ok(hex::encode(der))
}

/// Verify a relay message signature against the sender's identity key.
///
/// No side effects; never errors; malformed signatures, keys, or ledger
/// failures all collapse to `valid: false` with a reason.
pub async fn verify(
    ledger: &dyn LedgerCrypto,
    from_key: &str,
    to: &str,
    kind: &MsgKind,
    payload: &Value,
    signature_hex: Option<&str>,
) -> SigCheck {
    let signature_hex = match signature_hex {
        Some(s) if !s.is_empty() => s,
        _ => return SigCheck::invalid("no signature"),
    };

    let der = match hex::decode(signature_hex) {
        Ok(der) => der,
        Err(e) => return SigCheck::invalid(format!("invalid signature hex: {e}")),
    };

    let preimage = signing_preimage(to, kind, payload);
    match ledger.verify_message(from_key, &preimage, &der).await {
        Ok(valid) => SigCheck { valid, reason: None },
        Err(e) => SigCheck::invalid(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        AnchorDraft, LedgerCrypto, LedgerError, SignedAnchor,
    };
    use async_trait::async_trait;
    use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
    use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
    use serde_json::json;
    use sha2::{Digest, Sha256};

    /// Minimal real-ECDSA ledger for codec tests: secp256k1 over sha256,
    /// DER signatures, compressed-hex keys.
    struct TestLedger {
        key: SigningKey,
    }

    impl TestLedger {
        fn new() -> Self {
            Self { key: SigningKey::from_bytes((&[7u8; 32]).into()).unwrap() }
        }

        fn identity_key(&self) -> String {
            hex::encode(self.key.verifying_key().to_encoded_point(true).as_bytes())
        }
    }

    #[async_trait]
    impl LedgerCrypto for TestLedger {
        async fn sign_message(&self, preimage: &[u8]) -> Result<Vec<u8>, LedgerError> {
            let digest = Sha256::digest(preimage);
            let sig: Signature = self
                .key
                .sign_prehash(&digest)
                .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
            Ok(sig.to_der().as_bytes().to_vec())
        }

        async fn verify_message(
            &self,
            pubkey_hex: &str,
            preimage: &[u8],
            signature_der: &[u8],
        ) -> Result<bool, LedgerError> {
            let key_bytes =
                hex::decode(pubkey_hex).map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
            let vk = VerifyingKey::from_sec1_bytes(&key_bytes)
                .map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
            let sig = Signature::from_der(signature_der)
                .map_err(|e| LedgerError::InvalidSignature(e.to_string()))?;
            let digest = Sha256::digest(preimage);
            Ok(vk.verify_prehash(&digest, &sig).is_ok())
        }

        async fn address_for_key(&self, _pubkey_hex: &str) -> Result<String, LedgerError> {
            unimplemented!("not used by codec tests")
        }

        async fn assemble_anchor(&self, _draft: &AnchorDraft) -> Result<SignedAnchor, LedgerError> {
            unimplemented!("not used by codec tests")
        }

        async fn raw_tx_from_beef(&self, _beef: &[u8]) -> Result<String, LedgerError> {
            unimplemented!("not used by codec tests")
        }

        async fn txid_from_beef(&self, _beef: &[u8]) -> Result<String, LedgerError> {
            unimplemented!("not used by codec tests")
        }

        async fn output_script_from_beef(
            &self,
            _beef: &[u8],
            _vout: u32,
        ) -> Result<Vec<u8>, LedgerError> {
            unimplemented!("not used by codec tests")
        }
    }

    #[tokio::test]
    async fn sign_then_verify_round_trip() {
        let ledger = TestLedger::new();
        let payload = json!({"serviceId": "echo", "input": {"text": "hi"}});
        let kind = MsgKind::ServiceRequest;

        let sig = sign(&ledger, "02abc", &kind, &payload).await.unwrap();
        let check =
            verify(&ledger, &ledger.identity_key(), "02abc", &kind, &payload, Some(&sig)).await;
        assert!(check.valid, "reason: {:?}", check.reason);
    }

    #[tokio::test]
    async fn flipped_signature_bit_fails_verification() {
        let ledger = TestLedger::new();
        let payload = json!({"n": 1});
        let kind = MsgKind::Ping;

        let sig = sign(&ledger, "02abc", &kind, &payload).await.unwrap();
        // Flip one bit in the middle of the DER body.
        let mut bytes = hex::decode(&sig).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let tampered = hex::encode(bytes);

        let check =
            verify(&ledger, &ledger.identity_key(), "02abc", &kind, &payload, Some(&tampered))
                .await;
        assert!(!check.valid);
    }

    #[tokio::test]
    async fn missing_signature_fails_closed() {
        let ledger = TestLedger::new();
        let check =
            verify(&ledger, &ledger.identity_key(), "02abc", &MsgKind::Ping, &json!({}), None)
                .await;
        assert!(!check.valid);
        assert_eq!(check.reason.as_deref(), Some("no signature"));
    }

    #[tokio::test]
    async fn malformed_hex_and_key_fail_with_reason() {
        let ledger = TestLedger::new();
        let check = verify(
            &ledger,
            &ledger.identity_key(),
            "02abc",
            &MsgKind::Ping,
            &json!({}),
            Some("zz-not-hex"),
        )
        .await;
        assert!(!check.valid);
        assert!(check.reason.is_some());

        let sig = sign(&ledger, "02abc", &MsgKind::Ping, &json!({})).await.unwrap();
        let check =
            verify(&ledger, "not-a-key", "02abc", &MsgKind::Ping, &json!({}), Some(&sig)).await;
        assert!(!check.valid);
        assert!(check.reason.is_some());
    }

    #[test]
    fn preimage_preserves_payload_key_order() {
        // Parsing and re-serializing must not reorder keys, otherwise the
        // verifier hashes different bytes than the signer.
        let text = r#"{"zeta":1,"alpha":2,"mid":{"b":1,"a":2}}"#;
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(canonical_json(&payload), text);

        let preimage = signing_preimage("02to", &MsgKind::ServiceRequest, &payload);
        let expected = format!("02to{}{}", "service-request", text);
        assert_eq!(preimage, expected.as_bytes());
    }
}
