//! Shared fixtures: a k256-backed ledger, an in-memory wallet, and a context
//! builder wired to mock servers.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use agora_protocol::ledger::{
    AnchorDraft, AnchorFunding, LedgerCrypto, LedgerError, SignedAnchor,
};

use agora_node::config::{Config, Network};
use agora_node::wallet::{
    AcceptPaymentArgs, BuiltPayment, CreatePaymentArgs, PaymentVerification, WalletError,
    WalletHandle, WalletProvider,
};
use agora_node::AgentContext;

// ============================================================================
// Mock BEEF format
//
// Tests exchange "BEEF" blobs that are JSON of this struct; enough structure
// for the dev ledger to answer raw-tx/txid/script queries consistently.
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct MockBeef {
    pub raw_hex: String,
    pub txid: String,
    pub outputs: Vec<String>,
}

impl MockBeef {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        serde_json::from_slice(bytes).map_err(|e| LedgerError::Beef(e.to_string()))
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ============================================================================
// Dev ledger: real secp256k1 ECDSA, base58check addresses, mock transactions
// ============================================================================

pub struct DevLedger {
    key: SigningKey,
}

impl DevLedger {
    pub fn from_seed(seed: u8) -> Self {
        Self { key: SigningKey::from_bytes((&[seed; 32]).into()).unwrap() }
    }

    pub fn identity_key(&self) -> String {
        hex::encode(self.key.verifying_key().to_encoded_point(true).as_bytes())
    }
}

#[async_trait]
impl LedgerCrypto for DevLedger {
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

    async fn address_for_key(&self, pubkey_hex: &str) -> Result<String, LedgerError> {
        let key_bytes =
            hex::decode(pubkey_hex).map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
        let sha = Sha256::digest(&key_bytes);
        let hash160 = ripemd::Ripemd160::digest(sha);
        let mut payload = vec![0x00];
        payload.extend_from_slice(&hash160);
        let checksum = Sha256::digest(Sha256::digest(&payload));
        payload.extend_from_slice(&checksum[..4]);
        Ok(bs58::encode(payload).into_string())
    }

    async fn assemble_anchor(&self, draft: &AnchorDraft) -> Result<SignedAnchor, LedgerError> {
        let (source_txid, source_tx_hex) = match &draft.funding {
            AnchorFunding::StoredChange { tx_hex, .. } => {
                (sha256_hex(tx_hex.as_bytes()), tx_hex.clone())
            }
            AnchorFunding::ExplorerBeef { beef, txid, .. } => {
                let parsed = MockBeef::from_bytes(beef)?;
                (txid.clone(), parsed.raw_hex)
            }
        };

        let mut seed = draft.op_return_script.clone();
        seed.extend_from_slice(source_txid.as_bytes());
        if let Some(change) = &draft.change {
            seed.extend_from_slice(&change.satoshis.to_le_bytes());
        }
        let txid = sha256_hex(&seed);
        let raw_hex = format!("{txid}{}", hex::encode(&draft.op_return_script));

        let mut outputs = vec![hex::encode(&draft.op_return_script)];
        if draft.change.is_some() {
            outputs.push("76a914deadbeef88ac".to_owned());
        }
        let beef = MockBeef { raw_hex: raw_hex.clone(), txid: txid.clone(), outputs }.to_bytes();

        Ok(SignedAnchor { txid, raw_hex, beef, source_txid, source_tx_hex })
    }

    async fn raw_tx_from_beef(&self, beef: &[u8]) -> Result<String, LedgerError> {
        Ok(MockBeef::from_bytes(beef)?.raw_hex)
    }

    async fn txid_from_beef(&self, beef: &[u8]) -> Result<String, LedgerError> {
        Ok(MockBeef::from_bytes(beef)?.txid)
    }

    async fn output_script_from_beef(
        &self,
        beef: &[u8],
        vout: u32,
    ) -> Result<Vec<u8>, LedgerError> {
        let parsed = MockBeef::from_bytes(beef)?;
        let script = parsed
            .outputs
            .get(vout as usize)
            .ok_or_else(|| LedgerError::Beef(format!("no output {vout}")))?;
        hex::decode(script).map_err(|e| LedgerError::Beef(e.to_string()))
    }
}

// ============================================================================
// In-memory wallet
// ============================================================================

pub struct MemoryWallet {
    pub identity_key: String,
    pub verify_valid: bool,
    pub accept: bool,
    pub balance: u64,
    pub accepts: AtomicU32,
    pub payments_built: AtomicU32,
}

impl MemoryWallet {
    pub fn accepting(identity_key: String) -> Arc<Self> {
        Arc::new(Self {
            identity_key,
            verify_valid: true,
            accept: true,
            balance: 100_000,
            accepts: AtomicU32::new(0),
            payments_built: AtomicU32::new(0),
        })
    }
}

pub struct MemoryWalletHandle(Arc<MemoryWallet>);

/// Newtype wrapper so `WalletProvider` can be implemented for a shared
/// `MemoryWallet` without tripping the orphan rule on `Arc<_>`.
pub struct SharedWallet(pub Arc<MemoryWallet>);

#[async_trait]
impl WalletProvider for SharedWallet {
    async fn load(&self) -> Result<Box<dyn WalletHandle>, WalletError> {
        Ok(Box::new(MemoryWalletHandle(self.0.clone())))
    }
}

#[async_trait]
impl WalletHandle for MemoryWalletHandle {
    async fn identity_key(&self) -> Result<String, WalletError> {
        Ok(self.0.identity_key.clone())
    }

    async fn balance(&self) -> Result<u64, WalletError> {
        Ok(self.0.balance)
    }

    async fn verify_payment(&self, _beef: &str) -> Result<PaymentVerification, WalletError> {
        Ok(PaymentVerification {
            valid: self.0.verify_valid,
            errors: if self.0.verify_valid { vec![] } else { vec!["invalid proof".into()] },
        })
    }

    async fn accept_payment(&self, _args: AcceptPaymentArgs) -> Result<bool, WalletError> {
        self.0.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.accept)
    }

    async fn create_payment(&self, args: CreatePaymentArgs) -> Result<BuiltPayment, WalletError> {
        self.0.payments_built.fetch_add(1, Ordering::SeqCst);
        let txid = sha256_hex(format!("{}:{}:{}", args.to, args.satoshis, args.description).as_bytes());
        let beef = MockBeef {
            raw_hex: format!("{txid}00"),
            txid: txid.clone(),
            outputs: vec![],
        };
        Ok(BuiltPayment {
            beef: BASE64.encode(beef.to_bytes()),
            txid,
            satoshis: args.satoshis,
            derivation_prefix: Some("prefix".into()),
            derivation_suffix: Some("suffix".into()),
            sender_identity_key: Some(self.0.identity_key.clone()),
        })
    }

    async fn destroy(self: Box<Self>) -> Result<(), WalletError> {
        Ok(())
    }
}

// ============================================================================
// Context builder
// ============================================================================

pub struct TestNode {
    pub ctx: AgentContext,
    pub ledger: Arc<DevLedger>,
    pub wallet: Arc<MemoryWallet>,
    pub identity_key: String,
    _state_guard: tempfile::TempDir,
}

pub fn test_config(overlay_url: &str, explorer_url: &str, state_dir: PathBuf) -> Config {
    Config {
        overlay_url: overlay_url.to_owned(),
        network: Network::Mainnet,
        state_dir: Some(state_dir),
        explorer_url: Some(explorer_url.to_owned()),
        explorer_api_key: None,
        wallet_url: "http://127.0.0.1:1".to_owned(),
        agent_name: "test-agent".to_owned(),
        agent_description: "test agent".to_owned(),
        delivery_gateway_url: None,
        delivery_gateway_token: None,
    }
}

/// Node "B": the receiving agent with its own ledger key and wallet.
pub fn test_node(overlay_url: &str, explorer_url: &str) -> TestNode {
    let guard = tempfile::tempdir().unwrap();
    let config = test_config(overlay_url, explorer_url, guard.path().join("state"));
    build_node(config, guard)
}

pub fn build_node(config: Config, guard: tempfile::TempDir) -> TestNode {
    let ledger = Arc::new(DevLedger::from_seed(0x0b));
    let identity_key = ledger.identity_key();
    let wallet = MemoryWallet::accepting(identity_key.clone());
    let ctx = AgentContext::new(config, ledger.clone(), Arc::new(SharedWallet(wallet.clone())));
    TestNode { ctx, ledger, wallet, identity_key, _state_guard: guard }
}

/// Build a signed relay message from a sender with their own key.
pub async fn signed_message(
    sender: &DevLedger,
    id: &str,
    to: &str,
    kind: &str,
    payload: serde_json::Value,
) -> agora_protocol::message::RelayMessage {
    use agora_protocol::codec;
    use agora_protocol::message::MsgKind;

    let kind = MsgKind::from(kind);
    let signature = codec::sign(sender, to, &kind, &payload).await.unwrap();
    agora_protocol::message::RelayMessage {
        id: id.to_owned(),
        from: sender.identity_key(),
        to: to.to_owned(),
        kind,
        payload,
        signature: Some(signature),
    }
}
