//! Dependency-injection boundary for the ledger SDK collaborator.
//!
//! The protocol layer never touches key material or transaction
//! serialization directly. The host environment resolves one `LedgerCrypto`
//! implementation at startup and passes it to every component that needs it;
//! there is no probing or lazily-initialized global handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("transaction assembly failed: {0}")]
    Assembly(String),

    #[error("invalid BEEF: {0}")]
    Beef(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// One ancestor in a stored-change source chain: the raw transaction plus an
/// optional merkle path proving its inclusion. The chain lets the ledger
/// rebuild a full BEEF for the funding input without an explorer round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLink {
    pub tx_hex: String,
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_path_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u32>,
}

/// Where the single funding input of an anchor transaction comes from.
#[derive(Debug, Clone)]
pub enum AnchorFunding {
    /// Change retained from our previous anchor, with the ancestor chain
    /// needed to prove it.
    StoredChange {
        tx_hex: String,
        vout: u32,
        satoshis: u64,
        source_chain: Vec<ChainLink>,
    },
    /// A confirmed UTXO located through the explorer, proven by the BEEF the
    /// explorer returned.
    ExplorerBeef {
        beef: Vec<u8>,
        txid: String,
        vout: u32,
        satoshis: u64,
    },
}

impl AnchorFunding {
    pub fn satoshis(&self) -> u64 {
        match self {
            Self::StoredChange { satoshis, .. } | Self::ExplorerBeef { satoshis, .. } => *satoshis,
        }
    }
}

/// Fully-specified anchor transaction awaiting signing: one funding input,
/// one OP_RETURN output, optionally one change output.
#[derive(Debug, Clone)]
pub struct AnchorDraft {
    pub funding: AnchorFunding,
    pub op_return_script: Vec<u8>,
    pub anchor_sats: u64,
    pub change: Option<ChangeOutput>,
}

#[derive(Debug, Clone)]
pub struct ChangeOutput {
    pub address: String,
    pub satoshis: u64,
}

/// A signed, serialized anchor transaction ready for overlay submission.
#[derive(Debug, Clone)]
pub struct SignedAnchor {
    pub txid: String,
    pub raw_hex: String,
    /// BEEF bundling the transaction with its ancestors and proofs.
    pub beef: Vec<u8>,
    /// The funding transaction, echoed back so the caller can extend the
    /// stored-change source chain.
    pub source_txid: String,
    pub source_tx_hex: String,
}

/// The ledger SDK surface this system consumes: ECDSA over a message digest,
/// address derivation, and transaction/BEEF serialization.
#[async_trait]
pub trait LedgerCrypto: Send + Sync {
    /// DER-encoded ECDSA signature over the digest of `preimage`.
    async fn sign_message(&self, preimage: &[u8]) -> Result<Vec<u8>, LedgerError>;

    /// Verify a DER signature over the digest of `preimage` against a
    /// compressed public key in hex.
    async fn verify_message(
        &self,
        pubkey_hex: &str,
        preimage: &[u8],
        signature_der: &[u8],
    ) -> Result<bool, LedgerError>;

    /// P2PKH address for a compressed public key, on the configured network.
    async fn address_for_key(&self, pubkey_hex: &str) -> Result<String, LedgerError>;

    /// Build, sign, and serialize an anchor transaction from a draft.
    async fn assemble_anchor(&self, draft: &AnchorDraft) -> Result<SignedAnchor, LedgerError>;

    /// Extract the raw subject transaction (hex) from a BEEF bundle.
    async fn raw_tx_from_beef(&self, beef: &[u8]) -> Result<String, LedgerError>;

    /// Txid of the subject transaction of a BEEF bundle.
    async fn txid_from_beef(&self, beef: &[u8]) -> Result<String, LedgerError>;

    /// Locking script of output `vout` of the subject transaction of an
    /// atomic BEEF bundle.
    async fn output_script_from_beef(&self, beef: &[u8], vout: u32)
        -> Result<Vec<u8>, LedgerError>;
}
