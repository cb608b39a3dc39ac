//! JSON-RPC client for the wallet/ledger collaborator daemon.
//!
//! The daemon holds key material and the wallet database; this node talks to
//! it over JSON-RPC and implements both collaborator traits on top of one
//! connection:
//!
//! Wallet methods: `getIdentityKey`, `getBalance`, `verifyPayment`,
//! `acceptPayment`, `createPayment`.
//! Ledger methods: `signMessage`, `verifyMessage`, `addressForKey`,
//! `assembleAnchor`, `rawTxFromBeef`, `txidFromBeef`, `outputScriptFromBeef`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use agora_protocol::ledger::{
    AnchorDraft, AnchorFunding, ChainLink, LedgerCrypto, LedgerError, SignedAnchor,
};

use crate::wallet::{
    AcceptPaymentArgs, BuiltPayment, CreatePaymentArgs, PaymentVerification, WalletError,
    WalletHandle, WalletProvider,
};

// ============================================================================
// JSON-RPC primitives
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: P,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

struct RpcCore {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcCore {
    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<T, String> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let resp: JsonRpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| format!("{method} HTTP error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("{method} response parse error: {e}"))?;

        resp.result.ok_or_else(|| {
            let msg = resp
                .error
                .map(|e| format!("code={} msg={}", e.code, e.message))
                .unwrap_or_else(|| "no result and no error".into());
            format!("{method} failed: {msg}")
        })
    }
}

/// One collaborator endpoint serving both trait facets.
#[derive(Clone)]
pub struct CollaboratorRpc {
    core: Arc<RpcCore>,
}

impl CollaboratorRpc {
    pub fn new(url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("static reqwest config is valid");
        Self {
            core: Arc::new(RpcCore {
                url: url.to_owned(),
                http,
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

// ============================================================================
// Wallet facet
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityKeyResult {
    identity_key: String,
}

#[derive(Deserialize)]
struct BalanceResult {
    satoshis: u64,
}

#[derive(Serialize)]
struct VerifyPaymentParams<'a> {
    beef: &'a str,
}

#[derive(Deserialize)]
struct AcceptPaymentResult {
    accepted: bool,
}

struct RpcWalletHandle {
    core: Arc<RpcCore>,
}

#[async_trait]
impl WalletProvider for CollaboratorRpc {
    async fn load(&self) -> Result<Box<dyn WalletHandle>, WalletError> {
        // The daemon scopes sessions per request; loading is handle setup only.
        Ok(Box::new(RpcWalletHandle { core: self.core.clone() }))
    }
}

#[async_trait]
impl WalletHandle for RpcWalletHandle {
    async fn identity_key(&self) -> Result<String, WalletError> {
        let r: IdentityKeyResult = self
            .core
            .call("getIdentityKey", ())
            .await
            .map_err(WalletError::Unavailable)?;
        Ok(r.identity_key)
    }

    async fn balance(&self) -> Result<u64, WalletError> {
        let r: BalanceResult = self
            .core
            .call("getBalance", ())
            .await
            .map_err(WalletError::Call)?;
        Ok(r.satoshis)
    }

    async fn verify_payment(&self, beef: &str) -> Result<PaymentVerification, WalletError> {
        self.core
            .call("verifyPayment", VerifyPaymentParams { beef })
            .await
            .map_err(WalletError::Call)
    }

    async fn accept_payment(&self, args: AcceptPaymentArgs) -> Result<bool, WalletError> {
        let r: AcceptPaymentResult = self
            .core
            .call("acceptPayment", args)
            .await
            .map_err(WalletError::Call)?;
        Ok(r.accepted)
    }

    async fn create_payment(&self, args: CreatePaymentArgs) -> Result<BuiltPayment, WalletError> {
        self.core
            .call("createPayment", args)
            .await
            .map_err(WalletError::Call)
    }

    async fn destroy(self: Box<Self>) -> Result<(), WalletError> {
        // Nothing server-side to tear down; dropping releases the handle.
        Ok(())
    }
}

// ============================================================================
// Ledger facet
// ============================================================================

#[derive(Serialize)]
struct SignMessageParams<'a> {
    preimage: &'a str,
}

#[derive(Deserialize)]
struct SignMessageResult {
    signature: String,
}

#[derive(Serialize)]
struct VerifyMessageParams<'a> {
    pubkey: &'a str,
    preimage: &'a str,
    signature: &'a str,
}

#[derive(Deserialize)]
struct VerifyMessageResult {
    valid: bool,
}

#[derive(Serialize)]
struct AddressForKeyParams<'a> {
    pubkey: &'a str,
}

#[derive(Deserialize)]
struct AddressForKeyResult {
    address: String,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum FundingDto<'a> {
    #[serde(rename_all = "camelCase")]
    StoredChange {
        tx_hex: &'a str,
        vout: u32,
        satoshis: u64,
        source_chain: &'a [ChainLink],
    },
    #[serde(rename_all = "camelCase")]
    ExplorerBeef {
        beef: String,
        txid: &'a str,
        vout: u32,
        satoshis: u64,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssembleAnchorParams<'a> {
    funding: FundingDto<'a>,
    op_return_script: String,
    anchor_sats: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    change_address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    change_sats: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssembleAnchorResult {
    txid: String,
    raw_hex: String,
    beef: String,
    source_txid: String,
    source_tx_hex: String,
}

#[derive(Serialize)]
struct BeefParams {
    beef: String,
}

#[derive(Serialize)]
struct OutputScriptParams {
    beef: String,
    vout: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTxResult {
    raw_hex: String,
}

#[derive(Deserialize)]
struct TxidResult {
    txid: String,
}

#[derive(Deserialize)]
struct OutputScriptResult {
    script: String,
}

#[async_trait]
impl LedgerCrypto for CollaboratorRpc {
    async fn sign_message(&self, preimage: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let r: SignMessageResult = self
            .core
            .call("signMessage", SignMessageParams { preimage: &hex::encode(preimage) })
            .await
            .map_err(LedgerError::Unavailable)?;
        hex::decode(&r.signature).map_err(|e| LedgerError::InvalidSignature(e.to_string()))
    }

    async fn verify_message(
        &self,
        pubkey_hex: &str,
        preimage: &[u8],
        signature_der: &[u8],
    ) -> Result<bool, LedgerError> {
        let r: VerifyMessageResult = self
            .core
            .call(
                "verifyMessage",
                VerifyMessageParams {
                    pubkey: pubkey_hex,
                    preimage: &hex::encode(preimage),
                    signature: &hex::encode(signature_der),
                },
            )
            .await
            .map_err(LedgerError::Unavailable)?;
        Ok(r.valid)
    }

    async fn address_for_key(&self, pubkey_hex: &str) -> Result<String, LedgerError> {
        let r: AddressForKeyResult = self
            .core
            .call("addressForKey", AddressForKeyParams { pubkey: pubkey_hex })
            .await
            .map_err(LedgerError::InvalidKey)?;
        Ok(r.address)
    }

    async fn assemble_anchor(&self, draft: &AnchorDraft) -> Result<SignedAnchor, LedgerError> {
        let funding = match &draft.funding {
            AnchorFunding::StoredChange { tx_hex, vout, satoshis, source_chain } => {
                FundingDto::StoredChange {
                    tx_hex,
                    vout: *vout,
                    satoshis: *satoshis,
                    source_chain,
                }
            }
            AnchorFunding::ExplorerBeef { beef, txid, vout, satoshis } => {
                FundingDto::ExplorerBeef {
                    beef: BASE64.encode(beef),
                    txid,
                    vout: *vout,
                    satoshis: *satoshis,
                }
            }
        };
        let params = AssembleAnchorParams {
            funding,
            op_return_script: hex::encode(&draft.op_return_script),
            anchor_sats: draft.anchor_sats,
            change_address: draft.change.as_ref().map(|c| c.address.as_str()),
            change_sats: draft.change.as_ref().map(|c| c.satoshis),
        };

        let r: AssembleAnchorResult = self
            .core
            .call("assembleAnchor", params)
            .await
            .map_err(LedgerError::Assembly)?;
        let beef = BASE64
            .decode(&r.beef)
            .map_err(|e| LedgerError::Beef(e.to_string()))?;
        Ok(SignedAnchor {
            txid: r.txid,
            raw_hex: r.raw_hex,
            beef,
            source_txid: r.source_txid,
            source_tx_hex: r.source_tx_hex,
        })
    }

    async fn raw_tx_from_beef(&self, beef: &[u8]) -> Result<String, LedgerError> {
        let r: RawTxResult = self
            .core
            .call("rawTxFromBeef", BeefParams { beef: BASE64.encode(beef) })
            .await
            .map_err(LedgerError::Beef)?;
        Ok(r.raw_hex)
    }

    async fn txid_from_beef(&self, beef: &[u8]) -> Result<String, LedgerError> {
        let r: TxidResult = self
            .core
            .call("txidFromBeef", BeefParams { beef: BASE64.encode(beef) })
            .await
            .map_err(LedgerError::Beef)?;
        Ok(r.txid)
    }

    async fn output_script_from_beef(
        &self,
        beef: &[u8],
        vout: u32,
    ) -> Result<Vec<u8>, LedgerError> {
        let r: OutputScriptResult = self
            .core
            .call("outputScriptFromBeef", OutputScriptParams { beef: BASE64.encode(beef), vout })
            .await
            .map_err(LedgerError::Beef)?;
        hex::decode(&r.script).map_err(|e| LedgerError::Beef(e.to_string()))
    }
}
