//! Wallet collaborator boundary.
//!
//! All payment construction, verification, and settlement happens inside the
//! wallet collaborator; this node only moves claims and results across the
//! seam. A handle is acquired and released per call; never held across
//! unrelated operations; so concurrent message handling cannot contend over
//! the wallet's local storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet unavailable: {0}")]
    Unavailable(String),

    #[error("wallet call failed: {0}")]
    Call(String),
}

/// A payment claim attached to a service request (`payload.payment`).
/// Entirely sender-controlled; nothing here is trusted until the wallet
/// verifies and settles it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentClaim {
    /// Set by the sender when their own payment build failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beef: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satoshis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_identity_key: Option<String>,
}

impl PaymentClaim {
    /// Parse the `payment` field of a service-request payload, if any.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let raw = payload.get("payment")?;
        if raw.is_null() {
            return None;
        }
        serde_json::from_value(raw.clone()).ok()
    }
}

/// Result of the wallet's pure verification pass.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentVerification {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptPaymentArgs {
    pub beef: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_identity_key: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentArgs {
    pub to: String,
    pub satoshis: u64,
    pub description: String,
}

/// A payment built by the wallet. The sender does not broadcast it; the
/// recipient does, on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuiltPayment {
    pub beef: String,
    pub txid: String,
    pub satoshis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_identity_key: Option<String>,
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn load(&self) -> Result<Box<dyn WalletHandle>, WalletError>;
}

#[async_trait]
pub trait WalletHandle: Send {
    async fn identity_key(&self) -> Result<String, WalletError>;

    async fn balance(&self) -> Result<u64, WalletError>;

    /// Structural/proof verification only; no state change.
    async fn verify_payment(&self, beef: &str) -> Result<PaymentVerification, WalletError>;

    /// Broadcast and book the payment. Returns whether the wallet accepted it.
    async fn accept_payment(&self, args: AcceptPaymentArgs) -> Result<bool, WalletError>;

    async fn create_payment(&self, args: CreatePaymentArgs) -> Result<BuiltPayment, WalletError>;

    /// Release the handle. Must be called on every path.
    async fn destroy(self: Box<Self>) -> Result<(), WalletError>;
}
