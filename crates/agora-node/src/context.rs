//! Shared context of initialized collaborator handles.
//!
//! The host builds this once at startup with concrete `LedgerCrypto` and
//! `WalletProvider` implementations; components receive it by reference.
//! There are no lazily-initialized globals anywhere in the node.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde_json::Value;

use agora_protocol::codec;
use agora_protocol::ledger::LedgerCrypto;
use agora_protocol::message::{MsgKind, SendEnvelope};

use crate::config::Config;
use crate::explorer::ExplorerClient;
use crate::relay::OverlayClient;
use crate::storage::StateDir;
use crate::wallet::WalletProvider;

pub struct AgentContext {
    pub config: Config,
    pub state: StateDir,
    pub ledger: Arc<dyn LedgerCrypto>,
    pub wallet: Arc<dyn WalletProvider>,
    pub overlay: OverlayClient,
    pub explorer: ExplorerClient,
    /// Shared client for delivery-gateway pushes; avoids per-push TCP setup.
    pub http: reqwest::Client,
}

impl AgentContext {
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerCrypto>,
        wallet: Arc<dyn WalletProvider>,
    ) -> Self {
        let state = StateDir::new(config.resolved_state_dir());
        let overlay = OverlayClient::new(&config.overlay_url);
        let explorer = ExplorerClient::new(config.explorer_base(), config.explorer_api_key.clone());
        Self { config, state, ledger, wallet, overlay, explorer, http: reqwest::Client::new() }
    }

    /// This agent's identity key, read from the wallet. The handle is scoped
    /// to this call.
    pub async fn identity_key(&self) -> Result<String> {
        let handle = self.wallet.load().await.context("loading wallet")?;
        let key = handle.identity_key().await;
        if let Err(e) = handle.destroy().await {
            tracing::warn!(error = %e, "wallet handle release failed");
        }
        key.context("reading identity key")
    }

    /// Sign an outbound message and hand it to the relay. Returns the
    /// relay-assigned message id.
    pub async fn send_signed(
        &self,
        identity_key: &str,
        to: &str,
        kind: MsgKind,
        payload: Value,
    ) -> Result<String> {
        let signature = codec::sign(self.ledger.as_ref(), to, &kind, &payload)
            .await
            .context("signing message")?;
        self.overlay
            .send(&SendEnvelope {
                from: identity_key.to_owned(),
                to: to.to_owned(),
                kind,
                payload,
                signature: Some(signature),
            })
            .await
    }
}
