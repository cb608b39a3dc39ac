//! Block-explorer API client with bounded retry.
//!
//! Retries apply only to 429/5xx responses and transport failures (including
//! per-attempt timeouts), with backoff `min(1000 * 2^attempt, 8000)` ms. Any
//! other status is returned to the caller immediately; a 404 is an answer,
//! not an outage.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use agora_protocol::constants::{
    FETCH_BACKOFF_BASE_MS, FETCH_BACKOFF_MAX_MS, FETCH_MAX_RETRIES, FETCH_TIMEOUT_MS,
};

/// One unspent output as listed by the explorer.
#[derive(Debug, Clone, Deserialize)]
pub struct Utxo {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub value: u64,
}

/// Compact inclusion proof (TSC form) for a confirmed transaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TscProof {
    pub index: u64,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub block_height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ExplorerClient {
    base: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

fn backoff(attempt: u32) -> Duration {
    let ms = FETCH_BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(FETCH_BACKOFF_MAX_MS);
    Duration::from_millis(ms)
}

impl ExplorerClient {
    pub fn new(base: String, api_key: Option<String>) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut req = self.http.get(format!("{}{path}", self.base)).timeout(timeout);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    /// Send with retry. The per-attempt timeout is carried by the builder and
    /// is independent of the backoff sleeps.
    pub async fn fetch(
        &self,
        builder: reqwest::RequestBuilder,
        max_retries: u32,
    ) -> Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 0..=max_retries {
            let req = builder
                .try_clone()
                .ok_or_else(|| anyhow!("explorer request is not retryable"))?;
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < max_retries {
                        tracing::debug!(%status, attempt, "explorer request retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt < max_retries {
                        tracing::debug!(error = %e, attempt, "explorer request retrying");
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(Into::into)
            .unwrap_or_else(|| anyhow!("explorer fetch failed after retries")))
    }

    // --- endpoints ----------------------------------------------------------

    /// Unspent outputs for an address.
    pub async fn address_unspent(&self, address: &str) -> Result<Vec<Utxo>> {
        let req = self.get(
            &format!("/address/{address}/unspent"),
            Duration::from_millis(FETCH_TIMEOUT_MS),
        );
        let resp = self.fetch(req, FETCH_MAX_RETRIES).await?;
        if !resp.status().is_success() {
            bail!("UTXO listing failed: {}", resp.status());
        }
        resp.json().await.context("parsing UTXO listing")
    }

    /// Pre-built BEEF (hex) for a confirmed transaction, including ancestors
    /// and proofs. Returns `None` when the explorer cannot produce one; the
    /// caller decides whether that is fatal.
    pub async fn beef_for_tx(&self, txid: &str) -> Result<Option<Vec<u8>>> {
        let req = self.get(&format!("/tx/{txid}/beef"), Duration::from_millis(FETCH_TIMEOUT_MS));
        let resp = match self.fetch(req, FETCH_MAX_RETRIES).await {
            Ok(resp) => resp,
            Err(_) => return Ok(None),
        };
        if !resp.status().is_success() {
            return Ok(None);
        }
        let text = resp.text().await.unwrap_or_default();
        let trimmed = text.trim();
        if trimmed.len() < 8 {
            return Ok(None);
        }
        Ok(hex::decode(trimmed).ok())
    }

    /// Compact inclusion proof for a confirmed transaction. Single retry and
    /// a short timeout; this is enrichment, not a critical path.
    pub async fn tsc_proof(&self, txid: &str) -> Result<Option<TscProof>> {
        let req = self.get(&format!("/tx/{txid}/proof/tsc"), Duration::from_secs(5));
        let resp = match self.fetch(req, 1).await {
            Ok(resp) => resp,
            Err(_) => return Ok(None),
        };
        if !resp.status().is_success() {
            return Ok(None);
        }
        let proofs: Vec<TscProof> = match resp.json().await {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        Ok(proofs.into_iter().next())
    }

    /// Broadcast a raw transaction. Failures surface verbatim and are never
    /// auto-retried beyond the transport policy; spending is an operator
    /// decision.
    pub async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        let mut req = self
            .http
            .post(format!("{}/tx/raw", self.base))
            .timeout(Duration::from_millis(FETCH_TIMEOUT_MS))
            .json(&serde_json::json!({ "txhex": tx_hex }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = self.fetch(req, 0).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("broadcast failed: {status}; {body}");
        }
        let body = resp.text().await.context("reading broadcast response")?;
        Ok(body.trim().trim_matches('"').to_owned())
    }
}
