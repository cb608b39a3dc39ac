//! Overlay server client: relay messaging (HTTP + WebSocket subscribe) and
//! anchor submission/lookup.
//!
//! The subscriber is a run-until-cancelled loop with explicit reconnect
//! policy: on close, wait `WS_RECONNECT_INITIAL_MS`, doubling per consecutive
//! failure up to `WS_RECONNECT_MAX_MS`, resetting after a successful open.
//! Cancellation suppresses reconnects and closes the socket; the envelope
//! being processed is allowed to finish. Envelopes are handled strictly one
//! at a time; a slow handler blocks the stream, by contract.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use agora_protocol::constants::{RELAY_TIMEOUT_MS, WS_RECONNECT_INITIAL_MS, WS_RECONNECT_MAX_MS};
use agora_protocol::message::{RelayMessage, SendEnvelope};

#[derive(Debug, Clone, Deserialize)]
pub struct Inbox {
    #[serde(default)]
    pub messages: Vec<RelayMessage>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupOutput {
    /// Atomic BEEF, base64.
    pub beef: String,
    pub output_index: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupResult {
    #[serde(default)]
    pub outputs: Vec<LookupOutput>,
}

/// A service heard about over the subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncedService {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pricing_sats: Option<u64>,
    #[serde(default)]
    pub identity_key: Option<String>,
}

/// One frame on the subscription stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsEvent {
    Message {
        message: RelayMessage,
    },
    ServiceAnnounced {
        service: AnnouncedService,
        #[serde(default)]
        txid: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct OverlayClient {
    base: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SendResult {
    id: String,
}

#[derive(Deserialize)]
struct AckResult {
    acked: u64,
}

impl OverlayClient {
    pub fn new(base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(RELAY_TIMEOUT_MS))
            .build()
            .expect("static reqwest config is valid");
        Self { base: base.trim_end_matches('/').to_owned(), http }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    // --- relay messaging ----------------------------------------------------

    /// Send an envelope. Returns the relay-assigned message id.
    pub async fn send(&self, envelope: &SendEnvelope) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/relay/send", self.base))
            .json(envelope)
            .send()
            .await
            .context("relay send")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("relay send failed ({status}): {body}");
        }
        let result: SendResult = resp.json().await.context("parsing relay send response")?;
        Ok(result.id)
    }

    /// Fetch pending messages for an identity.
    pub async fn inbox(&self, identity: &str, since: Option<&str>) -> Result<Inbox> {
        let mut query = vec![("identity", identity)];
        if let Some(since) = since {
            query.push(("since", since));
        }
        let resp = self
            .http
            .get(format!("{}/relay/inbox", self.base))
            .query(&query)
            .send()
            .await
            .context("relay inbox")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("relay inbox failed ({status}): {body}");
        }
        resp.json().await.context("parsing relay inbox response")
    }

    /// Acknowledge processed messages. Returns how many the relay accepted.
    pub async fn ack(&self, identity: &str, message_ids: &[String]) -> Result<u64> {
        let resp = self
            .http
            .post(format!("{}/relay/ack", self.base))
            .json(&serde_json::json!({ "identity": identity, "messageIds": message_ids }))
            .send()
            .await
            .context("relay ack")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("relay ack failed ({status}): {body}");
        }
        let result: AckResult = resp.json().await.context("parsing relay ack response")?;
        Ok(result.acked)
    }

    // --- anchor submission / lookup ------------------------------------------

    /// Submit a BEEF to the overlay under a topic.
    pub async fn submit(&self, beef: &[u8], topic: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/submit", self.base))
            .json(&serde_json::json!({ "beef": BASE64.encode(beef), "topics": [topic] }))
            .send()
            .await
            .context("overlay submit")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("overlay submission failed: {status}; {body}");
        }
        Ok(())
    }

    /// Query a lookup service.
    pub async fn lookup(&self, service: &str, query: &Value) -> Result<LookupResult> {
        let resp = self
            .http
            .post(format!("{}/lookup", self.base))
            .json(&serde_json::json!({ "service": service, "query": query }))
            .send()
            .await
            .context("overlay lookup")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("lookup failed: {status}; {body}");
        }
        resp.json().await.context("parsing lookup response")
    }

    // --- subscription -------------------------------------------------------

    pub fn subscribe_url(&self, identity: &str) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https") {
            format!("wss{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http") {
            format!("ws{rest}")
        } else {
            self.base.clone()
        };
        format!("{ws_base}/relay/subscribe?identity={identity}")
    }

    /// Subscribe and dispatch frames until cancelled. Each frame is handled
    /// to completion before the next is read.
    pub async fn subscribe<H, Fut>(
        &self,
        identity: &str,
        cancel: &CancellationToken,
        mut handler: H,
    ) -> Result<()>
    where
        H: FnMut(WsEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let url = self.subscribe_url(identity);
        let mut delay = WS_RECONNECT_INITIAL_MS;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    tracing::info!(identity, overlay = %self.base, "relay subscription open");
                    delay = WS_RECONNECT_INITIAL_MS;

                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = write.close().await;
                                return Ok(());
                            }
                            frame = read.next() => match frame {
                                Some(Ok(WsMessage::Text(text))) => {
                                    match serde_json::from_str::<WsEvent>(&text) {
                                        Ok(event) => handler(event).await,
                                        Err(e) => tracing::warn!(
                                            error = %e,
                                            "unparseable subscription frame",
                                        ),
                                    }
                                }
                                Some(Ok(WsMessage::Ping(data))) => {
                                    let _ = write.send(WsMessage::Pong(data)).await;
                                }
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "relay socket error");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "relay connection failed");
                }
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
            tracing::warn!(reconnect_ms = delay, "relay disconnected, reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            delay = (delay * 2).min(WS_RECONNECT_MAX_MS);
        }
    }
}
