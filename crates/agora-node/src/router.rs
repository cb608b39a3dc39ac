//! The protocol state machine: dispatch inbound relay messages by type.
//!
//! Outcome table:
//!   ping             → signed pong reply                    (ack)
//!   service-request  → signature gate → payment gate →
//!                      queued / handled / signed rejection  (ack)
//!   pong             → terminal receipt                     (ack)
//!   service-response → terminal receipt, surfaced to caller (ack)
//!   anything else    → unhandled, left unacknowledged so the relay
//!                      redelivers it for later inspection

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use agora_protocol::codec;
use agora_protocol::constants::DEFAULT_SERVICE_PRICE_SATS;
use agora_protocol::message::{MsgKind, RelayMessage};

use crate::baemail;
use crate::context::AgentContext;
use crate::payment;
use crate::queue::{QueueEntry, QueueStatus, ServiceQueue};
use crate::relay::WsEvent;
use crate::services;
use crate::storage::now_millis;
use crate::wallet::PaymentClaim;

pub const BAEMAIL_SERVICE_ID: &str = "baemail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteAction {
    #[serde(rename = "replied-pong")]
    RepliedPong,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "queued-for-agent")]
    QueuedForAgent,
    #[serde(rename = "received")]
    Received,
    #[serde(rename = "unhandled")]
    Unhandled,
    #[serde(rename = "fulfilled")]
    Fulfilled,
    #[serde(rename = "delivery_failed")]
    DeliveryFailed,
}

/// What happened to one inbound message. Serialized verbatim into the
/// notifications log and onto stdout in connect/poll mode.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOutcome {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub action: RouteAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_valid: Option<bool>,
    /// Whether the message should be acknowledged to the relay.
    pub ack: bool,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

impl RouteOutcome {
    pub fn new(msg: &RelayMessage, action: RouteAction, ack: bool) -> Self {
        Self {
            id: msg.id.clone(),
            kind: msg.kind.as_str().to_owned(),
            from: msg.from.clone(),
            action,
            reason: None,
            signature_valid: None,
            ack,
            detail: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_owned(), value);
        self
    }
}

/// Process a single relay message to completion.
pub async fn process_message(
    ctx: &AgentContext,
    identity_key: &str,
    msg: &RelayMessage,
) -> Result<RouteOutcome> {
    // Verify the signature when one is present; unsigned messages are flagged
    // (signature_valid = None) but only service-requests demand a signature.
    let sig_check = match msg.signature.as_deref() {
        Some(sig) => Some(
            codec::verify(
                ctx.ledger.as_ref(),
                &msg.from,
                &msg.to,
                &msg.kind,
                &msg.payload,
                Some(sig),
            )
            .await,
        ),
        None => None,
    };
    let signature_valid = sig_check.as_ref().map(|c| c.valid);

    if msg.kind == MsgKind::ServiceRequest && signature_valid != Some(true) {
        let why = sig_check
            .and_then(|c| c.reason)
            .unwrap_or_else(|| "missing signature".to_owned());
        tracing::warn!(from = %msg.from, reason = %why, "service-request signature rejected");
        let mut outcome = RouteOutcome::new(msg, RouteAction::Rejected, true);
        outcome.reason = Some("invalid-signature".to_owned());
        outcome.signature_valid = signature_valid;
        return Ok(outcome);
    }

    match &msg.kind {
        MsgKind::Ping => handle_ping(ctx, identity_key, msg).await,
        MsgKind::ServiceRequest => handle_service_request(ctx, identity_key, msg).await,
        MsgKind::Pong => Ok(RouteOutcome::new(msg, RouteAction::Received, true)
            .with("text", msg.payload.get("text").cloned().unwrap_or(Value::Null))
            .with(
                "inReplyTo",
                msg.payload.get("inReplyTo").cloned().unwrap_or(Value::Null),
            )),
        MsgKind::ServiceResponse => {
            let mut outcome = RouteOutcome::new(msg, RouteAction::Received, true)
                .with(
                    "serviceId",
                    msg.payload.get("serviceId").cloned().unwrap_or(Value::Null),
                )
                .with("status", msg.payload.get("status").cloned().unwrap_or(Value::Null))
                .with("result", msg.payload.get("result").cloned().unwrap_or(Value::Null))
                .with(
                    "requestId",
                    msg.payload.get("requestId").cloned().unwrap_or(Value::Null),
                )
                .with("direction", json!("incoming-response"));
            outcome.signature_valid = signature_valid;
            Ok(outcome)
        }
        MsgKind::Other(_) => {
            let mut outcome = RouteOutcome::new(msg, RouteAction::Unhandled, false)
                .with("payload", msg.payload.clone());
            outcome.signature_valid = signature_valid;
            Ok(outcome)
        }
    }
}

async fn handle_ping(
    ctx: &AgentContext,
    identity_key: &str,
    msg: &RelayMessage,
) -> Result<RouteOutcome> {
    let pong = json!({
        "text": "pong",
        "inReplyTo": msg.id,
        "originalText": msg.payload.get("text").cloned().unwrap_or(Value::Null),
    });
    ctx.send_signed(identity_key, &msg.from, MsgKind::Pong, pong).await?;
    Ok(RouteOutcome::new(msg, RouteAction::RepliedPong, true))
}

async fn handle_service_request(
    ctx: &AgentContext,
    identity_key: &str,
    msg: &RelayMessage,
) -> Result<RouteOutcome> {
    let service_id = msg
        .payload
        .get("serviceId")
        .and_then(Value::as_str)
        .map(str::to_owned);

    // The paid-message service has its own handler with tiering and a
    // deliver-or-refund lifecycle.
    if service_id.as_deref() == Some(BAEMAIL_SERVICE_ID) {
        return baemail::process(ctx, identity_key, msg).await;
    }

    queue_for_agent(ctx, identity_key, msg, service_id).await
}

/// Settle the attached payment and queue the request for fulfillment.
async fn queue_for_agent(
    ctx: &AgentContext,
    identity_key: &str,
    msg: &RelayMessage,
    service_id: Option<String>,
) -> Result<RouteOutcome> {
    let claim = PaymentClaim::from_payload(&msg.payload);
    let input = msg
        .payload
        .get("input")
        .cloned()
        .unwrap_or_else(|| msg.payload.clone());

    let min_price = service_id
        .as_deref()
        .and_then(|id| services::local_price(&ctx.state, id))
        .unwrap_or(DEFAULT_SERVICE_PRICE_SATS);

    let pay = payment::verify_and_accept(
        ctx.wallet.as_ref(),
        claim.as_ref(),
        min_price,
        &msg.from,
        service_id.as_deref().unwrap_or("unknown"),
    )
    .await;

    if !pay.accepted {
        let why = pay.error.clone().unwrap_or_else(|| "payment rejected".to_owned());
        let rejection = json!({
            "requestId": msg.id,
            "serviceId": service_id,
            "status": "rejected",
            "reason": format!("Payment rejected: {why}"),
        });
        ctx.send_signed(identity_key, &msg.from, MsgKind::ServiceResponse, rejection)
            .await?;
        let mut outcome = RouteOutcome::new(msg, RouteAction::Rejected, true)
            .with("serviceId", json!(service_id));
        outcome.reason = Some(why);
        return Ok(outcome);
    }

    let entry = QueueEntry {
        status: QueueStatus::Pending,
        request_id: msg.id.clone(),
        service_id: service_id.clone(),
        from: msg.from.clone(),
        identity_key: identity_key.to_owned(),
        input,
        payment_txid: pay.txid.clone(),
        satoshis_received: pay.satoshis,
        wallet_accepted: pay.wallet_accepted,
        timestamp: now_millis(),
        fulfilled_at: None,
    };
    ServiceQueue::new(ctx.state.clone()).enqueue(&entry)?;

    tracing::info!(
        request_id = %msg.id,
        service_id = ?service_id,
        satoshis = pay.satoshis,
        "service request queued",
    );

    Ok(RouteOutcome::new(msg, RouteAction::QueuedForAgent, true)
        .with("serviceId", json!(service_id))
        .with("paymentAccepted", json!(true))
        .with("paymentTxid", json!(pay.txid))
        .with("satoshisReceived", json!(pay.satoshis)))
}

// ============================================================================
// Client flows
// ============================================================================

/// Send a paid service request to another agent. A failed payment build
/// degrades to a claim carrying an `error` field; the provider decides.
pub async fn request_service(
    ctx: &AgentContext,
    to: &str,
    service_id: &str,
    sats: u64,
    input: Option<Value>,
) -> Result<Value> {
    if !agora_protocol::message::is_identity_key(to) {
        anyhow::bail!("target must be a compressed public key (66 hex chars, 02/03 prefix)");
    }
    let identity_key = ctx.identity_key().await?;

    let payment_claim: Option<Value> = if sats > 0 {
        let handle = ctx.wallet.load().await?;
        let built = handle
            .create_payment(crate::wallet::CreatePaymentArgs {
                to: to.to_owned(),
                satoshis: sats,
                description: format!("service-request: {service_id}"),
            })
            .await;
        if let Err(e) = handle.destroy().await {
            tracing::warn!(error = %e, "wallet handle release failed");
        }
        match built {
            Ok(payment) => Some(serde_json::to_value(&payment)?),
            Err(e) => {
                tracing::warn!(error = %e, "payment build failed, sending request without payment");
                Some(json!({ "error": e.to_string() }))
            }
        }
    } else {
        None
    };

    let mut payload = json!({ "serviceId": service_id });
    if let Some(input) = input {
        payload["input"] = input;
    }
    payload["payment"] = payment_claim.clone().unwrap_or(Value::Null);
    payload["requestedAt"] = json!(crate::storage::now_rfc3339());

    let payment_included =
        payment_claim.as_ref().is_some_and(|p| p.get("error").is_none());
    let payment_txid = payment_claim
        .as_ref()
        .and_then(|p| p.get("txid"))
        .cloned()
        .unwrap_or(Value::Null);
    let paid_sats = payment_claim
        .as_ref()
        .and_then(|p| p.get("satoshis"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let request_id = ctx
        .send_signed(&identity_key, to, MsgKind::ServiceRequest, payload)
        .await?;

    Ok(json!({
        "sent": true,
        "requestId": request_id,
        "to": to,
        "serviceId": service_id,
        "paymentIncluded": payment_included,
        "paymentTxid": payment_txid,
        "satoshis": paid_sats,
    }))
}

/// Send a signed fulfillment for a queued request and mark it done locally.
pub async fn respond_service(
    ctx: &AgentContext,
    request_id: &str,
    to: &str,
    service_id: &str,
    result: Value,
) -> Result<Value> {
    let identity_key = ctx.identity_key().await?;
    let payload = json!({
        "requestId": request_id,
        "serviceId": service_id,
        "status": "fulfilled",
        "result": result,
    });
    ctx.send_signed(&identity_key, to, MsgKind::ServiceResponse, payload)
        .await?;

    let fulfilled = ServiceQueue::new(ctx.state.clone()).mark_fulfilled(request_id)?;
    Ok(json!({
        "sent": true,
        "requestId": request_id,
        "serviceId": service_id,
        "to": to,
        "queueUpdated": fulfilled,
    }))
}

// ============================================================================
// Inbox draining
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub processed: usize,
    pub unhandled: usize,
    pub total: u64,
    pub messages: Vec<RouteOutcome>,
    pub unhandled_messages: Vec<RouteOutcome>,
    pub acked_ids: Vec<String>,
}

/// Fetch all pending messages, process them serially, then batch-ack.
pub async fn poll_once(ctx: &AgentContext, identity_key: &str) -> Result<PollSummary> {
    let inbox = ctx.overlay.inbox(identity_key, None).await?;
    let mut processed = Vec::new();
    let mut unhandled = Vec::new();
    let mut acked_ids = Vec::new();

    for msg in &inbox.messages {
        let outcome = process_message(ctx, identity_key, msg).await?;
        if outcome.ack {
            acked_ids.push(outcome.id.clone());
            processed.push(outcome);
        } else {
            unhandled.push(outcome);
        }
    }

    if !acked_ids.is_empty() {
        ctx.overlay.ack(identity_key, &acked_ids).await?;
    }

    Ok(PollSummary {
        processed: processed.len(),
        unhandled: unhandled.len(),
        total: inbox.count,
        messages: processed,
        unhandled_messages: unhandled,
        acked_ids,
    })
}

// ============================================================================
// Live subscription
// ============================================================================

fn log_notification(ctx: &AgentContext, record: &Value) {
    let mut stamped = record.clone();
    if let Some(map) = stamped.as_object_mut() {
        map.insert("_ts".to_owned(), json!(now_millis()));
    }
    if let Err(e) = ctx.state.append_jsonl(&ctx.state.notifications(), &stamped) {
        tracing::warn!(error = %e, "notification log append failed");
    }
}

/// Process frames from the relay subscription until cancelled. Each message
/// is routed, recorded, printed as a JSON line, and acked when its outcome
/// says so.
pub async fn run_connected(ctx: &AgentContext, cancel: &CancellationToken) -> Result<()> {
    let identity_key = ctx.identity_key().await?;

    let ctx_ref: &AgentContext = ctx;
    let identity = identity_key.clone();
    ctx.overlay
        .subscribe(&identity_key, cancel, move |event| {
            let ctx = ctx_ref;
            let identity_key = identity.clone();
            async move {
                match event {
                    WsEvent::Message { message } => {
                        match process_message(ctx, &identity_key, &message).await {
                            Ok(outcome) => {
                                match serde_json::to_value(&outcome) {
                                    Ok(record) => {
                                        println!("{record}");
                                        log_notification(ctx, &record);
                                    }
                                    Err(e) => tracing::warn!(error = %e, "outcome serialize failed"),
                                }
                                if outcome.ack {
                                    if let Err(e) = ctx
                                        .overlay
                                        .ack(&identity_key, std::slice::from_ref(&outcome.id))
                                        .await
                                    {
                                        tracing::warn!(id = %outcome.id, error = %e, "ack failed");
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::error!(id = %message.id, error = %e, "message processing failed");
                            }
                        }
                    }
                    WsEvent::ServiceAnnounced { service, txid } => {
                        let record = json!({
                            "event": "service-announced",
                            "serviceId": service.service_id,
                            "name": service.name,
                            "description": service.description,
                            "priceSats": service.pricing_sats,
                            "provider": service.identity_key,
                            "txid": txid,
                        });
                        println!("{record}");
                        log_notification(ctx, &record);
                    }
                }
            }
        })
        .await
}
