//! Baemail: the paid-message delivery service.
//!
//! Senders pay to have a message delivered to this agent's operator through
//! a configured delivery gateway. Payment size picks the tier. Everything
//! that can be checked without touching money happens first; an
//! unconfigured service, a blocked sender, a bad message, or a missing
//! gateway all reject before the payment gate, so no payment is captured
//! for a request that cannot possibly be delivered. A delivery that fails
//! *after* capture is logged as refundable and settled by the operator
//! refund command.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use agora_protocol::constants::{DEFAULT_MAX_MESSAGE_LENGTH, RELAY_TIMEOUT_MS};
use agora_protocol::message::{MsgKind, RelayMessage};

use crate::context::AgentContext;
use crate::payment;
use crate::router::{RouteAction, RouteOutcome, BAEMAIL_SERVICE_ID};
use crate::storage::now_rfc3339;
use crate::wallet::{CreatePaymentArgs, PaymentClaim};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tiers {
    pub standard: u64,
    pub priority: u64,
    pub urgent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaemailConfig {
    pub delivery_channel: String,
    pub tiers: Tiers,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default)]
    pub blocklist: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

pub fn load_config(ctx: &AgentContext) -> Option<BaemailConfig> {
    ctx.state.read_json(&ctx.state.baemail_config()).ok().flatten()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Standard,
    Priority,
    Urgent,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Priority => "priority",
            Self::Urgent => "urgent",
        }
    }
}

/// Classify a payment against the non-decreasing tier thresholds.
pub fn classify(paid_sats: u64, tiers: &Tiers) -> Tier {
    if paid_sats >= tiers.urgent {
        Tier::Urgent
    } else if paid_sats >= tiers.priority {
        Tier::Priority
    } else {
        Tier::Standard
    }
}

// ============================================================================
// Delivery log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaemailLogEntry {
    pub request_id: String,
    pub from: String,
    pub sender_name: String,
    pub tier: Tier,
    pub paid_sats: u64,
    pub message_length: usize,
    pub delivery_channel: String,
    pub delivery_success: bool,
    pub delivery_error: Option<String>,
    pub payment_txid: String,
    /// null = delivered fine; pending = refund owed; completed = refunded.
    pub refund_status: Option<RefundStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<String>,
    pub timestamp: String,
}

// ============================================================================
// Request handling
// ============================================================================

async fn send_rejection(
    ctx: &AgentContext,
    identity_key: &str,
    msg: &RelayMessage,
    reason_sent: String,
    reason_short: &str,
) -> Result<RouteOutcome> {
    let payload = json!({
        "requestId": msg.id,
        "serviceId": BAEMAIL_SERVICE_ID,
        "status": "rejected",
        "reason": reason_sent,
    });
    ctx.send_signed(identity_key, &msg.from, MsgKind::ServiceResponse, payload)
        .await?;
    let mut outcome = RouteOutcome::new(msg, RouteAction::Rejected, true);
    outcome.reason = Some(reason_short.to_owned());
    outcome.detail.insert("serviceId".into(), json!(BAEMAIL_SERVICE_ID));
    Ok(outcome)
}

/// Handle one baemail service-request end to end.
pub async fn process(
    ctx: &AgentContext,
    identity_key: &str,
    msg: &RelayMessage,
) -> Result<RouteOutcome> {
    let input = msg.payload.get("input").unwrap_or(&msg.payload);

    let Some(config) = load_config(ctx) else {
        return send_rejection(
            ctx,
            identity_key,
            msg,
            "Baemail service not configured on this agent.".into(),
            "not configured",
        )
        .await;
    };

    if config.blocklist.iter().any(|k| k == &msg.from) {
        return send_rejection(ctx, identity_key, msg, "Sender is blocked.".into(), "blocked")
            .await;
    }

    let message = input.get("message").and_then(Value::as_str).unwrap_or("");
    if message.trim().is_empty() {
        return send_rejection(
            ctx,
            identity_key,
            msg,
            r#"Missing or empty message. Send {message: "your message"}"#.into(),
            "missing message",
        )
        .await;
    }
    if message.len() > config.max_message_length {
        return send_rejection(
            ctx,
            identity_key,
            msg,
            format!("Message too long. Max {} characters.", config.max_message_length),
            "message too long",
        )
        .await;
    }

    // The gateway must be configured before any money moves: a request that
    // cannot be delivered must not capture the payment.
    let (Some(gateway_url), Some(gateway_token)) = (
        ctx.config.delivery_gateway_url.as_deref(),
        ctx.config.delivery_gateway_token.as_deref(),
    ) else {
        return send_rejection(
            ctx,
            identity_key,
            msg,
            "Delivery gateway not configured. Payment NOT accepted.".into(),
            "gateway not configured",
        )
        .await;
    };

    let claim = PaymentClaim::from_payload(&msg.payload);
    let min_price = config.tiers.standard;
    let pay = payment::verify_and_accept(
        ctx.wallet.as_ref(),
        claim.as_ref(),
        min_price,
        &msg.from,
        BAEMAIL_SERVICE_ID,
    )
    .await;

    if !pay.accepted {
        let why = pay.error.clone().unwrap_or_else(|| "payment rejected".to_owned());
        return send_rejection(
            ctx,
            identity_key,
            msg,
            format!("Payment rejected: {why}. Minimum: {min_price} sats."),
            &why,
        )
        .await;
    }

    let paid_sats = pay.satoshis;
    let tier = classify(paid_sats, &config.tiers);
    let sender_name = input
        .get("senderName")
        .and_then(Value::as_str)
        .unwrap_or("Anonymous")
        .to_owned();
    let reply_key = input
        .get("replyIdentityKey")
        .and_then(Value::as_str)
        .unwrap_or(&msg.from);

    let formatted = format!(
        "Baemail ({tier})\n\nFrom: {sender_name}\nPaid: {paid_sats} sats\nReply to: {reply_short}...\n\n---\n\n{message}",
        tier = tier.label().to_uppercase(),
        reply_short = &reply_key[..reply_key.len().min(16)],
    );

    // --- Deliver -------------------------------------------------------------
    let mut delivery_success = false;
    let mut delivery_error: Option<String> = None;
    let delivery = ctx
        .http
        .post(gateway_url)
        .timeout(Duration::from_millis(RELAY_TIMEOUT_MS))
        .bearer_auth(gateway_token)
        .json(&json!({
            "message": formatted,
            "name": "Baemail",
            "sessionKey": format!("baemail:{}", msg.id),
            "channel": config.delivery_channel,
        }))
        .send()
        .await;
    match delivery {
        Ok(resp) if resp.status().is_success() => delivery_success = true,
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            delivery_error = Some(format!("gateway failed: {status} {body}"));
        }
        Err(e) => delivery_error = Some(e.to_string()),
    }

    // --- Log -----------------------------------------------------------------
    let entry = BaemailLogEntry {
        request_id: msg.id.clone(),
        from: msg.from.clone(),
        sender_name,
        tier,
        paid_sats,
        message_length: message.len(),
        delivery_channel: config.delivery_channel.clone(),
        delivery_success,
        delivery_error: delivery_error.clone(),
        payment_txid: pay.txid.clone().unwrap_or_default(),
        refund_status: if delivery_success { None } else { Some(RefundStatus::Pending) },
        refund_txid: None,
        refunded_at: None,
        timestamp: now_rfc3339(),
    };
    ctx.state.append_jsonl(&ctx.state.baemail_log(), &entry)?;

    tracing::info!(
        request_id = %msg.id,
        tier = tier.label(),
        paid_sats,
        delivered = delivery_success,
        "baemail processed",
    );

    // --- Respond -------------------------------------------------------------
    let status = if delivery_success { "fulfilled" } else { "delivery_failed" };
    let response = json!({
        "requestId": msg.id,
        "serviceId": BAEMAIL_SERVICE_ID,
        "status": status,
        "result": {
            "delivered": delivery_success,
            "tier": tier,
            "channel": config.delivery_channel,
            "paidSats": paid_sats,
            "error": delivery_error,
            "replyTo": identity_key,
            "refundable": !delivery_success,
        },
        "paymentAccepted": true,
        "paymentTxid": pay.txid,
        "satoshisReceived": paid_sats,
    });
    ctx.send_signed(identity_key, &msg.from, MsgKind::ServiceResponse, response)
        .await?;

    let action =
        if delivery_success { RouteAction::Fulfilled } else { RouteAction::DeliveryFailed };
    let mut outcome = RouteOutcome::new(msg, action, true);
    outcome.detail.insert("serviceId".into(), json!(BAEMAIL_SERVICE_ID));
    outcome.detail.insert("tier".into(), json!(tier));
    outcome.detail.insert("deliverySuccess".into(), json!(delivery_success));
    if let Some(e) = delivery_error {
        outcome.detail.insert("deliveryError".into(), json!(e));
    }
    outcome.detail.insert("paymentAccepted".into(), json!(true));
    outcome.detail.insert("paymentTxid".into(), json!(pay.txid));
    outcome.detail.insert("satoshisReceived".into(), json!(paid_sats));
    Ok(outcome)
}

// ============================================================================
// Operator commands
// ============================================================================

pub fn setup(
    ctx: &AgentContext,
    channel: &str,
    standard: u64,
    priority: Option<u64>,
    urgent: Option<u64>,
) -> Result<Value> {
    if standard < 1 {
        bail!("standard rate must be a positive number of sats");
    }
    let priority = priority.unwrap_or(standard * 2);
    let urgent = urgent.unwrap_or(standard * 5);
    if priority < standard {
        bail!("priority rate must be >= standard rate");
    }
    if urgent < priority {
        bail!("urgent rate must be >= priority rate");
    }

    let now = now_rfc3339();
    let config = BaemailConfig {
        delivery_channel: channel.to_owned(),
        tiers: Tiers { standard, priority, urgent },
        max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        blocklist: Vec::new(),
        created_at: now.clone(),
        updated_at: now,
    };
    ctx.state.write_json(&ctx.state.baemail_config(), &config)?;
    Ok(json!({
        "configured": true,
        "deliveryChannel": channel,
        "tiers": config.tiers,
    }))
}

pub fn show_config(ctx: &AgentContext) -> Result<Value> {
    let config = load_config(ctx)
        .ok_or_else(|| anyhow!("baemail not configured; run baemail-setup first"))?;
    Ok(serde_json::to_value(config)?)
}

pub fn block(ctx: &AgentContext, identity_key: &str) -> Result<Value> {
    let mut config = load_config(ctx)
        .ok_or_else(|| anyhow!("baemail not configured; run baemail-setup first"))?;
    if config.blocklist.iter().any(|k| k == identity_key) {
        bail!("identity already blocked");
    }
    config.blocklist.push(identity_key.to_owned());
    config.updated_at = now_rfc3339();
    ctx.state.write_json(&ctx.state.baemail_config(), &config)?;
    Ok(json!({ "blocked": identity_key, "totalBlocked": config.blocklist.len() }))
}

pub fn unblock(ctx: &AgentContext, identity_key: &str) -> Result<Value> {
    let mut config = load_config(ctx)
        .ok_or_else(|| anyhow!("baemail not configured; run baemail-setup first"))?;
    if !config.blocklist.iter().any(|k| k == identity_key) {
        bail!("identity not in blocklist");
    }
    config.blocklist.retain(|k| k != identity_key);
    config.updated_at = now_rfc3339();
    ctx.state.write_json(&ctx.state.baemail_config(), &config)?;
    Ok(json!({ "unblocked": identity_key, "totalBlocked": config.blocklist.len() }))
}

pub fn recent_log(ctx: &AgentContext, limit: usize) -> Result<Value> {
    let entries: Vec<BaemailLogEntry> = ctx.state.read_jsonl(&ctx.state.baemail_log())?;
    let total = entries.len();
    let recent: Vec<_> = entries.into_iter().rev().take(limit).collect();
    Ok(json!({ "log": recent, "count": total, "showing": recent.len() }))
}

/// Refund a failed delivery: `paid - 1` sats back to the sender's key.
/// Idempotent; an entry already marked completed is rejected before any
/// transaction is built.
pub async fn refund(ctx: &AgentContext, request_id: &str) -> Result<Value> {
    let path = ctx.state.baemail_log();
    let text = std::fs::read_to_string(&path).context("no baemail log found")?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut entry: Option<(usize, BaemailLogEntry)> = None;
    for (idx, line) in lines.iter().enumerate() {
        if let Ok(parsed) = serde_json::from_str::<BaemailLogEntry>(line) {
            if parsed.request_id == request_id {
                entry = Some((idx, parsed));
                break;
            }
        }
    }
    let (line_idx, mut entry) =
        entry.ok_or_else(|| anyhow!("request {request_id} not found in baemail log"))?;

    if entry.delivery_success {
        bail!("this delivery succeeded; no refund due");
    }
    if entry.refund_status == Some(RefundStatus::Completed) {
        bail!("refund already processed for this request");
    }

    // Flat 1-sat fee deduction, as shipped.
    let refund_sats = entry.paid_sats.saturating_sub(1);
    if refund_sats < 1 {
        bail!("amount too small to refund");
    }

    // Display-only; a failed derivation just leaves the field null.
    let refund_address = ctx.ledger.address_for_key(&entry.from).await.ok();

    let handle = ctx.wallet.load().await?;
    let built = handle
        .create_payment(CreatePaymentArgs {
            to: entry.from.clone(),
            satoshis: refund_sats,
            description: format!("Refund for {request_id}"),
        })
        .await;
    if let Err(e) = handle.destroy().await {
        tracing::warn!(error = %e, "wallet handle release failed");
    }
    let built = built.context("building refund payment")?;

    let beef = BASE64.decode(&built.beef).context("decoding refund BEEF")?;
    let raw_hex = ctx
        .ledger
        .raw_tx_from_beef(&beef)
        .await
        .context("extracting refund transaction")?;
    ctx.explorer.broadcast(&raw_hex).await?;

    entry.refund_status = Some(RefundStatus::Completed);
    entry.refund_txid = Some(built.txid.clone());
    entry.refunded_at = Some(now_rfc3339());

    let mut out = Vec::with_capacity(text.len());
    for (idx, line) in lines.iter().enumerate() {
        if idx == line_idx {
            out.extend(serde_json::to_vec(&entry)?);
        } else {
            out.extend_from_slice(line.as_bytes());
        }
        out.push(b'\n');
    }
    std::fs::write(&path, out).context("rewriting baemail log")?;

    tracing::info!(request_id, refund_sats, txid = %built.txid, "refund broadcast");

    Ok(json!({
        "refunded": true,
        "requestId": request_id,
        "refundSats": refund_sats,
        "refundAddress": refund_address,
        "txid": built.txid,
    }))
}
