//! Overlay presence: identity registration, service advertisements, and
//! discovery of other agents' records.
//!
//! Registration and advertisement publish OP_RETURN anchors under the
//! identity/services topics and mirror the records locally. Discovery reads
//! records back out of lookup-service BEEFs. Removal is local only; the
//! chain is immutable.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agora_protocol::constants::{
    LOOKUP_AGENTS, LOOKUP_SERVICES, PROTOCOL_ID, TOPIC_IDENTITY, TOPIC_SERVICES,
};
use agora_protocol::opreturn;

use crate::anchor;
use crate::context::AgentContext;
use crate::storage::{now_rfc3339, StateDir};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAdvertisement {
    pub service_id: String,
    pub name: String,
    pub description: String,
    pub price_sats: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub identity_key: String,
    pub agent_name: String,
    pub agent_description: String,
    pub overlay_url: String,
    pub identity_txid: String,
    pub service_txid: Option<String>,
    pub funded: anchor::FundingSource,
    pub registered_at: String,
}

pub fn load_services(state: &StateDir) -> Vec<ServiceAdvertisement> {
    state.read_json(&state.services()).ok().flatten().unwrap_or_default()
}

pub fn save_services(state: &StateDir, services: &[ServiceAdvertisement]) -> Result<()> {
    state.write_json(&state.services(), &services)
}

/// Advertised price for a locally-registered service.
pub fn local_price(state: &StateDir, service_id: &str) -> Option<u64> {
    load_services(state)
        .iter()
        .find(|s| s.service_id == service_id)
        .map(|s| s.price_sats)
}

fn load_registration(state: &StateDir) -> Option<Registration> {
    state.read_json(&state.registration()).ok().flatten()
}

// ============================================================================
// Registration
// ============================================================================

/// Publish this agent's identity record. Idempotent for an unchanged
/// identity key.
pub async fn register(ctx: &AgentContext) -> Result<Value> {
    let identity_key = ctx.identity_key().await?;

    if let Some(reg) = load_registration(&ctx.state) {
        if reg.identity_key == identity_key {
            return Ok(json!({
                "alreadyRegistered": true,
                "identityKey": identity_key,
                "identityTxid": reg.identity_txid,
                "overlayUrl": ctx.config.overlay_url,
            }));
        }
    }

    let registered_at = now_rfc3339();
    let identity_payload = json!({
        "protocol": PROTOCOL_ID,
        "type": "identity",
        "identityKey": identity_key,
        "name": ctx.config.agent_name,
        "description": ctx.config.agent_description,
        "registeredAt": registered_at,
    });
    let identity_result = anchor::build_anchor(ctx, &identity_payload, TOPIC_IDENTITY)
        .await
        .context("registration failed")?;

    // Pre-configured services ride along as a bundle; a failure here leaves
    // the identity registered and is reported, not fatal.
    let services = load_services(&ctx.state);
    let mut service_txid = None;
    if !services.is_empty() {
        let bundle = json!({
            "protocol": PROTOCOL_ID,
            "type": "service-bundle",
            "identityKey": identity_key,
            "services": services.iter().map(|s| json!({
                "serviceId": s.service_id,
                "name": s.name,
                "description": s.description,
                "pricingSats": s.price_sats,
            })).collect::<Vec<_>>(),
            "registeredAt": registered_at,
        });
        match anchor::build_anchor(ctx, &bundle, TOPIC_SERVICES).await {
            Ok(result) => service_txid = Some(result.txid),
            Err(e) => tracing::warn!(error = %e, "service bundle publication failed"),
        }
    }

    let registration = Registration {
        identity_key: identity_key.clone(),
        agent_name: ctx.config.agent_name.clone(),
        agent_description: ctx.config.agent_description.clone(),
        overlay_url: ctx.config.overlay_url.clone(),
        identity_txid: identity_result.txid.clone(),
        service_txid: service_txid.clone(),
        funded: identity_result.funded,
        registered_at,
    };
    ctx.state.write_json(&ctx.state.registration(), &registration)?;

    Ok(json!({
        "registered": true,
        "identityKey": identity_key,
        "identityTxid": identity_result.txid,
        "serviceTxid": service_txid,
        "overlayUrl": ctx.config.overlay_url,
        "funded": identity_result.funded,
    }))
}

/// Drop the local registration record. On-chain records remain.
pub fn unregister(ctx: &AgentContext) -> Result<Value> {
    let Some(reg) = load_registration(&ctx.state) else {
        bail!("not registered");
    };
    ctx.state.delete(&ctx.state.registration())?;
    Ok(json!({
        "unregistered": true,
        "identityKey": reg.identity_key,
        "note": "Local registration removed. On-chain records remain.",
    }))
}

// ============================================================================
// Advertisements
// ============================================================================

fn service_payload(identity_key: &str, s: &ServiceAdvertisement, updated: bool) -> Value {
    let mut payload = json!({
        "protocol": PROTOCOL_ID,
        "type": "service",
        "identityKey": identity_key,
        "serviceId": s.service_id,
        "name": s.name,
        "description": s.description,
        "pricingSats": s.price_sats,
        "advertisedAt": s.registered_at,
    });
    if updated {
        payload["updated"] = json!(true);
    }
    payload
}

pub async fn advertise(
    ctx: &AgentContext,
    service_id: &str,
    name: &str,
    price_sats: u64,
    description: Option<&str>,
) -> Result<Value> {
    let identity_key = ctx.identity_key().await?;
    let mut services = load_services(&ctx.state);
    if services.iter().any(|s| s.service_id == service_id) {
        bail!("service '{service_id}' already exists; use readvertise to update");
    }

    let mut new_service = ServiceAdvertisement {
        service_id: service_id.to_owned(),
        name: name.to_owned(),
        description: description
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{name} service")),
        price_sats,
        txid: None,
        registered_at: Some(now_rfc3339()),
    };

    let result = anchor::build_anchor(
        ctx,
        &service_payload(&identity_key, &new_service, false),
        TOPIC_SERVICES,
    )
    .await
    .context("failed to advertise service")?;
    new_service.txid = Some(result.txid.clone());

    services.push(new_service.clone());
    save_services(&ctx.state, &services)?;

    Ok(json!({
        "advertised": true,
        "service": new_service,
        "txid": result.txid,
        "funded": result.funded,
    }))
}

pub async fn readvertise(
    ctx: &AgentContext,
    service_id: &str,
    name: Option<&str>,
    price_sats: Option<u64>,
    description: Option<&str>,
) -> Result<Value> {
    let identity_key = ctx.identity_key().await?;
    let mut services = load_services(&ctx.state);
    let Some(existing) = services.iter_mut().find(|s| s.service_id == service_id) else {
        bail!("service '{service_id}' not found; use advertise to create");
    };

    if let Some(name) = name {
        existing.name = name.to_owned();
    }
    if let Some(price) = price_sats {
        existing.price_sats = price;
    }
    if let Some(description) = description {
        existing.description = description.to_owned();
    }
    existing.registered_at = Some(now_rfc3339());

    let result = anchor::build_anchor(
        ctx,
        &service_payload(&identity_key, existing, true),
        TOPIC_SERVICES,
    )
    .await
    .context("failed to readvertise service")?;
    existing.txid = Some(result.txid.clone());
    let updated = existing.clone();
    save_services(&ctx.state, &services)?;

    Ok(json!({
        "readvertised": true,
        "service": updated,
        "txid": result.txid,
        "funded": result.funded,
    }))
}

pub fn remove(ctx: &AgentContext, service_id: &str) -> Result<Value> {
    let mut services = load_services(&ctx.state);
    let Some(idx) = services.iter().position(|s| s.service_id == service_id) else {
        bail!("service '{service_id}' not found");
    };
    let removed = services.remove(idx);
    save_services(&ctx.state, &services)?;
    Ok(json!({
        "removed": true,
        "service": removed,
        "note": "Removed from local registry. On-chain record remains.",
    }))
}

pub fn list(ctx: &AgentContext) -> Value {
    let services = load_services(&ctx.state);
    json!({ "services": services, "count": services.len() })
}

// ============================================================================
// Discovery
// ============================================================================

/// Decode an OP_RETURN record out of a lookup output. Any decoding failure
/// yields `None`; lookup results are best-effort enrichment.
async fn parse_lookup_output(
    ctx: &AgentContext,
    beef_b64: &str,
    output_index: u32,
    expected_type: &str,
) -> Option<Value> {
    let beef = BASE64.decode(beef_b64).ok()?;
    let script = ctx.ledger.output_script_from_beef(&beef, output_index).await.ok()?;
    let (_, mut record) = opreturn::parse_op_return(&script).ok()?;
    if record.get("type").and_then(Value::as_str) != Some(expected_type) {
        return None;
    }
    // Display-only txid; a failure to resolve it leaves the field null.
    let txid = ctx.ledger.txid_from_beef(&beef).await.ok();
    record["txid"] = json!(txid);
    Some(record)
}

/// Query the overlay for registered agents and services.
pub async fn discover(
    ctx: &AgentContext,
    service_filter: Option<&str>,
    agent_filter: Option<&str>,
) -> Result<Value> {
    let mut agents = Vec::new();
    let mut services = Vec::new();
    let mut agent_error = None;
    let mut service_error = None;

    if service_filter.is_none() {
        let query = match agent_filter {
            Some(name) => json!({ "name": name }),
            None => json!({ "type": "list" }),
        };
        match ctx.overlay.lookup(LOOKUP_AGENTS, &query).await {
            Ok(result) => {
                for output in result.outputs {
                    if let Some(record) =
                        parse_lookup_output(ctx, &output.beef, output.output_index, "identity")
                            .await
                    {
                        agents.push(record);
                    }
                }
            }
            Err(e) => agent_error = Some(e.to_string()),
        }
    }

    if agent_filter.is_none() {
        let query = match service_filter {
            Some(service) => json!({ "serviceType": service }),
            None => json!({}),
        };
        match ctx.overlay.lookup(LOOKUP_SERVICES, &query).await {
            Ok(result) => {
                for output in result.outputs {
                    if let Some(record) =
                        parse_lookup_output(ctx, &output.beef, output.output_index, "service")
                            .await
                    {
                        services.push(record);
                    }
                }
            }
            Err(e) => service_error = Some(e.to_string()),
        }
    }

    let mut out = json!({
        "overlayUrl": ctx.config.overlay_url,
        "agentCount": agents.len(),
        "serviceCount": services.len(),
        "agents": agents,
        "services": services,
    });
    if let Some(e) = agent_error {
        out["agentError"] = json!(e);
    }
    if let Some(e) = service_error {
        out["serviceError"] = json!(e);
    }
    Ok(out)
}
