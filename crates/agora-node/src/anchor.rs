//! Anchor transactions: minimal-value OP_RETURN carriers for identity and
//! service records, submitted to the overlay.
//!
//! Funding priority: reuse the stored change left by our previous anchor
//! when it is large enough; otherwise fall back to an explorer UTXO lookup
//! plus BEEF fetch. Submitting an anchor either completes fully (overlay
//! accepted, new change persisted) or leaves the prior stored change
//! untouched. One UTXO lineage can therefore fund many anchors with no
//! explorer round-trips, carrying a depth-capped ancestor chain forward.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agora_protocol::constants::{
    ANCHOR_SATS, MIN_CHANGE_SATS, MIN_INPUT_SATS, PROTOCOL_TAG, SOURCE_CHAIN_DEPTH,
};
use agora_protocol::ledger::{AnchorDraft, AnchorFunding, ChainLink, ChangeOutput};
use agora_protocol::{merkle, opreturn};

use crate::context::AgentContext;

/// The one spendable output retained after our last anchor, with the
/// ancestor chain needed to prove it without an explorer query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChange {
    pub tx_hex: String,
    pub txid: String,
    pub vout: u32,
    pub satoshis: u64,
    #[serde(default)]
    pub source_chain: Vec<ChainLink>,
    pub saved_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FundingSource {
    StoredChange,
    Explorer,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorResult {
    pub txid: String,
    pub funded: FundingSource,
    /// Human-facing explorer URL for the new transaction.
    pub explorer: String,
}

/// Size-proportional fee: `ceil(estimated_size / 1000)` sats, minimum 1.
fn anchor_fee(script_len: usize) -> u64 {
    // input + OP_RETURN output + change output + tx framing
    let estimated_size = 148 + 34 + script_len + 34 + 10;
    ((estimated_size as u64).div_ceil(1000)).max(1)
}

/// Build, sign, submit, and account for one anchor transaction.
pub async fn build_anchor(ctx: &AgentContext, payload: &Value, topic: &str) -> Result<AnchorResult> {
    let identity_key = ctx.identity_key().await?;
    let address = ctx
        .ledger
        .address_for_key(&identity_key)
        .await
        .context("deriving funding address")?;

    let op_return_script = opreturn::build_op_return(PROTOCOL_TAG, payload)?;

    // --- Fund the transaction ---------------------------------------------
    // A parse failure on the stored-change file falls back to the explorer
    // path rather than wedging anchor publication.
    let stored: Option<StoredChange> =
        ctx.state.read_json(&ctx.state.stored_change()).ok().flatten();

    let (funding, prior_chain) = match stored.filter(|s| s.satoshis >= MIN_INPUT_SATS) {
        Some(change) => {
            tracing::debug!(
                txid = %change.txid,
                satoshis = change.satoshis,
                chain_depth = change.source_chain.len(),
                "funding anchor from stored change",
            );
            (
                AnchorFunding::StoredChange {
                    tx_hex: change.tx_hex,
                    vout: change.vout,
                    satoshis: change.satoshis,
                    source_chain: change.source_chain.clone(),
                },
                Some(change.source_chain),
            )
        }
        None => {
            let utxos = ctx.explorer.address_unspent(&address).await?;
            let utxo = utxos
                .into_iter()
                .find(|u| u.value >= MIN_INPUT_SATS)
                .ok_or_else(|| {
                    anyhow!(
                        "no suitable UTXO: need ≥ {MIN_INPUT_SATS} sats; fund address {address}"
                    )
                })?;
            let beef = ctx
                .explorer
                .beef_for_tx(&utxo.tx_hash)
                .await?
                .ok_or_else(|| {
                    anyhow!(
                        "cannot obtain BEEF for UTXO {}; transaction may be unconfirmed",
                        utxo.tx_hash
                    )
                })?;
            tracing::debug!(txid = %utxo.tx_hash, satoshis = utxo.value, "funding anchor from explorer UTXO");
            (
                AnchorFunding::ExplorerBeef {
                    beef,
                    txid: utxo.tx_hash,
                    vout: utxo.tx_pos,
                    satoshis: utxo.value,
                },
                None,
            )
        }
    };
    let used_stored = prior_chain.is_some();
    let input_sats = funding.satoshis();

    // --- Outputs and fee ----------------------------------------------------
    let fee = anchor_fee(op_return_script.len());
    let change_sats = input_sats.saturating_sub(ANCHOR_SATS + fee);
    let change = (change_sats >= MIN_CHANGE_SATS).then(|| ChangeOutput {
        address: address.clone(),
        satoshis: change_sats,
    });

    let draft = AnchorDraft {
        funding,
        op_return_script,
        anchor_sats: ANCHOR_SATS,
        change,
    };
    let signed = ctx
        .ledger
        .assemble_anchor(&draft)
        .await
        .context("assembling anchor transaction")?;

    // --- Submit -------------------------------------------------------------
    // Any failure up to and including this point leaves the previous stored
    // change on disk exactly as it was.
    ctx.overlay.submit(&signed.beef, topic).await?;

    // --- Persist the new change ---------------------------------------------
    if let Some(change) = &draft.change {
        let mut chain = vec![ChainLink {
            tx_hex: signed.source_tx_hex,
            txid: signed.source_txid,
            merkle_path_hex: None,
            block_height: None,
        }];
        match prior_chain {
            Some(prior) => chain.extend(prior),
            None => {
                // First link of a fresh chain: attach an inclusion proof so
                // later BEEFs stand alone. Best effort; a missing proof just
                // leaves the field empty.
                if let Ok(Some(proof)) = ctx.explorer.tsc_proof(&chain[0].txid).await {
                    match merkle::build(
                        &chain[0].txid,
                        proof.index,
                        &proof.nodes,
                        proof.block_height.unwrap_or(0),
                    ) {
                        Ok(path) => {
                            chain[0].merkle_path_hex = Some(path.to_hex());
                            chain[0].block_height = proof.block_height;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "inclusion proof reconstruction failed")
                        }
                    }
                }
            }
        }
        chain.truncate(SOURCE_CHAIN_DEPTH);

        let record = StoredChange {
            tx_hex: signed.raw_hex.clone(),
            txid: signed.txid.clone(),
            vout: 1, // change is always output index 1, after the OP_RETURN
            satoshis: change.satoshis,
            source_chain: chain,
            saved_at: crate::storage::now_rfc3339(),
        };
        ctx.state.write_json(&ctx.state.stored_change(), &record)?;
    } else {
        ctx.state.delete(&ctx.state.stored_change())?;
    }

    let funded = if used_stored { FundingSource::StoredChange } else { FundingSource::Explorer };
    tracing::info!(
        txid = %signed.txid,
        topic,
        funded = ?funded,
        fee,
        "anchor submitted",
    );

    let explorer = ctx.config.network.explorer_tx_url(&signed.txid);
    Ok(AnchorResult {
        txid: signed.txid,
        funded,
        explorer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_is_size_proportional_with_floor() {
        // Small script: well under 1000 estimated bytes → floor of 1 sat.
        assert_eq!(anchor_fee(100), 1);
        // 148 + 34 + 800 + 34 + 10 = 1026 → 2 sats.
        assert_eq!(anchor_fee(800), 2);
        // Exactly 1000 estimated bytes stays at 1 sat.
        assert_eq!(anchor_fee(1000 - 148 - 34 - 34 - 10), 1);
    }
}
