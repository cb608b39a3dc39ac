use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use agora_protocol::codec;
use agora_protocol::message::{is_identity_key, MsgKind};

use agora_node::config::{Cli, Command};
use agora_node::queue::ServiceQueue;
use agora_node::rpc::CollaboratorRpc;
use agora_node::{baemail, router, services, AgentContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Events go to stderr; command results are JSON on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora_node=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let collaborator = CollaboratorRpc::new(&cli.config.wallet_url);
    let ctx = AgentContext::new(
        cli.config,
        Arc::new(collaborator.clone()),
        Arc::new(collaborator),
    );

    let out = run(&ctx, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run(ctx: &AgentContext, command: Command) -> anyhow::Result<Value> {
    match command {
        Command::Register => services::register(ctx).await,
        Command::Unregister => services::unregister(ctx),
        Command::Services => Ok(services::list(ctx)),
        Command::Advertise { service_id, name, price_sats, description } => {
            services::advertise(ctx, &service_id, &name, price_sats, description.as_deref()).await
        }
        Command::Readvertise { service_id, name, price_sats, description } => {
            services::readvertise(
                ctx,
                &service_id,
                name.as_deref(),
                price_sats,
                description.as_deref(),
            )
            .await
        }
        Command::Remove { service_id } => services::remove(ctx, &service_id),
        Command::Discover { service, agent } => {
            services::discover(ctx, service.as_deref(), agent.as_deref()).await
        }

        Command::Send { to, kind, payload } => send(ctx, &to, &kind, &payload).await,
        Command::Inbox { since } => inbox(ctx, since.as_deref()).await,
        Command::Ack { message_ids } => {
            let identity_key = ctx.identity_key().await?;
            let acked = ctx.overlay.ack(&identity_key, &message_ids).await?;
            Ok(json!({ "acked": acked, "messageIds": message_ids }))
        }
        Command::Poll => {
            let identity_key = ctx.identity_key().await?;
            let summary = router::poll_once(ctx, &identity_key).await?;
            Ok(serde_json::to_value(summary)?)
        }
        Command::Connect => {
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    signal_cancel.cancel();
                }
            });
            router::run_connected(ctx, &cancel).await?;
            Ok(json!({ "disconnected": true }))
        }

        Command::RequestService { to, service_id, sats, input } => {
            let input = input
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| anyhow::anyhow!("input must be valid JSON: {e}"))?;
            router::request_service(ctx, &to, &service_id, sats, input).await
        }
        Command::RespondService { request_id, to, service_id, result } => {
            let result = serde_json::from_str(&result)
                .map_err(|e| anyhow::anyhow!("result must be valid JSON: {e}"))?;
            router::respond_service(ctx, &request_id, &to, &service_id, result).await
        }
        Command::Queue => {
            let pending = ServiceQueue::new(ctx.state.clone()).list_pending()?;
            Ok(json!({ "pending": pending, "count": pending.len() }))
        }
        Command::Balance => {
            let handle = ctx.wallet.load().await?;
            let balance = handle.balance().await;
            if let Err(e) = handle.destroy().await {
                tracing::warn!(error = %e, "wallet handle release failed");
            }
            Ok(json!({ "satoshis": balance? }))
        }

        Command::BaemailSetup { channel, standard, priority, urgent } => {
            baemail::setup(ctx, &channel, standard, priority, urgent)
        }
        Command::BaemailConfig => baemail::show_config(ctx),
        Command::BaemailBlock { identity_key } => baemail::block(ctx, &identity_key),
        Command::BaemailUnblock { identity_key } => baemail::unblock(ctx, &identity_key),
        Command::BaemailLog { limit } => baemail::recent_log(ctx, limit),
        Command::BaemailRefund { request_id } => baemail::refund(ctx, &request_id).await,
    }
}

async fn send(ctx: &AgentContext, to: &str, kind: &str, payload: &str) -> anyhow::Result<Value> {
    if !is_identity_key(to) {
        anyhow::bail!("target must be a compressed public key (66 hex chars, 02/03 prefix)");
    }
    let payload: Value = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("payload must be valid JSON: {e}"))?;
    let identity_key = ctx.identity_key().await?;
    let kind = MsgKind::from(kind);
    let id = ctx.send_signed(&identity_key, to, kind.clone(), payload).await?;
    Ok(json!({
        "sent": true,
        "messageId": id,
        "to": to,
        "type": kind,
        "signed": true,
    }))
}

async fn inbox(ctx: &AgentContext, since: Option<&str>) -> anyhow::Result<Value> {
    let identity_key = ctx.identity_key().await?;
    let inbox = ctx.overlay.inbox(&identity_key, since).await?;

    // Annotate each message with its signature status; unsigned ones stay
    // flagged as null.
    let mut messages = Vec::with_capacity(inbox.messages.len());
    for msg in &inbox.messages {
        let signature_valid = match msg.signature.as_deref() {
            Some(sig) => Some(
                codec::verify(
                    ctx.ledger.as_ref(),
                    &msg.from,
                    &msg.to,
                    &msg.kind,
                    &msg.payload,
                    Some(sig),
                )
                .await
                .valid,
            ),
            None => None,
        };
        let mut annotated = serde_json::to_value(msg)?;
        annotated["signatureValid"] = json!(signature_valid);
        messages.push(annotated);
    }

    Ok(json!({
        "messages": messages,
        "count": messages.len(),
        "identityKey": identity_key,
    }))
}
