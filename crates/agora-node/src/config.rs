use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Block-explorer API base for this network.
    pub fn explorer_base(&self) -> String {
        let net = match self {
            Self::Mainnet => "main",
            Self::Testnet => "test",
        };
        format!("https://api.whatsonchain.com/v1/bsv/{net}")
    }

    /// Human-facing explorer URL for a transaction.
    pub fn explorer_tx_url(&self, txid: &str) -> String {
        let prefix = match self {
            Self::Mainnet => "",
            Self::Testnet => "test.",
        };
        format!("https://{prefix}whatsonchain.com/tx/{txid}")
    }
}

#[derive(Parser, Debug)]
#[command(name = "agora-node", about = "Agora overlay agent node")]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Overlay server base URL (relay messaging + anchor submission/lookup).
    #[arg(long, env = "AGORA_OVERLAY_URL", default_value = "https://overlay.agora.network")]
    pub overlay_url: String,

    /// Ledger network.
    #[arg(long, env = "AGORA_NETWORK", value_enum, default_value_t = Network::Mainnet)]
    pub network: Network,

    /// State directory for registration, services, queues, and stored change.
    /// Defaults to ~/.agora.
    #[arg(long, env = "AGORA_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Block-explorer API base override (self-hosted indexer or tests).
    #[arg(long, env = "AGORA_EXPLORER_URL")]
    pub explorer_url: Option<String>,

    /// Explorer API key for rate-limit bypass (sent as a bearer token).
    #[arg(long, env = "AGORA_EXPLORER_API_KEY")]
    pub explorer_api_key: Option<String>,

    /// Wallet/ledger collaborator JSON-RPC endpoint.
    /// Holds the keys; this node never touches key material directly.
    #[arg(long, env = "AGORA_WALLET_URL", default_value = "http://127.0.0.1:3321")]
    pub wallet_url: String,

    /// Display name published in the on-chain identity record.
    #[arg(long, env = "AGORA_AGENT_NAME", default_value = "agora-agent")]
    pub agent_name: String,

    /// Description published in the on-chain identity record.
    #[arg(long, env = "AGORA_AGENT_DESCRIPTION", default_value = "An agora overlay network agent")]
    pub agent_description: String,

    /// Delivery gateway URL for the paid-message service. Paid messages are
    /// rejected (payment uncaptured) when this is absent.
    #[arg(long, env = "AGORA_DELIVERY_GATEWAY_URL")]
    pub delivery_gateway_url: Option<String>,

    /// Bearer token for the delivery gateway.
    #[arg(long, env = "AGORA_DELIVERY_GATEWAY_TOKEN")]
    pub delivery_gateway_token: Option<String>,
}

impl Config {
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".agora")
        })
    }

    pub fn explorer_base(&self) -> String {
        self.explorer_url
            .clone()
            .unwrap_or_else(|| self.network.explorer_base())
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish this agent's identity record on the overlay.
    Register,
    /// Remove the local registration record (on-chain records remain).
    Unregister,
    /// List locally advertised services.
    Services,
    /// Advertise a new paid service on the overlay.
    Advertise {
        service_id: String,
        name: String,
        price_sats: u64,
        description: Option<String>,
    },
    /// Update and republish an existing service advertisement.
    Readvertise {
        service_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        price_sats: Option<u64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove a service from the local registry.
    Remove { service_id: String },
    /// Query the overlay for registered agents and services.
    Discover {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Send a signed typed message to another agent.
    Send {
        to: String,
        #[arg(value_name = "TYPE")]
        kind: String,
        payload: String,
    },
    /// Fetch pending relay messages.
    Inbox {
        #[arg(long)]
        since: Option<String>,
    },
    /// Acknowledge processed relay messages.
    Ack { message_ids: Vec<String> },
    /// Fetch and process all pending messages, then ack them.
    Poll,
    /// Subscribe to the relay over WebSocket and process messages until
    /// interrupted.
    Connect,
    /// Send a paid service request to another agent.
    RequestService {
        to: String,
        service_id: String,
        #[arg(default_value_t = 5)]
        sats: u64,
        input: Option<String>,
    },
    /// Send a fulfilled service response and mark the queue entry done.
    RespondService {
        request_id: String,
        to: String,
        service_id: String,
        result: String,
    },
    /// List pending service-queue entries.
    Queue,
    /// Show the wallet balance.
    Balance,
    /// Configure the paid-message service.
    BaemailSetup {
        channel: String,
        standard: u64,
        priority: Option<u64>,
        urgent: Option<u64>,
    },
    /// Show the paid-message service configuration.
    BaemailConfig,
    /// Block a sender from the paid-message service.
    BaemailBlock { identity_key: String },
    /// Unblock a sender.
    BaemailUnblock { identity_key: String },
    /// Show recent paid-message deliveries.
    BaemailLog {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Refund a failed paid-message delivery.
    BaemailRefund { request_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explorer_base_follows_network() {
        assert!(Network::Mainnet.explorer_base().ends_with("/main"));
        assert!(Network::Testnet.explorer_base().ends_with("/test"));
    }

    #[test]
    fn explorer_override_wins() {
        let cli = Cli::parse_from([
            "agora-node",
            "--explorer-url",
            "http://127.0.0.1:9999",
            "--network",
            "testnet",
            "poll",
        ]);
        assert_eq!(cli.config.explorer_base(), "http://127.0.0.1:9999");
    }

    #[test]
    fn tx_url_uses_test_prefix_on_testnet() {
        assert_eq!(
            Network::Testnet.explorer_tx_url("ab"),
            "https://test.whatsonchain.com/tx/ab"
        );
    }
}
