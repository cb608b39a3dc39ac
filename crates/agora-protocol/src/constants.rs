// ============================================================================
// Protocol constants
// ============================================================================

/// Protocol tag pushed as the first OP_RETURN data item of every anchor.
pub const PROTOCOL_TAG: &str = "agora";

/// Protocol identifier carried in anchor payloads (`"protocol"` field).
pub const PROTOCOL_ID: &str = "agora-overlay-v1";

// --- Overlay topics and lookup services -------------------------------------

/// Topic manager for identity anchor submissions.
pub const TOPIC_IDENTITY: &str = "tm_agora_identity";

/// Topic manager for service advertisement submissions.
pub const TOPIC_SERVICES: &str = "tm_agora_services";

/// Lookup service answering agent identity queries.
pub const LOOKUP_AGENTS: &str = "ls_agora_agents";

/// Lookup service answering service advertisement queries.
pub const LOOKUP_SERVICES: &str = "ls_agora_services";

// --- Anchor funding ----------------------------------------------------------

/// Satoshis carried by the OP_RETURN output itself.
pub const ANCHOR_SATS: u64 = 1;

/// Minimum change worth keeping as a spendable output. Remainders below this
/// are forfeited to the miner fee instead of creating dust.
pub const MIN_CHANGE_SATS: u64 = 200;

/// Upper bound on the fee an anchor transaction may pay.
pub const MAX_FEE_SATS: u64 = 100;

/// Smallest input that can fund an anchor: the OP_RETURN satoshis plus a
/// non-dust change output plus the worst-case fee.
pub const MIN_INPUT_SATS: u64 = ANCHOR_SATS + MIN_CHANGE_SATS + MAX_FEE_SATS;

/// Maximum ancestors kept in a stored-change source chain. Older entries are
/// dropped first; the proof for the dropped ancestor must then come from the
/// explorer again if ever needed.
pub const SOURCE_CHAIN_DEPTH: usize = 10;

/// Largest payload a single OP_RETURN pushdata may carry (two-byte length
/// prefix; no four-byte pushdata support).
pub const MAX_PUSHDATA_LEN: usize = 65_535;

// --- Transport ---------------------------------------------------------------

/// Initial WebSocket reconnect delay.
pub const WS_RECONNECT_INITIAL_MS: u64 = 1_000;

/// Reconnect delay ceiling. The delay doubles per consecutive failure and is
/// reset to the initial value after a successful open.
pub const WS_RECONNECT_MAX_MS: u64 = 30_000;

/// Default retry budget for explorer requests.
pub const FETCH_MAX_RETRIES: u32 = 3;

/// Base of the explorer retry backoff: `min(1000 * 2^attempt, 8000)` ms.
pub const FETCH_BACKOFF_BASE_MS: u64 = 1_000;

/// Explorer retry backoff ceiling.
pub const FETCH_BACKOFF_MAX_MS: u64 = 8_000;

/// Per-attempt timeout for explorer requests.
pub const FETCH_TIMEOUT_MS: u64 = 30_000;

/// Per-request timeout for relay and delivery-gateway requests.
pub const RELAY_TIMEOUT_MS: u64 = 15_000;

// --- Services ----------------------------------------------------------------

/// Price floor applied when a service request names a service with no local
/// advertisement record.
pub const DEFAULT_SERVICE_PRICE_SATS: u64 = 5;

/// Default ceiling on paid-message length (overridable per config).
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4_000;
