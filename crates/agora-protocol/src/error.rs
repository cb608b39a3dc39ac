use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload too large for OP_RETURN: {size} bytes exceeds {limit}")]
    PushdataTooLarge { size: usize, limit: usize },

    #[error("script is not an OP_RETURN output")]
    NotOpReturn,

    #[error("truncated pushdata at offset {offset}")]
    TruncatedPushdata { offset: usize },

    #[error("invalid identity key: {0}")]
    InvalidIdentityKey(String),

    #[error("invalid hex in merkle node at level {level}: {reason}")]
    InvalidMerkleNode { level: usize, reason: String },

    #[error("JSON encode error: {0}")]
    JsonEncode(String),
}
