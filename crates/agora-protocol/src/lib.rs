pub mod codec;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod message;
pub mod opreturn;

pub use constants::*;
pub use error::ProtocolError;
pub use ledger::{LedgerCrypto, LedgerError};
pub use message::{MsgKind, RelayMessage};
