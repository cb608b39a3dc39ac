pub mod anchor;
pub mod baemail;
pub mod config;
pub mod context;
pub mod explorer;
pub mod payment;
pub mod queue;
pub mod relay;
pub mod router;
pub mod rpc;
pub mod services;
pub mod storage;
pub mod wallet;

pub use context::AgentContext;
