//! LLM 网关客户端：REST 调用、流式会话与本地费用账本

pub mod catalog;
pub mod channel;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod http;
pub mod ledger;
pub mod session;
pub mod types;

pub use client::GatewayClient;
pub use config::{BudgetConfig, GatewayConfig};
pub use error::LLMError;
pub use ledger::{CostLedger, CostSummary};
pub use session::{SessionHandle, SessionObserver, SessionState, StreamingSession};
pub use types::*;
