//! Data models for the trading session, tick window, orders, and contracts.

mod order;
mod session;
mod tick_buffer;

pub use order::{Contract, ContractType, PendingOrder};
pub use session::{HaltReason, Session, SessionStats, SessionSummary};
pub use tick_buffer::TickBuffer;
