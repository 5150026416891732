//! Deriv WebSocket API: message types and transport.

mod client;
mod types;

pub use client::{ClientConfig, DerivClient, DerivHandle, TransportEvent, DEFAULT_APP_ID, DERIV_WS_URL};
pub use types::*;
