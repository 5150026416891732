//! Inputs and outputs of the session controller.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::api::Request;
use crate::error::ErrorKind;
use crate::models::HaltReason;

use super::Wake;

/// Inbound event, already decoded from the venue protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Historical backfill
    History(Vec<f64>),
    /// Live tick
    Tick(f64),
    /// Account balance update
    Balance(Decimal),
    ProposalAccepted {
        req_id: Option<u64>,
        proposal_id: String,
        ask_price: Decimal,
    },
    ProposalRejected {
        req_id: Option<u64>,
        code: String,
        message: String,
    },
    BuyConfirmed {
        contract_id: u64,
        buy_price: Decimal,
    },
    BuyRejected {
        code: String,
        message: String,
    },
    Settlement(SettlementNotice),
    /// Venue error not tied to a proposal or buy
    VenueError {
        code: String,
        message: String,
    },
    /// Scheduled resumption fired
    Wake(Wake),
}

/// Contract sold, either from the open-contract stream or a sell response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SettlementNotice {
    pub contract_id: u64,
    pub profit: Option<Decimal>,
    pub sold_for: Option<Decimal>,
    /// Account balance after the sale, when the venue reports it
    pub balance_after: Option<Decimal>,
}

/// Work the runtime performs on behalf of the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send a request to the venue
    Send(Request),
    /// Deliver `SessionEvent::Wake(wake)` after the delay
    Schedule { after: Duration, wake: Wake },
    /// Push a status event to the control surface
    Publish(StatusEvent),
}

/// Status pushed to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Tick {
        price: f64,
        average: Option<f64>,
    },
    History {
        prices: Vec<f64>,
    },
    Balance {
        amount: Decimal,
    },
    StatusChanged {
        running: bool,
        reason: Option<HaltReason>,
    },
    ContractBought {
        contract_id: u64,
        stake: Decimal,
    },
    ContractSettled {
        contract_id: u64,
        profit: Decimal,
        cumulative_profit: Decimal,
        balance: Option<Decimal>,
        next_stake: Decimal,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl std::fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusEvent::Tick { price, average } => match average {
                Some(avg) => write!(f, "tick {} (avg {:.4})", price, avg),
                None => write!(f, "tick {}", price),
            },
            StatusEvent::History { prices } => write!(f, "history: {} prices", prices.len()),
            StatusEvent::Balance { amount } => write!(f, "balance ${:.2}", amount),
            StatusEvent::StatusChanged { running, reason } => match (running, reason) {
                (true, _) => write!(f, "session running"),
                (false, Some(reason)) => write!(f, "session halted: {}", reason),
                (false, None) => write!(f, "session stopped"),
            },
            StatusEvent::ContractBought { contract_id, stake } => {
                write!(f, "bought contract {} for ${:.2}", contract_id, stake)
            }
            StatusEvent::ContractSettled {
                contract_id,
                profit,
                cumulative_profit,
                next_stake,
                ..
            } => write!(
                f,
                "contract {} settled: {:+.2} (total {:+.2}, next stake ${:.2})",
                contract_id, profit, cumulative_profit, next_stake
            ),
            StatusEvent::Error { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}
