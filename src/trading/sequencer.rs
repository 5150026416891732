//! Order sequencer: one proposal/buy/settle cycle at a time.
//!
//! ```text
//! IDLE -> PROPOSAL_REQUESTED -> AWAITING_BUY -> CONTRACT_OPEN -> IDLE
//! ```
//!
//! Trade intents arriving while a cycle is in flight wait in a FIFO queue.
//! Consecutive proposals are spaced by a minimum interval; when a proposal
//! is due early the sequencer asks to be woken up instead of blocking.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::TradingError;
use crate::models::{Contract, PendingOrder};

/// Scheduled resumption of the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Proposal spacing elapsed, try draining the queue
    Drain,
    /// Rate-limit backoff elapsed, resend the in-flight proposal
    RetryProposal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequencerState {
    Idle,
    ProposalRequested { order: PendingOrder, req_id: u64 },
    AwaitingBuy { order: PendingOrder, proposal_id: String },
    ContractOpen { contract: Contract },
}

impl SequencerState {
    pub fn name(&self) -> &'static str {
        match self {
            SequencerState::Idle => "IDLE",
            SequencerState::ProposalRequested { .. } => "PROPOSAL_REQUESTED",
            SequencerState::AwaitingBuy { .. } => "AWAITING_BUY",
            SequencerState::ContractOpen { .. } => "CONTRACT_OPEN",
        }
    }
}

/// What the sequencer wants done after a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Send a proposal request for this order
    Propose { order: PendingOrder, req_id: u64 },
    /// Poll again after this delay
    WakeAfter(Duration),
}

/// Result of a proposal being accepted by the venue.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalOutcome {
    /// Buy the proposal
    Buy { proposal_id: String, order: PendingOrder },
    /// Decision turned negative, quote discarded
    Abandoned(PendingOrder),
    /// Response does not belong to the in-flight proposal
    Ignored,
}

pub struct OrderSequencer {
    state: SequencerState,
    queue: VecDeque<PendingOrder>,
    spacing: Duration,
    last_proposal_at: Option<Instant>,
    drain_scheduled: bool,
    next_req_id: u64,
}

impl OrderSequencer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            state: SequencerState::Idle,
            queue: VecDeque::new(),
            spacing,
            last_proposal_at: None,
            drain_scheduled: false,
            next_req_id: 1,
        }
    }

    /// Drop queued intents from a previous session.
    pub fn clear_queue(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SequencerState::Idle)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn open_contract(&self) -> Option<&Contract> {
        match &self.state {
            SequencerState::ContractOpen { contract } => Some(contract),
            _ => None,
        }
    }

    pub fn enqueue(&mut self, order: PendingOrder) {
        self.queue.push_back(order);
        debug!(queued = self.queue.len(), state = self.state.name(), "Trade intent queued");
    }

    /// Start the next cycle if idle, running, and the spacing allows it.
    ///
    /// The dequeued order is re-priced at `stake`, the session's stake at
    /// the time the proposal is actually sent.
    pub fn poll(&mut self, now: Instant, running: bool, stake: Decimal) -> Option<Dispatch> {
        if !running || !self.is_idle() || self.queue.is_empty() {
            return None;
        }

        if let Some(last) = self.last_proposal_at {
            let due = last + self.spacing;
            if now < due {
                if self.drain_scheduled {
                    return None;
                }
                self.drain_scheduled = true;
                return Some(Dispatch::WakeAfter(due - now));
            }
        }

        let mut order = self.queue.pop_front()?;
        if order.stake != stake {
            debug!(queued_stake = %order.stake, stake = %stake, "Re-pricing queued order");
            order.stake = stake;
        }

        let req_id = self.next_req_id;
        self.next_req_id += 1;
        self.last_proposal_at = Some(now);
        self.state = SequencerState::ProposalRequested {
            order: order.clone(),
            req_id,
        };

        Some(Dispatch::Propose { order, req_id })
    }

    /// The scheduled drain fired.
    pub fn on_drain_wake(&mut self) {
        self.drain_scheduled = false;
    }

    fn is_current_request(&self, req_id: Option<u64>) -> bool {
        match &self.state {
            SequencerState::ProposalRequested { req_id: current, .. } => {
                req_id.map_or(true, |id| id == *current)
            }
            _ => false,
        }
    }

    /// Venue accepted the in-flight proposal. `approve` is the current
    /// trade decision.
    pub fn on_proposal_accepted(
        &mut self,
        req_id: Option<u64>,
        proposal_id: &str,
        approve: bool,
    ) -> ProposalOutcome {
        if !self.is_current_request(req_id) {
            return ProposalOutcome::Ignored;
        }

        let SequencerState::ProposalRequested { order, .. } =
            std::mem::replace(&mut self.state, SequencerState::Idle)
        else {
            return ProposalOutcome::Ignored;
        };

        if approve {
            self.state = SequencerState::AwaitingBuy {
                order: order.clone(),
                proposal_id: proposal_id.to_string(),
            };
            ProposalOutcome::Buy {
                proposal_id: proposal_id.to_string(),
                order,
            }
        } else {
            info!(proposal_id = %proposal_id, stake = %order.stake, "Signal no longer positive, proposal discarded");
            ProposalOutcome::Abandoned(order)
        }
    }

    /// Venue throttled the in-flight proposal. State is kept; returns
    /// whether a retry should be scheduled.
    pub fn on_rate_limited(&mut self, req_id: Option<u64>) -> bool {
        self.is_current_request(req_id)
    }

    /// Backoff elapsed: resend the in-flight proposal.
    pub fn retry_proposal(&mut self, now: Instant) -> Option<(PendingOrder, u64)> {
        match &self.state {
            SequencerState::ProposalRequested { order, req_id } => {
                self.last_proposal_at = Some(now);
                Some((order.clone(), *req_id))
            }
            _ => None,
        }
    }

    /// Venue rejected the in-flight proposal.
    pub fn on_proposal_failed(&mut self, req_id: Option<u64>) -> Option<PendingOrder> {
        if !self.is_current_request(req_id) {
            return None;
        }
        match std::mem::replace(&mut self.state, SequencerState::Idle) {
            SequencerState::ProposalRequested { order, .. } => Some(order),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Venue confirmed the buy.
    pub fn on_buy_confirmed(
        &mut self,
        contract_id: u64,
        buy_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Result<Contract, TradingError> {
        match std::mem::replace(&mut self.state, SequencerState::Idle) {
            SequencerState::AwaitingBuy { order, .. } => {
                let contract = Contract {
                    contract_id,
                    symbol: order.symbol,
                    direction: order.direction,
                    entry_stake: order.stake,
                    buy_price,
                    opened_at,
                };
                self.state = SequencerState::ContractOpen {
                    contract: contract.clone(),
                };
                Ok(contract)
            }
            other => {
                let state = other.name();
                self.state = other;
                Err(TradingError::Venue {
                    code: "UnexpectedBuy".to_string(),
                    message: format!("buy confirmation for contract {} while {}", contract_id, state),
                })
            }
        }
    }

    /// Venue rejected the buy.
    pub fn on_buy_failed(&mut self) -> Option<PendingOrder> {
        match std::mem::replace(&mut self.state, SequencerState::Idle) {
            SequencerState::AwaitingBuy { order, .. } => Some(order),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Settlement of the open contract. Any other contract id is a
    /// protocol error and leaves the state untouched.
    pub fn on_settlement(&mut self, contract_id: u64) -> Result<Contract, TradingError> {
        match std::mem::replace(&mut self.state, SequencerState::Idle) {
            SequencerState::ContractOpen { contract } if contract.contract_id == contract_id => {
                Ok(contract)
            }
            other => {
                let open = match &other {
                    SequencerState::ContractOpen { contract } => Some(contract.contract_id),
                    _ => None,
                };
                self.state = other;
                Err(TradingError::UnexpectedSettlement { contract_id, open })
            }
        }
    }
}
