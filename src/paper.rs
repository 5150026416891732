//! Paper venue: answers proposals and buys locally and settles contracts
//! against the live (or replayed) tick stream.
//!
//! Replies are ordinary [`Response`]s, so the runtime treats paper and live
//! trading the same way.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::{ApiError, OpenContract, ProposalRequest, Request, Response, VenueMessage};
use crate::models::ContractType;

/// Paper trading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    pub initial_balance: Decimal,
    /// Profit paid on a winning contract, as a fraction of the stake
    pub payout_rate: Decimal,
    /// Ticks after the entry tick until a contract settles
    pub duration_ticks: u32,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            payout_rate: dec!(0.95),
            duration_ticks: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct PaperProposal {
    stake: Decimal,
    contract_type: ContractType,
}

#[derive(Debug, Clone)]
struct PaperContract {
    contract_id: u64,
    stake: Decimal,
    contract_type: ContractType,
    /// First tick after the buy
    entry: Option<f64>,
    ticks_seen: u32,
}

/// Simulated order venue.
pub struct PaperVenue {
    config: PaperConfig,
    balance: Decimal,
    next_id: u64,
    proposals: HashMap<String, PaperProposal>,
    open: Vec<PaperContract>,
}

impl PaperVenue {
    pub fn new(config: PaperConfig) -> Self {
        let balance = config.initial_balance;
        Self {
            config,
            balance,
            next_id: 1,
            proposals: HashMap::new(),
            open: Vec::new(),
        }
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn open_contracts(&self) -> usize {
        self.open.len()
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn balance_message(&self) -> Response {
        reply(VenueMessage::Balance {
            amount: self.balance,
            currency: "USD".to_string(),
        })
    }

    /// Answer a request locally.
    ///
    /// Returns `None` for market-data requests, which the paper venue does
    /// not serve.
    pub fn submit(&mut self, request: &Request) -> Option<Vec<Response>> {
        match request {
            Request::Authorize { .. } | Request::TicksHistory { .. } | Request::Ticks { .. } => None,
            Request::Balance => Some(vec![self.balance_message()]),
            Request::Proposal(p) => Some(vec![self.propose(p)]),
            Request::Buy { proposal_id, price } => Some(self.buy(proposal_id, *price)),
            Request::ProposalOpenContract { contract_id } => {
                let known = self.open.iter().any(|c| c.contract_id == *contract_id);
                let contract = OpenContract {
                    contract_id: known.then_some(*contract_id),
                    ..Default::default()
                };
                Some(vec![reply(VenueMessage::OpenContract(contract))])
            }
            Request::Forget { .. } | Request::ForgetAll { .. } => {
                Some(vec![reply(VenueMessage::Forgotten)])
            }
            Request::Ping => Some(vec![reply(VenueMessage::Pong)]),
        }
    }

    fn propose(&mut self, request: &ProposalRequest) -> Response {
        let id = format!("paper-{}", self.next_id());
        let payout = request.amount + request.amount * self.config.payout_rate;
        self.proposals.insert(
            id.clone(),
            PaperProposal {
                stake: request.amount,
                contract_type: request.contract_type,
            },
        );

        Response {
            req_id: Some(request.req_id),
            subscription_id: None,
            message: VenueMessage::Proposal {
                id,
                ask_price: request.amount,
                payout,
            },
        }
    }

    fn buy(&mut self, proposal_id: &str, price: Decimal) -> Vec<Response> {
        let Some(proposal) = self.proposals.remove(proposal_id) else {
            return vec![buy_error("InvalidContractProposal", "Proposal not found or expired")];
        };
        if price < proposal.stake {
            return vec![buy_error("PriceMoved", "Contract price exceeds the requested price")];
        }
        if proposal.stake > self.balance {
            return vec![buy_error("InsufficientBalance", "Your account balance is insufficient")];
        }

        self.balance -= proposal.stake;
        let contract_id = self.next_id();
        self.open.push(PaperContract {
            contract_id,
            stake: proposal.stake,
            contract_type: proposal.contract_type,
            entry: None,
            ticks_seen: 0,
        });
        debug!(contract_id, stake = %proposal.stake, balance = %self.balance, "Paper contract bought");

        vec![
            reply(VenueMessage::Buy {
                contract_id,
                buy_price: proposal.stake,
                balance_after: Some(self.balance),
            }),
            self.balance_message(),
        ]
    }

    /// Advance open contracts by one tick, settling those that expire.
    pub fn on_tick(&mut self, quote: f64) -> Vec<Response> {
        if !quote.is_finite() {
            return Vec::new();
        }

        let duration = self.config.duration_ticks;
        let mut expired = Vec::new();
        self.open.retain_mut(|contract| match contract.entry {
            None => {
                contract.entry = Some(quote);
                true
            }
            Some(_) => {
                contract.ticks_seen += 1;
                if contract.ticks_seen >= duration {
                    expired.push(contract.clone());
                    false
                } else {
                    true
                }
            }
        });

        let mut responses = Vec::new();
        for contract in expired {
            let entry = contract.entry.unwrap_or(quote);
            let won = contract.contract_type.wins(entry, quote);
            let sell_price = if won {
                contract.stake + contract.stake * self.config.payout_rate
            } else {
                Decimal::ZERO
            };
            let profit = sell_price - contract.stake;
            self.balance += sell_price;

            info!(
                contract_id = contract.contract_id,
                entry,
                exit = quote,
                profit = %profit,
                balance = %self.balance,
                "Paper contract settled"
            );

            responses.push(reply(VenueMessage::OpenContract(OpenContract {
                contract_id: Some(contract.contract_id),
                is_sold: 1,
                profit: Some(profit),
                buy_price: Some(contract.stake),
                sell_price: Some(sell_price),
                status: Some(if won { "won" } else { "lost" }.to_string()),
            })));
        }
        if !responses.is_empty() {
            responses.push(self.balance_message());
        }
        responses
    }
}

fn reply(message: VenueMessage) -> Response {
    Response {
        req_id: None,
        subscription_id: None,
        message,
    }
}

fn buy_error(code: &str, message: &str) -> Response {
    reply(VenueMessage::Error {
        msg_type: "buy".to_string(),
        error: ApiError {
            code: code.to_string(),
            message: message.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(amount: Decimal) -> Request {
        Request::Proposal(ProposalRequest {
            req_id: 1,
            amount,
            contract_type: ContractType::Call,
            currency: "USD".to_string(),
            duration: 5,
            duration_unit: "t".to_string(),
            symbol: "R_100".to_string(),
        })
    }

    fn proposal_id(responses: &[Response]) -> String {
        match &responses[0].message {
            VenueMessage::Proposal { id, .. } => id.clone(),
            other => panic!("expected proposal, got {:?}", other),
        }
    }

    fn buy(venue: &mut PaperVenue, stake: Decimal) -> u64 {
        let id = proposal_id(&venue.submit(&proposal(stake)).unwrap());
        let responses = venue
            .submit(&Request::Buy {
                proposal_id: id,
                price: stake,
            })
            .unwrap();
        match &responses[0].message {
            VenueMessage::Buy { contract_id, .. } => *contract_id,
            other => panic!("expected buy, got {:?}", other),
        }
    }

    fn settlement(responses: &[Response]) -> Option<&OpenContract> {
        responses.iter().find_map(|r| match &r.message {
            VenueMessage::OpenContract(c) if c.is_sold() => Some(c),
            _ => None,
        })
    }

    #[test]
    fn test_market_data_not_served() {
        let mut venue = PaperVenue::new(PaperConfig::default());
        assert!(venue.submit(&Request::Ticks { symbol: "R_100".to_string() }).is_none());
        assert!(venue.submit(&Request::Balance).is_some());
    }

    #[test]
    fn test_proposal_echoes_req_id() {
        let mut venue = PaperVenue::new(PaperConfig::default());
        let responses = venue.submit(&proposal(dec!(2))).unwrap();
        assert_eq!(responses[0].req_id, Some(1));
        match &responses[0].message {
            VenueMessage::Proposal { ask_price, payout, .. } => {
                assert_eq!(*ask_price, dec!(2));
                assert_eq!(*payout, dec!(3.90));
            }
            other => panic!("expected proposal, got {:?}", other),
        }
    }

    #[test]
    fn test_winning_call_pays_out() {
        let mut venue = PaperVenue::new(PaperConfig {
            initial_balance: dec!(100),
            payout_rate: dec!(0.95),
            duration_ticks: 2,
        });
        let contract_id = buy(&mut venue, dec!(10));
        assert_eq!(venue.balance(), dec!(90));

        assert!(settlement(&venue.on_tick(100.0)).is_none()); // entry
        assert!(settlement(&venue.on_tick(100.5)).is_none());
        let responses = venue.on_tick(101.0);
        let sold = settlement(&responses).unwrap();

        assert_eq!(sold.contract_id, Some(contract_id));
        assert_eq!(sold.profit, Some(dec!(9.50)));
        assert_eq!(venue.balance(), dec!(109.50));
        assert_eq!(venue.open_contracts(), 0);
    }

    #[test]
    fn test_flat_exit_loses() {
        let mut venue = PaperVenue::new(PaperConfig {
            initial_balance: dec!(100),
            payout_rate: dec!(0.95),
            duration_ticks: 1,
        });
        buy(&mut venue, dec!(5));
        venue.on_tick(100.0);
        let responses = venue.on_tick(100.0);

        assert_eq!(settlement(&responses).unwrap().profit, Some(dec!(-5)));
        assert_eq!(venue.balance(), dec!(95));
    }

    #[test]
    fn test_buy_rejections() {
        let mut venue = PaperVenue::new(PaperConfig {
            initial_balance: dec!(1),
            ..Default::default()
        });

        let responses = venue
            .submit(&Request::Buy {
                proposal_id: "missing".to_string(),
                price: dec!(1),
            })
            .unwrap();
        assert!(matches!(
            &responses[0].message,
            VenueMessage::Error { error, .. } if error.code == "InvalidContractProposal"
        ));

        let id = proposal_id(&venue.submit(&proposal(dec!(5))).unwrap());
        let responses = venue
            .submit(&Request::Buy {
                proposal_id: id,
                price: dec!(5),
            })
            .unwrap();
        assert!(matches!(
            &responses[0].message,
            VenueMessage::Error { error, .. } if error.code == "InsufficientBalance"
        ));
        assert_eq!(venue.balance(), dec!(1));
    }
}
