//! Maps venue responses onto session events.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use crate::api::{Request, Response, VenueMessage};
use crate::trading::{SessionEvent, SettlementNotice};

/// How many settled contract ids are remembered to drop duplicate notices.
const SETTLED_MEMORY: usize = 64;

/// Outcome of routing one response.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Session(SessionEvent),
    Authorized { login_id: String, currency: String },
    /// Request the runtime should send in reaction
    Send(Request),
}

/// Stateful translation from venue messages to controller input.
#[derive(Debug, Default)]
pub struct VenueRouter {
    /// Open-contract stream per contract, forgotten after settlement
    contract_streams: HashMap<u64, String>,
    settled: VecDeque<u64>,
}

impl VenueRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, response: Response) -> Vec<Inbound> {
        let Response {
            req_id,
            subscription_id,
            message,
        } = response;

        match message {
            VenueMessage::Authorized {
                login_id,
                balance,
                currency,
            } => {
                info!(login_id = %login_id, balance = ?balance, currency = %currency, "Authorized");
                vec![Inbound::Authorized { login_id, currency }]
            }
            VenueMessage::History { prices } => vec![Inbound::Session(SessionEvent::History(prices))],
            VenueMessage::Tick { quote, .. } => vec![Inbound::Session(SessionEvent::Tick(quote))],
            VenueMessage::Balance { amount, .. } => {
                vec![Inbound::Session(SessionEvent::Balance(amount))]
            }
            VenueMessage::Proposal { id, ask_price, .. } => {
                vec![Inbound::Session(SessionEvent::ProposalAccepted {
                    req_id,
                    proposal_id: id,
                    ask_price,
                })]
            }
            VenueMessage::Buy {
                contract_id,
                buy_price,
                ..
            } => {
                if let Some(id) = subscription_id {
                    self.contract_streams.insert(contract_id, id);
                }
                vec![Inbound::Session(SessionEvent::BuyConfirmed {
                    contract_id,
                    buy_price,
                })]
            }
            VenueMessage::OpenContract(contract) => {
                let Some(contract_id) = contract.contract_id else {
                    return Vec::new();
                };
                if let Some(id) = subscription_id {
                    self.contract_streams.entry(contract_id).or_insert(id);
                }
                if !contract.is_sold() {
                    return Vec::new();
                }

                let notice = SettlementNotice {
                    contract_id,
                    profit: contract.profit,
                    sold_for: contract.sell_price,
                    balance_after: None,
                };
                self.settle(notice)
            }
            VenueMessage::Sell {
                contract_id: Some(contract_id),
                sold_for,
                balance_after,
            } => self.settle(SettlementNotice {
                contract_id,
                profit: None,
                sold_for: Some(sold_for),
                balance_after,
            }),
            VenueMessage::Sell {
                contract_id: None, ..
            } => {
                warn!("Sell response without contract id");
                Vec::new()
            }
            VenueMessage::Error { msg_type, error } => {
                let event = match msg_type.as_str() {
                    "proposal" => SessionEvent::ProposalRejected {
                        req_id,
                        code: error.code,
                        message: error.message,
                    },
                    "buy" => SessionEvent::BuyRejected {
                        code: error.code,
                        message: error.message,
                    },
                    "forget" | "forget_all" | "ping" => {
                        debug!(msg_type = %msg_type, code = %error.code, "Ignoring housekeeping error");
                        return Vec::new();
                    }
                    _ => SessionEvent::VenueError {
                        code: error.code,
                        message: format!("{}: {}", msg_type, error.message),
                    },
                };
                vec![Inbound::Session(event)]
            }
            VenueMessage::Pong | VenueMessage::Forgotten => Vec::new(),
            VenueMessage::Other(msg_type) => {
                debug!(msg_type = %msg_type, "Ignoring message");
                Vec::new()
            }
        }
    }

    fn settle(&mut self, notice: SettlementNotice) -> Vec<Inbound> {
        let contract_id = notice.contract_id;
        if self.settled.contains(&contract_id) {
            debug!(contract_id, "Duplicate settlement notice");
            return Vec::new();
        }
        self.settled.push_back(contract_id);
        if self.settled.len() > SETTLED_MEMORY {
            self.settled.pop_front();
        }

        let mut inbound = vec![Inbound::Session(SessionEvent::Settlement(notice))];
        if let Some(subscription_id) = self.contract_streams.remove(&contract_id) {
            inbound.push(Inbound::Send(Request::Forget { subscription_id }));
        }
        inbound
    }

    /// Forget stream ids after a reconnect; the venue dropped them.
    pub fn reset_streams(&mut self) {
        self.contract_streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, OpenContract};
    use rust_decimal_macros::dec;

    fn message(message: VenueMessage) -> Response {
        Response {
            req_id: None,
            subscription_id: None,
            message,
        }
    }

    fn sold(contract_id: u64, subscription: Option<&str>) -> Response {
        Response {
            req_id: None,
            subscription_id: subscription.map(str::to_string),
            message: VenueMessage::OpenContract(OpenContract {
                contract_id: Some(contract_id),
                is_sold: 1,
                profit: Some(dec!(-1)),
                sell_price: Some(dec!(0)),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_settlement_forgets_stream() {
        let mut router = VenueRouter::new();
        let routed = router.route(sold(5, Some("poc-5")));

        assert_eq!(routed.len(), 2);
        assert!(matches!(
            &routed[0],
            Inbound::Session(SessionEvent::Settlement(n)) if n.contract_id == 5 && n.profit == Some(dec!(-1))
        ));
        assert_eq!(
            routed[1],
            Inbound::Send(Request::Forget {
                subscription_id: "poc-5".to_string()
            })
        );
    }

    #[test]
    fn test_duplicate_settlement_dropped() {
        let mut router = VenueRouter::new();
        assert_eq!(router.route(sold(5, None)).len(), 1);
        assert!(router.route(sold(5, None)).is_empty());
    }

    #[test]
    fn test_unsold_update_is_silent() {
        let mut router = VenueRouter::new();
        let update = message(VenueMessage::OpenContract(OpenContract {
            contract_id: Some(3),
            ..Default::default()
        }));
        assert!(router.route(update).is_empty());
    }

    #[test]
    fn test_errors_routed_by_request_type() {
        let mut router = VenueRouter::new();
        let error = |msg_type: &str| Response {
            req_id: Some(4),
            subscription_id: None,
            message: VenueMessage::Error {
                msg_type: msg_type.to_string(),
                error: ApiError {
                    code: "RateLimit".to_string(),
                    message: "slow down".to_string(),
                },
            },
        };

        assert!(matches!(
            router.route(error("proposal")).as_slice(),
            [Inbound::Session(SessionEvent::ProposalRejected { req_id: Some(4), .. })]
        ));
        assert!(matches!(
            router.route(error("buy")).as_slice(),
            [Inbound::Session(SessionEvent::BuyRejected { .. })]
        ));
        assert!(matches!(
            router.route(error("balance")).as_slice(),
            [Inbound::Session(SessionEvent::VenueError { .. })]
        ));
        assert!(router.route(error("forget")).is_empty());
    }

    #[test]
    fn test_tick_and_proposal() {
        let mut router = VenueRouter::new();
        assert_eq!(
            router.route(message(VenueMessage::Tick {
                symbol: "R_100".to_string(),
                quote: 101.5,
                epoch: 0,
            })),
            vec![Inbound::Session(SessionEvent::Tick(101.5))]
        );

        let routed = router.route(Response {
            req_id: Some(9),
            subscription_id: None,
            message: VenueMessage::Proposal {
                id: "p".to_string(),
                ask_price: dec!(1),
                payout: dec!(1.95),
            },
        });
        assert_eq!(
            routed,
            vec![Inbound::Session(SessionEvent::ProposalAccepted {
                req_id: Some(9),
                proposal_id: "p".to_string(),
                ask_price: dec!(1),
            })]
        );
    }
}
