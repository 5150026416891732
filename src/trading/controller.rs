//! Session controller: owns the session and drives every component from
//! inbound events.
//!
//! The controller performs no IO. Each handler is one atomic transition
//! that returns the [`Action`]s the runtime must carry out.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::api::{ProposalRequest, Request};
use crate::error::TradingError;
use crate::models::{HaltReason, PendingOrder, Session};

use super::{
    Action, BotParams, Clock, Dispatch, OrderSequencer, ProposalOutcome, QuoteIngestor,
    RiskMonitor, SequencerState, SessionEvent, SettlementNotice, SignalEvaluator, StakePolicy,
    StakeState, StatusEvent, TradingConfig, Wake,
};

pub struct SessionController {
    config: TradingConfig,
    clock: Arc<dyn Clock>,
    risk: RiskMonitor,
    sequencer: OrderSequencer,
    session: Option<Session>,
    span: Span,
}

impl SessionController {
    pub fn new(config: TradingConfig, clock: Arc<dyn Clock>) -> Self {
        let risk = RiskMonitor::new(config.stop_loss_mode);
        let sequencer = OrderSequencer::new(config.proposal_spacing());
        Self {
            config,
            clock,
            risk,
            sequencer,
            session: None,
            span: Span::none(),
        }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn sequencer(&self) -> &OrderSequencer {
        &self.sequencer
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().map(|s| s.running).unwrap_or(false)
    }

    /// A session exists, has stopped, and nothing is in flight.
    pub fn is_finished(&self) -> bool {
        self.session.as_ref().map(|s| !s.running).unwrap_or(false) && self.sequencer.is_idle()
    }

    /// Start a new session.
    pub fn start(&mut self, params: &BotParams) -> Result<Vec<Action>, TradingError> {
        if self.is_running() {
            return Err(TradingError::config("a session is already running"));
        }
        if !self.sequencer.is_idle() {
            return Err(TradingError::config(format!(
                "previous order cycle still in flight ({})",
                self.sequencer.state().name()
            )));
        }

        let bot = params.validate()?;
        let mut session = Session::start(&bot, self.config.window);

        let mut actions = Vec::new();
        if let Some(previous) = self.session.take() {
            session.balance = previous.balance;
            actions.push(Action::Send(Request::ForgetAll {
                streams: vec!["ticks".to_string(), "balance".to_string()],
            }));
        }

        let dropped = self.sequencer.clear_queue();
        if dropped > 0 {
            debug!(dropped, "Discarded trade intents from previous session");
        }

        self.span = info_span!("session", id = %session.id, symbol = %session.symbol);
        {
            let _enter = self.span.enter();
            info!(
                stake = %bot.base_stake,
                factor = %bot.martingale_factor,
                max_depth = bot.max_martingale_depth,
                target = %bot.target_profit,
                stop_loss = %bot.stop_loss,
                mode = %self.risk.mode(),
                window = self.config.window,
                "Session started"
            );
        }

        actions.push(Action::Send(Request::TicksHistory {
            symbol: session.symbol.clone(),
            count: self.config.history_count,
        }));
        actions.push(Action::Send(Request::Ticks {
            symbol: session.symbol.clone(),
        }));
        actions.push(Action::Send(Request::Balance));
        actions.push(Action::Publish(StatusEvent::StatusChanged {
            running: true,
            reason: None,
        }));

        self.session = Some(session);
        Ok(actions)
    }

    /// Stop trading. An open contract still settles.
    pub fn stop(&mut self) -> Vec<Action> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut actions = Vec::new();
        match self.session.as_mut() {
            Some(session) => halt(session, HaltReason::Stopped, &mut actions),
            None => debug!("Stop requested with no session"),
        }
        actions
    }

    /// Requests that restore the session's subscriptions after a reconnect.
    ///
    /// A proposal or buy that was in flight when the link dropped will never
    /// be answered, so it is abandoned.
    pub fn resubscribe(&mut self) -> Vec<Action> {
        let span = self.span.clone();
        let _enter = span.enter();

        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };

        let mut actions = vec![
            Action::Send(Request::TicksHistory {
                symbol: session.symbol.clone(),
                count: self.config.history_count,
            }),
            Action::Send(Request::Ticks {
                symbol: session.symbol.clone(),
            }),
            Action::Send(Request::Balance),
        ];

        match self.sequencer.state() {
            SequencerState::ProposalRequested { .. } => {
                warn!("Connection lost with a proposal in flight, abandoning it");
                self.sequencer.on_proposal_failed(None);
            }
            SequencerState::AwaitingBuy { proposal_id, .. } => {
                warn!(proposal_id = %proposal_id, "Connection lost awaiting buy confirmation, abandoning it");
                self.sequencer.on_buy_failed();
            }
            SequencerState::ContractOpen { contract } => {
                actions.push(Action::Send(Request::ProposalOpenContract {
                    contract_id: contract.contract_id,
                }));
            }
            SequencerState::Idle => {}
        }

        actions
    }

    /// Apply one inbound event.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut actions = Vec::new();
        match event {
            SessionEvent::History(prices) => self.on_history(prices, &mut actions),
            SessionEvent::Tick(price) => self.on_tick(price, &mut actions),
            SessionEvent::Balance(amount) => self.on_balance(amount, &mut actions),
            SessionEvent::ProposalAccepted {
                req_id,
                proposal_id,
                ask_price,
            } => self.on_proposal_accepted(req_id, &proposal_id, ask_price, &mut actions),
            SessionEvent::ProposalRejected {
                req_id,
                code,
                message,
            } => self.on_proposal_rejected(req_id, code, message, &mut actions),
            SessionEvent::BuyConfirmed {
                contract_id,
                buy_price,
            } => self.on_buy_confirmed(contract_id, buy_price, &mut actions),
            SessionEvent::BuyRejected { code, message } => {
                self.on_buy_rejected(code, message, &mut actions)
            }
            SessionEvent::Settlement(notice) => self.on_settlement(notice, &mut actions),
            SessionEvent::VenueError { code, message } => {
                report(self.session.as_mut(), TradingError::Venue { code, message }, &mut actions)
            }
            SessionEvent::Wake(wake) => self.on_wake(wake, &mut actions),
        }
        actions
    }

    fn on_history(&mut self, prices: Vec<f64>, actions: &mut Vec<Action>) {
        let Some(session) = self.session.as_mut() else {
            debug!(count = prices.len(), "History received with no session");
            return;
        };

        if let Err(e) = QuoteIngestor::ingest_history(&mut session.ticks, &prices) {
            report(Some(session), e, actions);
            return;
        }

        info!(received = prices.len(), window = session.ticks.len(), "Tick history loaded");
        actions.push(Action::Publish(StatusEvent::History { prices }));
    }

    fn on_tick(&mut self, price: f64, actions: &mut Vec<Action>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Err(e) = QuoteIngestor::ingest_tick(&mut session.ticks, price) {
            report(Some(session), e, actions);
            return;
        }

        let signal = SignalEvaluator::evaluate(&session.ticks);
        actions.push(Action::Publish(StatusEvent::Tick {
            price,
            average: signal.average,
        }));

        if session.running && signal.should_trade {
            debug!(price, average = ?signal.average, "Positive signal");
            self.sequencer.enqueue(PendingOrder::new(
                session.stake,
                session.symbol.clone(),
                self.config.contract_type,
            ));
        }

        self.drain(actions);
    }

    fn on_balance(&mut self, amount: Decimal, actions: &mut Vec<Action>) {
        actions.push(Action::Publish(StatusEvent::Balance { amount }));

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.update_balance(amount);
        debug!(balance = %amount, "Balance updated");

        if session.running {
            if let Some(reason) = self.risk.check(session) {
                halt(session, reason, actions);
            }
        }
    }

    fn on_proposal_accepted(
        &mut self,
        req_id: Option<u64>,
        proposal_id: &str,
        ask_price: Decimal,
        actions: &mut Vec<Action>,
    ) {
        let approve = self
            .session
            .as_ref()
            .map(|s| s.running && SignalEvaluator::evaluate(&s.ticks).should_trade)
            .unwrap_or(false);

        match self.sequencer.on_proposal_accepted(req_id, proposal_id, approve) {
            ProposalOutcome::Buy { proposal_id, order } => {
                info!(
                    proposal_id = %proposal_id,
                    stake = %order.stake,
                    ask_price = %ask_price,
                    "Buying proposal"
                );
                if let Some(session) = self.session.as_mut() {
                    session.mark_entry_balance();
                }
                // Cap at the quoted price; the stake may not survive rounding
                actions.push(Action::Send(Request::Buy {
                    proposal_id,
                    price: ask_price,
                }));
            }
            ProposalOutcome::Abandoned(order) => {
                debug!(stake = %order.stake, "Proposal abandoned");
            }
            ProposalOutcome::Ignored => {
                debug!(req_id = ?req_id, proposal_id = %proposal_id, "Ignoring stale proposal");
            }
        }
    }

    fn on_proposal_rejected(
        &mut self,
        req_id: Option<u64>,
        code: String,
        message: String,
        actions: &mut Vec<Action>,
    ) {
        let err = TradingError::from_venue(code, message);
        if let TradingError::RateLimitExceeded(reason) = &err {
            if self.sequencer.on_rate_limited(req_id) {
                let backoff = self.config.rate_limit_backoff();
                warn!(
                    backoff_ms = backoff.as_millis() as u64,
                    reason = %reason,
                    "Proposal rate limited, retrying"
                );
                actions.push(Action::Schedule {
                    after: backoff,
                    wake: Wake::RetryProposal,
                });
            }
            return;
        }

        if self.sequencer.on_proposal_failed(req_id).is_none() {
            debug!(req_id = ?req_id, "Ignoring stale proposal error: {}", err);
            return;
        }
        report(self.session.as_mut(), err, actions);
    }

    fn on_buy_confirmed(&mut self, contract_id: u64, buy_price: Decimal, actions: &mut Vec<Action>) {
        match self.sequencer.on_buy_confirmed(contract_id, buy_price, Utc::now()) {
            Ok(contract) => {
                info!(
                    contract_id,
                    stake = %contract.entry_stake,
                    buy_price = %contract.buy_price,
                    "Contract bought"
                );
                actions.push(Action::Publish(StatusEvent::ContractBought {
                    contract_id,
                    stake: contract.entry_stake,
                }));
            }
            Err(e) => report(self.session.as_mut(), e, actions),
        }
    }

    fn on_buy_rejected(&mut self, code: String, message: String, actions: &mut Vec<Action>) {
        if self.sequencer.on_buy_failed().is_none() {
            warn!(code = %code, "Buy error with no buy in flight");
        }
        report(self.session.as_mut(), TradingError::Venue { code, message }, actions);
    }

    fn on_settlement(&mut self, notice: SettlementNotice, actions: &mut Vec<Action>) {
        let contract = match self.sequencer.on_settlement(notice.contract_id) {
            Ok(contract) => contract,
            Err(e) => {
                report(self.session.as_mut(), e, actions);
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            warn!(contract_id = contract.contract_id, "Settlement with no session");
            return;
        };

        if let Some(balance) = notice.balance_after {
            session.update_balance(balance);
            actions.push(Action::Publish(StatusEvent::Balance { amount: balance }));
        }

        let trade_delta = session.take_trade_delta();
        let profit = notice
            .profit
            .or_else(|| notice.sold_for.map(|sold| contract.profit_from_sale(sold)))
            .or(trade_delta);
        let Some(profit) = profit else {
            report(
                Some(session),
                TradingError::Venue {
                    code: "MissingProfit".to_string(),
                    message: format!("settlement of contract {} carries no profit", contract.contract_id),
                },
                actions,
            );
            return;
        };

        session.cumulative_profit += profit;
        session.stats.record_settlement(profit);

        let current = StakeState {
            stake: session.stake,
            depth: session.martingale_depth,
        };
        let next = StakePolicy::for_session(session).on_settlement(current, profit);
        session.stake = next.stake;
        session.martingale_depth = next.depth;
        session.stats.largest_stake = session.stats.largest_stake.max(next.stake);
        session.stats.deepest_martingale = session.stats.deepest_martingale.max(next.depth);

        info!(
            contract_id = contract.contract_id,
            profit = %profit,
            cumulative = %session.cumulative_profit,
            next_stake = %next.stake,
            depth = next.depth,
            "Contract settled"
        );
        actions.push(Action::Publish(StatusEvent::ContractSettled {
            contract_id: contract.contract_id,
            profit,
            cumulative_profit: session.cumulative_profit,
            balance: session.balance,
            next_stake: next.stake,
        }));

        if session.running {
            if let Some(reason) = self.risk.check(session) {
                halt(session, reason, actions);
            }
        }
    }

    fn on_wake(&mut self, wake: Wake, actions: &mut Vec<Action>) {
        match wake {
            Wake::Drain => {
                self.sequencer.on_drain_wake();
                self.drain(actions);
            }
            Wake::RetryProposal => {
                if !self.is_running() {
                    if self.sequencer.on_proposal_failed(None).is_some() {
                        debug!("Session stopped during rate-limit backoff, proposal dropped");
                    }
                    return;
                }
                if let Some((order, req_id)) = self.sequencer.retry_proposal(self.clock.now()) {
                    debug!(req_id, stake = %order.stake, "Retrying proposal");
                    actions.push(Action::Send(self.proposal(&order, req_id)));
                }
            }
        }
    }

    fn drain(&mut self, actions: &mut Vec<Action>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        match self.sequencer.poll(self.clock.now(), session.running, session.stake) {
            Some(Dispatch::Propose { order, req_id }) => {
                info!(req_id, stake = %order.stake, symbol = %order.symbol, "Requesting proposal");
                actions.push(Action::Send(self.proposal(&order, req_id)));
            }
            Some(Dispatch::WakeAfter(after)) => {
                debug!(after_ms = after.as_millis() as u64, "Proposal spacing, scheduling drain");
                actions.push(Action::Schedule {
                    after,
                    wake: Wake::Drain,
                });
            }
            None => {}
        }
    }

    fn proposal(&self, order: &PendingOrder, req_id: u64) -> Request {
        Request::Proposal(ProposalRequest {
            req_id,
            amount: order.stake,
            contract_type: order.direction,
            currency: self.config.currency.clone(),
            duration: self.config.duration,
            duration_unit: self.config.duration_unit.clone(),
            symbol: order.symbol.clone(),
        })
    }
}

fn halt(session: &mut Session, reason: HaltReason, actions: &mut Vec<Action>) {
    if session.halt(reason) {
        info!(
            reason = %reason,
            profit = %session.cumulative_profit,
            balance = ?session.balance,
            "Session halted"
        );
        actions.push(Action::Publish(StatusEvent::StatusChanged {
            running: false,
            reason: Some(reason),
        }));
    }
}

fn report(session: Option<&mut Session>, err: TradingError, actions: &mut Vec<Action>) {
    let kind = err.kind();
    if err.halts_trading() {
        error!(kind = %kind, "{}", err);
    } else {
        warn!(kind = %kind, "{}", err);
    }

    actions.push(Action::Publish(StatusEvent::Error {
        kind,
        message: err.to_string(),
    }));

    if err.halts_trading() {
        if let Some(session) = session {
            halt(session, HaltReason::Error(kind), actions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::trading::ManualClock;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn params(factor: f64, depth: u32, target: f64, stop_loss: f64) -> BotParams {
        BotParams {
            symbol: Some("R_100".to_string()),
            base_stake: Some(1.0),
            martingale_factor: Some(factor),
            max_martingale_depth: Some(depth),
            target_profit: Some(target),
            stop_loss: Some(stop_loss),
        }
    }

    fn controller(config: TradingConfig) -> (SessionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (SessionController::new(config, clock.clone()), clock)
    }

    fn started(p: BotParams) -> (SessionController, Arc<ManualClock>) {
        let (mut ctrl, clock) = controller(TradingConfig::default());
        ctrl.start(&p).unwrap();
        ctrl.handle(SessionEvent::History(vec![10.0; 8]));
        (ctrl, clock)
    }

    fn proposal(actions: &[Action]) -> Option<&ProposalRequest> {
        actions.iter().find_map(|a| match a {
            Action::Send(Request::Proposal(p)) => Some(p),
            _ => None,
        })
    }

    fn buy(actions: &[Action]) -> Option<(&str, Decimal)> {
        actions.iter().find_map(|a| match a {
            Action::Send(Request::Buy { proposal_id, price }) => Some((proposal_id.as_str(), *price)),
            _ => None,
        })
    }

    fn published(actions: &[Action]) -> Vec<&StatusEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Publish(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn errors(actions: &[Action]) -> Vec<ErrorKind> {
        published(actions)
            .into_iter()
            .filter_map(|e| match e {
                StatusEvent::Error { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn settle(contract_id: u64, profit: Decimal) -> SessionEvent {
        SessionEvent::Settlement(SettlementNotice {
            contract_id,
            profit: Some(profit),
            ..Default::default()
        })
    }

    /// Drive one full proposal/buy/settle cycle from a rising tick.
    fn cycle(
        ctrl: &mut SessionController,
        clock: &ManualClock,
        price: f64,
        contract_id: u64,
        profit: Decimal,
    ) -> Vec<Action> {
        clock.advance(Duration::from_secs(1));
        let actions = ctrl.handle(SessionEvent::Tick(price));
        let req_id = proposal(&actions).expect("proposal requested").req_id;

        let actions = ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: format!("p-{}", contract_id),
            ask_price: dec!(1),
        });
        let (_, price) = buy(&actions).expect("buy sent");

        ctrl.handle(SessionEvent::BuyConfirmed {
            contract_id,
            buy_price: price,
        });
        ctrl.handle(settle(contract_id, profit))
    }

    #[test]
    fn test_start_rejects_invalid_params() {
        let (mut ctrl, _) = controller(TradingConfig::default());
        let err = ctrl.start(&params(0.0, 2, 5.0, 100.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert!(!ctrl.is_running());
        assert!(ctrl.session().is_none());
    }

    #[test]
    fn test_start_subscribes_and_publishes() {
        let (mut ctrl, _) = controller(TradingConfig::default());
        let actions = ctrl.start(&params(2.0, 2, 5.0, 100.0)).unwrap();

        assert!(actions.contains(&Action::Send(Request::TicksHistory {
            symbol: "R_100".to_string(),
            count: 100,
        })));
        assert!(actions.contains(&Action::Send(Request::Ticks {
            symbol: "R_100".to_string(),
        })));
        assert!(actions.contains(&Action::Send(Request::Balance)));
        assert_eq!(
            published(&actions),
            vec![&StatusEvent::StatusChanged { running: true, reason: None }]
        );
        assert!(ctrl.is_running());
    }

    #[test]
    fn test_start_while_running_fails() {
        let (mut ctrl, _) = started(params(2.0, 2, 5.0, 100.0));
        let err = ctrl.start(&params(2.0, 2, 5.0, 100.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_restart_after_stop_forgets_old_streams() {
        let (mut ctrl, _) = started(params(2.0, 2, 5.0, 100.0));
        ctrl.handle(SessionEvent::Balance(dec!(500)));
        ctrl.stop();

        let actions = ctrl.start(&params(2.0, 2, 5.0, 100.0)).unwrap();
        assert!(matches!(actions[0], Action::Send(Request::ForgetAll { .. })));
        assert_eq!(ctrl.session().unwrap().balance, Some(dec!(500)));
    }

    #[test]
    fn test_start_fails_while_contract_open() {
        let (mut ctrl, _) = started(params(2.0, 2, 5.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;
        ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        ctrl.handle(SessionEvent::BuyConfirmed { contract_id: 1, buy_price: dec!(1) });
        ctrl.stop();

        let err = ctrl.start(&params(2.0, 2, 5.0, 100.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);

        ctrl.handle(settle(1, dec!(0.95)));
        assert!(ctrl.is_finished());
        assert!(ctrl.start(&params(2.0, 2, 5.0, 100.0)).is_ok());
    }

    #[test]
    fn test_end_to_end_martingale_sequence() {
        let (mut ctrl, clock) = started(params(2.0, 2, 5.0, 100.0));

        // First tick above the flat history triggers a trade
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        assert!(published(&actions).contains(&&StatusEvent::Tick {
            price: 11.0,
            average: Some(10.125),
        }));
        let req_id = proposal(&actions).unwrap().req_id;
        let actions = ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        assert_eq!(buy(&actions), Some(("p-1", dec!(1))));
        ctrl.handle(SessionEvent::BuyConfirmed { contract_id: 1, buy_price: dec!(1) });
        ctrl.handle(settle(1, dec!(-1)));

        let s = ctrl.session().unwrap();
        assert_eq!((s.stake, s.cumulative_profit), (dec!(2), dec!(-1)));

        cycle(&mut ctrl, &clock, 12.0, 2, dec!(-2));
        let s = ctrl.session().unwrap();
        assert_eq!((s.stake, s.cumulative_profit), (dec!(4), dec!(-3)));

        cycle(&mut ctrl, &clock, 13.0, 3, dec!(6));
        let s = ctrl.session().unwrap();
        assert_eq!((s.stake, s.cumulative_profit), (dec!(1), dec!(3)));
        assert_eq!(s.martingale_depth, 0);
        assert!(s.running);
        assert_eq!(s.stats.contracts_settled, 3);
        assert_eq!(s.stats.largest_stake, dec!(4));
    }

    #[test]
    fn test_proposal_uses_current_stake() {
        let (mut ctrl, clock) = started(params(2.0, 3, 50.0, 100.0));
        let actions = cycle(&mut ctrl, &clock, 11.0, 1, dec!(-1));
        assert!(published(&actions).iter().any(|e| matches!(
            e,
            StatusEvent::ContractSettled { next_stake, .. } if *next_stake == dec!(2)
        )));

        clock.advance(Duration::from_secs(1));
        let actions = ctrl.handle(SessionEvent::Tick(12.0));
        let p = proposal(&actions).unwrap();
        assert_eq!(p.amount, dec!(2));
        assert_eq!(p.contract_type, crate::models::ContractType::Call);
        assert_eq!(p.duration, 5);
    }

    #[test]
    fn test_intents_queue_while_in_flight() {
        let (mut ctrl, clock) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let first = proposal(&actions).unwrap().req_id;

        // Rising ticks while the proposal is outstanding are queued
        for price in [12.0, 13.0] {
            let actions = ctrl.handle(SessionEvent::Tick(price));
            assert!(proposal(&actions).is_none());
        }
        assert_eq!(ctrl.sequencer().queued(), 2);

        ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(first),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        ctrl.handle(SessionEvent::BuyConfirmed { contract_id: 1, buy_price: dec!(1) });
        ctrl.handle(settle(1, dec!(0.95)));

        clock.advance(Duration::from_secs(1));
        let actions = ctrl.handle(SessionEvent::Tick(14.0));
        assert!(proposal(&actions).unwrap().req_id > first);
        assert_eq!(ctrl.sequencer().queued(), 2);
    }

    #[test]
    fn test_spacing_schedules_drain() {
        let (mut ctrl, clock) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;

        // Signal has turned negative by the time the proposal comes back
        ctrl.handle(SessionEvent::Tick(9.0));
        let actions = ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        assert!(buy(&actions).is_none());
        assert!(ctrl.sequencer().is_idle());

        clock.advance(Duration::from_millis(400));
        let actions = ctrl.handle(SessionEvent::Tick(15.0));
        assert!(proposal(&actions).is_none());
        assert!(actions.contains(&Action::Schedule {
            after: Duration::from_millis(600),
            wake: Wake::Drain,
        }));

        clock.advance(Duration::from_millis(600));
        let actions = ctrl.handle(SessionEvent::Wake(Wake::Drain));
        assert!(proposal(&actions).is_some());
    }

    #[test]
    fn test_rate_limit_retries_silently() {
        let (mut ctrl, clock) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;

        let actions = ctrl.handle(SessionEvent::ProposalRejected {
            req_id: Some(req_id),
            code: "RateLimit".to_string(),
            message: "You have reached the rate limit".to_string(),
        });
        assert_eq!(
            actions,
            vec![Action::Schedule {
                after: Duration::from_secs(1),
                wake: Wake::RetryProposal,
            }]
        );
        assert!(ctrl.is_running());

        clock.advance(Duration::from_secs(1));
        let actions = ctrl.handle(SessionEvent::Wake(Wake::RetryProposal));
        assert_eq!(proposal(&actions).unwrap().req_id, req_id);
    }

    #[test]
    fn test_proposal_error_halts() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;

        let actions = ctrl.handle(SessionEvent::ProposalRejected {
            req_id: Some(req_id),
            code: "ContractBuyValidationError".to_string(),
            message: "Invalid stake".to_string(),
        });
        assert_eq!(errors(&actions), vec![ErrorKind::VenueError]);
        assert!(ctrl.sequencer().is_idle());
        assert!(!ctrl.is_running());
        assert_eq!(
            ctrl.session().unwrap().halt_reason,
            Some(HaltReason::Error(ErrorKind::VenueError))
        );
    }

    #[test]
    fn test_buy_error_returns_to_idle() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;
        ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });

        let actions = ctrl.handle(SessionEvent::BuyRejected {
            code: "InsufficientBalance".to_string(),
            message: "Your account balance is insufficient".to_string(),
        });
        assert_eq!(errors(&actions), vec![ErrorKind::VenueError]);
        assert!(ctrl.sequencer().is_idle());
        assert!(ctrl.is_finished());
    }

    #[test]
    fn test_accepted_after_stop_is_abandoned() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;

        let actions = ctrl.stop();
        assert_eq!(
            published(&actions),
            vec![&StatusEvent::StatusChanged {
                running: false,
                reason: Some(HaltReason::Stopped),
            }]
        );

        let actions = ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        assert!(buy(&actions).is_none());
        assert!(ctrl.is_finished());
    }

    #[test]
    fn test_open_contract_settles_after_stop() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;
        ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        ctrl.handle(SessionEvent::BuyConfirmed { contract_id: 9, buy_price: dec!(1) });
        ctrl.stop();

        ctrl.handle(SessionEvent::Settlement(SettlementNotice {
            contract_id: 9,
            sold_for: Some(dec!(1.95)),
            ..Default::default()
        }));
        let s = ctrl.session().unwrap();
        assert_eq!(s.cumulative_profit, dec!(0.95));
        assert_eq!(s.halt_reason, Some(HaltReason::Stopped));

        // Stopped sessions do not trade
        let actions = ctrl.handle(SessionEvent::Tick(20.0));
        assert!(proposal(&actions).is_none());
        assert_eq!(ctrl.sequencer().queued(), 0);
    }

    #[test]
    fn test_unexpected_settlement_halts() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(settle(77, dec!(1)));
        assert_eq!(errors(&actions), vec![ErrorKind::UnexpectedSettlement]);
        assert!(!ctrl.is_running());
        assert_eq!(ctrl.session().unwrap().cumulative_profit, Decimal::ZERO);
    }

    #[test]
    fn test_invalid_tick_keeps_running() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(f64::NAN));
        assert_eq!(errors(&actions), vec![ErrorKind::InvalidQuote]);
        assert!(ctrl.is_running());
        assert_eq!(ctrl.session().unwrap().ticks.len(), 8);
    }

    #[test]
    fn test_no_trade_before_window_full() {
        let (mut ctrl, _) = controller(TradingConfig::default());
        ctrl.start(&params(2.0, 3, 50.0, 100.0)).unwrap();
        for price in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0] {
            let actions = ctrl.handle(SessionEvent::Tick(price));
            assert!(proposal(&actions).is_none());
        }
        let actions = ctrl.handle(SessionEvent::Tick(8.0));
        assert!(proposal(&actions).is_some());
    }

    #[test]
    fn test_target_reached_halts_after_settlement() {
        let (mut ctrl, clock) = started(params(2.0, 3, 10.0, 100.0));
        cycle(&mut ctrl, &clock, 11.0, 1, dec!(3));
        cycle(&mut ctrl, &clock, 12.0, 2, dec!(4));
        assert!(ctrl.is_running());

        let actions = cycle(&mut ctrl, &clock, 13.0, 3, dec!(5));
        assert!(published(&actions).contains(&&StatusEvent::StatusChanged {
            running: false,
            reason: Some(HaltReason::TargetReached),
        }));
        assert!(ctrl.is_finished());
    }

    #[test]
    fn test_balance_floor_halts_on_balance() {
        let (mut ctrl, _) = started(params(2.0, 3, 1000.0, 200.0));
        for amount in [dec!(500), dec!(350)] {
            ctrl.handle(SessionEvent::Balance(amount));
            assert!(ctrl.is_running());
        }
        let actions = ctrl.handle(SessionEvent::Balance(dec!(190)));
        assert!(published(&actions).contains(&&StatusEvent::StatusChanged {
            running: false,
            reason: Some(HaltReason::StopLossReached),
        }));
    }

    /// Buy a contract at a stake of 1 with the account at 100, without a
    /// profit field on the eventual settlement.
    fn bought_at_balance_100(contract_id: u64) -> SessionController {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 1.0));
        ctrl.handle(SessionEvent::Balance(dec!(100)));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;
        ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        ctrl.handle(SessionEvent::BuyConfirmed { contract_id, buy_price: dec!(1) });
        ctrl.handle(SessionEvent::Balance(dec!(99)));
        ctrl
    }

    #[test]
    fn test_profit_from_balance_delta() {
        let mut ctrl = bought_at_balance_100(4);
        ctrl.handle(SessionEvent::Settlement(SettlementNotice {
            contract_id: 4,
            balance_after: Some(dec!(100.95)),
            ..Default::default()
        }));

        let s = ctrl.session().unwrap();
        assert_eq!(s.cumulative_profit, dec!(0.95));
        assert_eq!(s.stake, dec!(1));
        assert_eq!(s.stats.wins, 1);
    }

    #[test]
    fn test_loss_from_balance_delta_escalates() {
        let mut ctrl = bought_at_balance_100(5);
        ctrl.handle(SessionEvent::Settlement(SettlementNotice {
            contract_id: 5,
            balance_after: Some(dec!(99)),
            ..Default::default()
        }));

        let s = ctrl.session().unwrap();
        assert_eq!(s.cumulative_profit, dec!(-1));
        assert_eq!((s.stake, s.martingale_depth), (dec!(2), 1));
        assert_eq!((s.stats.wins, s.stats.losses), (0, 1));
    }

    #[test]
    fn test_buy_capped_at_quoted_price() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;

        let actions = ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1.02),
        });
        assert_eq!(buy(&actions), Some(("p-1", dec!(1.02))));
    }

    #[test]
    fn test_retry_after_stop_drops_proposal() {
        let (mut ctrl, clock) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;
        ctrl.handle(SessionEvent::ProposalRejected {
            req_id: Some(req_id),
            code: "RateLimit".to_string(),
            message: "You have reached the rate limit".to_string(),
        });
        ctrl.stop();

        clock.advance(Duration::from_secs(1));
        let actions = ctrl.handle(SessionEvent::Wake(Wake::RetryProposal));
        assert!(proposal(&actions).is_none());
        assert!(errors(&actions).is_empty());
        assert!(ctrl.sequencer().is_idle());
        assert!(ctrl.is_finished());
    }

    #[test]
    fn test_cumulative_loss_mode() {
        let config = TradingConfig {
            stop_loss_mode: crate::trading::StopLossMode::CumulativeLoss,
            ..Default::default()
        };
        let (mut ctrl, clock) = controller(config);
        ctrl.start(&params(2.0, 3, 50.0, 3.0)).unwrap();
        ctrl.handle(SessionEvent::History(vec![10.0; 8]));

        cycle(&mut ctrl, &clock, 11.0, 1, dec!(-1));
        assert!(ctrl.is_running());
        let actions = cycle(&mut ctrl, &clock, 12.0, 2, dec!(-2));
        assert!(published(&actions).contains(&&StatusEvent::StatusChanged {
            running: false,
            reason: Some(HaltReason::StopLossReached),
        }));
    }

    #[test]
    fn test_resubscribe_abandons_in_flight_proposal() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        ctrl.handle(SessionEvent::Tick(11.0));

        let actions = ctrl.resubscribe();
        assert!(actions.contains(&Action::Send(Request::Balance)));
        assert!(ctrl.sequencer().is_idle());
    }

    #[test]
    fn test_resubscribe_restores_open_contract_stream() {
        let (mut ctrl, _) = started(params(2.0, 3, 50.0, 100.0));
        let actions = ctrl.handle(SessionEvent::Tick(11.0));
        let req_id = proposal(&actions).unwrap().req_id;
        ctrl.handle(SessionEvent::ProposalAccepted {
            req_id: Some(req_id),
            proposal_id: "p-1".to_string(),
            ask_price: dec!(1),
        });
        ctrl.handle(SessionEvent::BuyConfirmed { contract_id: 12, buy_price: dec!(1) });

        let actions = ctrl.resubscribe();
        assert!(actions.contains(&Action::Send(Request::ProposalOpenContract { contract_id: 12 })));
    }
}
