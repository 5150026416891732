//! Offline replay of a recorded price series through the controller and the
//! paper venue, on a manual clock.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::Response;
use crate::error::{ErrorKind, TradingError};
use crate::models::SessionSummary;
use crate::paper::{PaperConfig, PaperVenue};
use crate::router::{Inbound, VenueRouter};
use crate::trading::{
    Action, BotParams, Clock, ManualClock, SessionController, SessionEvent, StatusEvent,
    TradingConfig, Wake,
};

/// Load a newline-separated price file. Blank lines and `#` comments are
/// skipped; a CSV line contributes its last column.
pub fn load_prices(path: &Path) -> Result<Vec<f64>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read price file {}", path.display()))?;

    let mut prices = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let field = line.rsplit(',').next().unwrap_or(line).trim();
        match field.parse::<f64>() {
            Ok(price) => prices.push(price),
            // Header row
            Err(_) if prices.is_empty() && line_no == 0 => continue,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("{}:{}: invalid price {:?}", path.display(), line_no + 1, field)
                })
            }
        }
    }
    Ok(prices)
}

/// Outcome of a replay run.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub ticks_replayed: usize,
    pub ticks_total: usize,
    pub final_balance: Decimal,
    /// Paper contracts still open when the series ended
    pub open_contracts: usize,
    pub errors: Vec<(ErrorKind, String)>,
    pub summary: SessionSummary,
}

impl std::fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary)?;
        writeln!(f, "Ticks Replayed:   {} of {}", self.ticks_replayed, self.ticks_total)?;
        writeln!(f, "Paper Balance:    ${:.2}", self.final_balance)?;
        if self.open_contracts > 0 {
            writeln!(f, "Open Contracts:   {}", self.open_contracts)?;
        }
        if !self.errors.is_empty() {
            writeln!(f, "Errors:           {}", self.errors.len())?;
            for (kind, message) in &self.errors {
                writeln!(f, "  - {}: {}", kind, message)?;
            }
        }
        Ok(())
    }
}

/// Drives one session over a fixed price series.
pub struct Replayer {
    controller: SessionController,
    venue: PaperVenue,
    router: VenueRouter,
    clock: Arc<ManualClock>,
    tick_interval: Duration,
    wakes: Vec<(Instant, Wake)>,
    published: Vec<StatusEvent>,
}

impl Replayer {
    pub fn new(config: TradingConfig, paper: PaperConfig, tick_interval: Duration) -> Self {
        let clock = Arc::new(ManualClock::new());
        Self {
            controller: SessionController::new(config, clock.clone()),
            venue: PaperVenue::new(paper),
            router: VenueRouter::new(),
            clock,
            tick_interval,
            wakes: Vec::new(),
            published: Vec::new(),
        }
    }

    /// Status events published so far.
    pub fn published(&self) -> &[StatusEvent] {
        &self.published
    }

    /// Run the session over `prices`, stopping early once it halts and
    /// nothing is left in flight.
    pub fn run(&mut self, params: &BotParams, prices: &[f64]) -> Result<ReplayReport, TradingError> {
        let actions = self.controller.start(params)?;
        self.execute(actions);

        let mut replayed = 0;
        for &price in prices {
            if self.controller.is_finished() {
                break;
            }
            self.clock.advance(self.tick_interval);
            self.fire_due_wakes();

            let responses = self.venue.on_tick(price);
            for response in responses {
                self.deliver(response);
            }

            let actions = self.controller.handle(SessionEvent::Tick(price));
            self.execute(actions);
            replayed += 1;
        }

        if !self.controller.is_finished() {
            debug!("Price series exhausted, stopping session");
            let actions = self.controller.stop();
            self.execute(actions);
        }

        let errors = self
            .published
            .iter()
            .filter_map(|event| match event {
                StatusEvent::Error { kind, message } => Some((*kind, message.clone())),
                _ => None,
            })
            .collect();

        let summary = self
            .controller
            .session()
            .map(|s| s.snapshot())
            .ok_or_else(|| TradingError::config("replay finished without a session"))?;

        info!(
            ticks = replayed,
            profit = %summary.cumulative_profit,
            contracts = summary.stats.contracts_settled,
            "Replay finished"
        );

        Ok(ReplayReport {
            ticks_replayed: replayed,
            ticks_total: prices.len(),
            final_balance: self.venue.balance(),
            open_contracts: self.venue.open_contracts(),
            errors,
            summary,
        })
    }

    fn fire_due_wakes(&mut self) {
        let now = self.clock.now();
        loop {
            let due = self
                .wakes
                .iter()
                .enumerate()
                .filter(|(_, (at, _))| *at <= now)
                .min_by_key(|(_, (at, _))| *at)
                .map(|(i, _)| i);
            let Some(index) = due else {
                break;
            };
            let (_, wake) = self.wakes.remove(index);
            let actions = self.controller.handle(SessionEvent::Wake(wake));
            self.execute(actions);
        }
    }

    fn deliver(&mut self, response: Response) {
        let mut queue = VecDeque::new();
        self.route(response, &mut queue);
        self.drain(queue);
    }

    fn execute(&mut self, actions: Vec<Action>) {
        self.drain(actions.into());
    }

    fn route(&mut self, response: Response, queue: &mut VecDeque<Action>) {
        for inbound in self.router.route(response) {
            match inbound {
                Inbound::Session(event) => queue.extend(self.controller.handle(event)),
                Inbound::Send(request) => {
                    self.venue.submit(&request);
                }
                Inbound::Authorized { .. } => {}
            }
        }
    }

    fn drain(&mut self, mut queue: VecDeque<Action>) {
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(request) => match self.venue.submit(&request) {
                    Some(responses) => {
                        for response in responses {
                            self.route(response, &mut queue);
                        }
                    }
                    None => debug!(request = request.name(), "Not served during replay"),
                },
                Action::Schedule { after, wake } => {
                    self.wakes.push((self.clock.now() + after, wake));
                }
                Action::Publish(event) => {
                    if let StatusEvent::Error { kind, message } = &event {
                        warn!(kind = %kind, "{}", message);
                    }
                    self.published.push(event);
                }
            }
        }
    }
}
