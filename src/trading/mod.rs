//! Trading logic: quote ingestion, signal, stake sizing, order sequencing,
//! risk limits, and the session controller that drives them.

mod clock;
mod config;
mod controller;
mod events;
mod ingestor;
mod risk;
mod sequencer;
mod signal;
mod stake_policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BotConfig, BotParams, StopLossMode, TradingConfig};
pub use controller::SessionController;
pub use events::{Action, SessionEvent, SettlementNotice, StatusEvent};
pub use ingestor::QuoteIngestor;
pub use risk::RiskMonitor;
pub use sequencer::{Dispatch, OrderSequencer, ProposalOutcome, SequencerState, Wake};
pub use signal::SignalEvaluator;
pub use stake_policy::{StakePolicy, StakeState};
