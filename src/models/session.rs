//! Session aggregate: configuration, running stake state, and P&L for one run.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::trading::BotConfig;

use super::TickBuffer;

/// Why a session stopped trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Explicit stop command
    Stopped,
    /// Cumulative profit reached the target
    TargetReached,
    /// Stop-loss threshold crossed
    StopLossReached,
    /// A non-recoverable error was reported
    Error(ErrorKind),
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Stopped => write!(f, "stopped"),
            HaltReason::TargetReached => write!(f, "target profit reached"),
            HaltReason::StopLossReached => write!(f, "stop loss reached"),
            HaltReason::Error(kind) => write!(f, "error: {}", kind),
        }
    }
}

/// Settlement counters for the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub contracts_settled: u32,
    pub wins: u32,
    pub losses: u32,
    pub largest_stake: Decimal,
    pub deepest_martingale: u32,
}

impl SessionStats {
    pub fn record_settlement(&mut self, profit: Decimal) {
        self.contracts_settled += 1;
        if profit >= Decimal::ZERO {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
    }

    pub fn win_rate(&self) -> Decimal {
        if self.contracts_settled == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.contracts_settled)
    }
}

/// The single mutable aggregate behind a trading run.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub symbol: String,
    pub running: bool,

    // Stake state
    pub stake: Decimal,
    pub base_stake: Decimal,
    pub martingale_factor: Decimal,
    pub martingale_depth: u32,
    pub max_martingale_depth: u32,

    // Limits
    pub target_profit: Decimal,
    /// Magnitude, compared according to the configured stop-loss mode
    pub stop_loss: Decimal,

    // P&L
    pub cumulative_profit: Decimal,
    pub balance: Option<Decimal>,
    /// Balance when the open contract's buy was sent
    pub previous_balance: Option<Decimal>,

    pub ticks: TickBuffer,
    pub halt_reason: Option<HaltReason>,
    pub started_at: DateTime<Utc>,
    pub stats: SessionStats,
}

impl Session {
    /// Create a running session from validated parameters.
    pub fn start(config: &BotConfig, window: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: config.symbol.clone(),
            running: true,
            stake: config.base_stake,
            base_stake: config.base_stake,
            martingale_factor: config.martingale_factor,
            martingale_depth: 0,
            max_martingale_depth: config.max_martingale_depth,
            target_profit: config.target_profit,
            stop_loss: config.stop_loss,
            cumulative_profit: Decimal::ZERO,
            balance: None,
            previous_balance: None,
            ticks: TickBuffer::new(window),
            halt_reason: None,
            started_at: Utc::now(),
            stats: SessionStats {
                largest_stake: config.base_stake,
                ..Default::default()
            },
        }
    }

    pub fn update_balance(&mut self, amount: Decimal) {
        self.balance = Some(amount);
    }

    /// Remember the balance as it stood before a buy.
    pub fn mark_entry_balance(&mut self) {
        self.previous_balance = self.balance;
    }

    /// Balance change since the last buy was sent, consuming the entry mark.
    ///
    /// The venue debits the stake at purchase, so this is the contract's
    /// profit once its settlement balance is known.
    pub fn take_trade_delta(&mut self) -> Option<Decimal> {
        let entry = self.previous_balance.take()?;
        Some(self.balance? - entry)
    }

    /// Stop trading. Returns false if the session was already halted.
    pub fn halt(&mut self, reason: HaltReason) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.halt_reason = Some(reason);
        true
    }

    pub fn snapshot(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            symbol: self.symbol.clone(),
            running: self.running,
            stake: self.stake,
            martingale_depth: self.martingale_depth,
            cumulative_profit: self.cumulative_profit,
            balance: self.balance,
            halt_reason: self.halt_reason,
            started_at: self.started_at,
            stats: self.stats.clone(),
        }
    }
}

/// Read-only view of a session for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub symbol: String,
    pub running: bool,
    pub stake: Decimal,
    pub martingale_depth: u32,
    pub cumulative_profit: Decimal,
    pub balance: Option<Decimal>,
    pub halt_reason: Option<HaltReason>,
    pub started_at: DateTime<Utc>,
    pub stats: SessionStats,
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Session {} ===", self.id)?;
        writeln!(f, "Symbol:           {}", self.symbol)?;
        writeln!(f, "Started:          {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(
            f,
            "Status:           {}",
            match (self.running, self.halt_reason) {
                (true, _) => "Running".to_string(),
                (false, Some(reason)) => format!("Halted ({})", reason),
                (false, None) => "Stopped".to_string(),
            }
        )?;
        writeln!(f, "Cumulative P&L:   ${:.2}", self.cumulative_profit)?;
        match self.balance {
            Some(balance) => writeln!(f, "Balance:          ${:.2}", balance)?,
            None => writeln!(f, "Balance:          unknown")?,
        }
        writeln!(f, "Next Stake:       ${:.2} (depth {})", self.stake, self.martingale_depth)?;
        writeln!(
            f,
            "Contracts:        {} (Won: {}, Lost: {}, Win rate: {:.1}%)",
            self.stats.contracts_settled,
            self.stats.wins,
            self.stats.losses,
            self.stats.win_rate() * dec!(100)
        )?;
        writeln!(
            f,
            "Largest Stake:    ${:.2} (deepest martingale {})",
            self.stats.largest_stake, self.stats.deepest_martingale
        )?;
        Ok(())
    }
}
