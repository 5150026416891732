//! Profit target and stop-loss limits.

use tracing::debug;

use crate::models::{HaltReason, Session};

use super::StopLossMode;

/// Decides when a session must stop trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskMonitor {
    mode: StopLossMode,
}

impl RiskMonitor {
    pub fn new(mode: StopLossMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> StopLossMode {
        self.mode
    }

    /// Check the session against its target and stop-loss.
    ///
    /// The target is tested first, so a settlement that crosses both
    /// reports `TargetReached`.
    pub fn check(&self, session: &Session) -> Option<HaltReason> {
        if session.cumulative_profit >= session.target_profit {
            debug!(
                profit = %session.cumulative_profit,
                target = %session.target_profit,
                "Profit target reached"
            );
            return Some(HaltReason::TargetReached);
        }

        let stop = match self.mode {
            StopLossMode::BalanceFloor => session
                .balance
                .map(|balance| balance <= session.stop_loss)
                .unwrap_or(false),
            StopLossMode::CumulativeLoss => -session.cumulative_profit >= session.stop_loss,
        };

        if stop {
            debug!(
                mode = %self.mode,
                profit = %session.cumulative_profit,
                balance = ?session.balance,
                stop_loss = %session.stop_loss,
                "Stop loss reached"
            );
            return Some(HaltReason::StopLossReached);
        }

        None
    }
}
