//! Martingale stake sizing.

use rust_decimal::Decimal;
use tracing::warn;

use crate::models::Session;

/// Current stake and consecutive-loss depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeState {
    pub stake: Decimal,
    pub depth: u32,
}

/// Multiplies the stake after a loss and resets it after a win.
///
/// Escalation is capped: a loss that would push the depth past
/// `max_depth` resets to the base stake instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakePolicy {
    pub base_stake: Decimal,
    pub factor: Decimal,
    pub max_depth: u32,
}

impl StakePolicy {
    pub fn new(base_stake: Decimal, factor: Decimal, max_depth: u32) -> Self {
        Self {
            base_stake,
            factor,
            max_depth,
        }
    }

    /// Policy parameters of a session.
    pub fn for_session(session: &Session) -> Self {
        Self::new(
            session.base_stake,
            session.martingale_factor,
            session.max_martingale_depth,
        )
    }

    /// Starting state.
    pub fn initial(&self) -> StakeState {
        StakeState {
            stake: self.base_stake,
            depth: 0,
        }
    }

    /// Next stake after a contract settled with `profit`.
    pub fn on_settlement(&self, current: StakeState, profit: Decimal) -> StakeState {
        if profit >= Decimal::ZERO {
            return self.initial();
        }

        let depth = current.depth.saturating_add(1);
        if depth > self.max_depth {
            return self.initial();
        }

        match current.stake.checked_mul(self.factor) {
            Some(stake) => StakeState { stake, depth },
            None => {
                warn!(
                    stake = %current.stake,
                    factor = %self.factor,
                    depth,
                    "Martingale stake overflowed, resetting"
                );
                self.initial()
            }
        }
    }
}
