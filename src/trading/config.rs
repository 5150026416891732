//! Trading configuration: engine tuning and validated bot parameters.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TradingError;
use crate::models::ContractType;

/// How the stop-loss threshold is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossMode {
    /// Halt when the account balance falls to or below `stop_loss`
    BalanceFloor,
    /// Halt when cumulative loss reaches `stop_loss`
    CumulativeLoss,
}

impl std::str::FromStr for StopLossMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "balance_floor" | "balance" => Ok(StopLossMode::BalanceFloor),
            "cumulative_loss" | "loss" => Ok(StopLossMode::CumulativeLoss),
            other => Err(format!("unknown stop-loss mode: {}", other)),
        }
    }
}

impl std::fmt::Display for StopLossMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopLossMode::BalanceFloor => write!(f, "balance_floor"),
            StopLossMode::CumulativeLoss => write!(f, "cumulative_loss"),
        }
    }
}

/// Engine settings that are not part of a bot's parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Moving average window, also the tick buffer capacity
    pub window: usize,

    /// Number of historical ticks requested at session start
    pub history_count: u32,

    /// Minimum time between consecutive proposal requests (ms)
    pub proposal_spacing_ms: u64,

    /// Delay before retrying a rate-limited proposal (ms)
    pub rate_limit_backoff_ms: u64,

    /// Contract direction to buy on a positive signal
    pub contract_type: ContractType,

    /// Contract duration in `duration_unit`s
    pub duration: u32,

    /// Venue duration unit ("t" = ticks, "s" = seconds)
    pub duration_unit: String,

    /// Account currency
    pub currency: String,

    pub stop_loss_mode: StopLossMode,
}

impl TradingConfig {
    pub fn proposal_spacing(&self) -> Duration {
        Duration::from_millis(self.proposal_spacing_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            window: 8,
            history_count: 100,
            proposal_spacing_ms: 1000,  // 1s between proposals
            rate_limit_backoff_ms: 1000, // 1s before retrying
            contract_type: ContractType::Call,
            duration: 5,
            duration_unit: "t".to_string(),
            currency: "USD".to_string(),
            stop_loss_mode: StopLossMode::BalanceFloor,
        }
    }
}

/// Bot parameters as supplied by the caller, before validation.
///
/// Numeric fields arrive as floats so that missing and non-numeric inputs
/// can both be reported as configuration errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotParams {
    pub symbol: Option<String>,
    pub base_stake: Option<f64>,
    pub martingale_factor: Option<f64>,
    pub max_martingale_depth: Option<u32>,
    pub target_profit: Option<f64>,
    pub stop_loss: Option<f64>,
}

impl BotParams {
    /// Validate into a `BotConfig`.
    pub fn validate(&self) -> Result<BotConfig, TradingError> {
        let symbol = match self.symbol.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Err(TradingError::config("symbol is required")),
        };

        let base_stake = positive("stake", self.base_stake)?;
        let martingale_factor = positive("martingale_factor", self.martingale_factor)?;
        let target_profit = positive("target_profit", self.target_profit)?;
        let stop_loss = positive("stop_loss", self.stop_loss)?;
        let max_martingale_depth = self
            .max_martingale_depth
            .ok_or_else(|| TradingError::config("max_martingale_depth is required"))?;

        if martingale_factor < Decimal::ONE {
            warn!(
                factor = %martingale_factor,
                "Martingale factor below 1 shrinks the stake after a loss"
            );
        }

        Ok(BotConfig {
            symbol,
            base_stake,
            martingale_factor,
            max_martingale_depth,
            target_profit,
            stop_loss,
        })
    }
}

fn positive(name: &str, value: Option<f64>) -> Result<Decimal, TradingError> {
    let raw = value.ok_or_else(|| TradingError::config(format!("{} is required", name)))?;
    if !raw.is_finite() {
        return Err(TradingError::config(format!("{} is not a number: {}", name, raw)));
    }
    let decimal = Decimal::try_from(raw)
        .map_err(|e| TradingError::config(format!("{} is out of range: {}", name, e)))?;
    if decimal <= Decimal::ZERO {
        return Err(TradingError::config(format!("{} must be positive, got {}", name, decimal)));
    }
    Ok(decimal)
}

/// Validated bot parameters for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotConfig {
    pub symbol: String,
    pub base_stake: Decimal,
    pub martingale_factor: Decimal,
    pub max_martingale_depth: u32,
    pub target_profit: Decimal,
    pub stop_loss: Decimal,
}
