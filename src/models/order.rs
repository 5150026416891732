//! Trade intents and open contracts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Binary contract direction offered by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractType {
    /// Pays out if the exit spot is strictly above the entry spot.
    Call,
    /// Pays out if the exit spot is strictly below the entry spot.
    Put,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Call => "CALL",
            ContractType::Put => "PUT",
        }
    }

    /// Whether a contract of this type wins moving from `entry` to `exit`.
    pub fn wins(&self, entry: f64, exit: f64) -> bool {
        match self {
            ContractType::Call => exit > entry,
            ContractType::Put => exit < entry,
        }
    }
}

impl std::fmt::Display for ContractType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContractType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CALL" | "RISE" => Ok(ContractType::Call),
            "PUT" | "FALL" => Ok(ContractType::Put),
            other => Err(format!("unknown contract type: {}", other)),
        }
    }
}

/// A queued trade intent waiting for its proposal/buy cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub stake: Decimal,
    pub symbol: String,
    pub direction: ContractType,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn new(stake: Decimal, symbol: impl Into<String>, direction: ContractType) -> Self {
        Self {
            stake,
            symbol: symbol.into(),
            direction,
            created_at: Utc::now(),
        }
    }
}

/// A bought contract awaiting settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    pub contract_id: u64,
    pub symbol: String,
    pub direction: ContractType,
    /// Stake committed when the order was proposed
    pub entry_stake: Decimal,
    /// Price actually charged by the venue
    pub buy_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Contract {
    /// Profit implied by a sale value.
    pub fn profit_from_sale(&self, sold_for: Decimal) -> Decimal {
        sold_for - self.buy_price
    }
}
