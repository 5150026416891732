//! Deriv WebSocket API v3 message types.
//!
//! Outgoing requests are built as JSON objects. Incoming frames are parsed
//! in two stages: an envelope carrying `msg_type`, `req_id`, `error` and
//! `subscription`, then the body stored under the key named by `msg_type`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use crate::models::ContractType;

/// Parameters of a `proposal` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRequest {
    /// Correlates the venue's answer with the in-flight proposal
    pub req_id: u64,
    pub amount: Decimal,
    pub contract_type: ContractType,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: String,
    pub symbol: String,
}

/// Request sent to the venue.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Authorize { token: String },
    TicksHistory { symbol: String, count: u32 },
    /// Subscribe to live ticks
    Ticks { symbol: String },
    /// Subscribe to balance updates
    Balance,
    Proposal(ProposalRequest),
    /// Buy a proposal, subscribing to the contract's updates
    Buy { proposal_id: String, price: Decimal },
    /// Subscribe to updates of an already bought contract
    ProposalOpenContract { contract_id: u64 },
    Forget { subscription_id: String },
    ForgetAll { streams: Vec<String> },
    Ping,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Authorize { .. } => "authorize",
            Request::TicksHistory { .. } => "ticks_history",
            Request::Ticks { .. } => "ticks",
            Request::Balance => "balance",
            Request::Proposal(_) => "proposal",
            Request::Buy { .. } => "buy",
            Request::ProposalOpenContract { .. } => "proposal_open_contract",
            Request::Forget { .. } => "forget",
            Request::ForgetAll { .. } => "forget_all",
            Request::Ping => "ping",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Request::Authorize { token } => json!({ "authorize": token }),
            Request::TicksHistory { symbol, count } => json!({
                "ticks_history": symbol,
                "adjust_start_time": 1,
                "count": count,
                "end": "latest",
                "start": 1,
                "style": "ticks",
            }),
            Request::Ticks { symbol } => json!({ "ticks": symbol, "subscribe": 1 }),
            Request::Balance => json!({ "balance": 1, "subscribe": 1 }),
            Request::Proposal(p) => json!({
                "proposal": 1,
                "amount": format!("{:.2}", p.amount),
                "basis": "stake",
                "contract_type": p.contract_type.as_str(),
                "currency": p.currency,
                "duration": p.duration,
                "duration_unit": p.duration_unit,
                "symbol": p.symbol,
                "req_id": p.req_id,
            }),
            Request::Buy { proposal_id, price } => json!({
                "buy": proposal_id,
                "price": format!("{:.2}", price),
                "subscribe": 1,
            }),
            Request::ProposalOpenContract { contract_id } => json!({
                "proposal_open_contract": 1,
                "contract_id": contract_id,
                "subscribe": 1,
            }),
            Request::Forget { subscription_id } => json!({ "forget": subscription_id }),
            Request::ForgetAll { streams } => json!({ "forget_all": streams }),
            Request::Ping => json!({ "ping": 1 }),
        }
    }
}

/// Error object attached to a failed response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// State of a bought contract from the `proposal_open_contract` stream.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OpenContract {
    #[serde(default)]
    pub contract_id: Option<u64>,
    #[serde(default)]
    pub is_sold: u8,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub buy_price: Option<Decimal>,
    #[serde(default)]
    pub sell_price: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
}

impl OpenContract {
    pub fn is_sold(&self) -> bool {
        self.is_sold != 0
    }
}

/// Decoded venue message.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueMessage {
    Authorized {
        login_id: String,
        balance: Option<Decimal>,
        currency: String,
    },
    History {
        prices: Vec<f64>,
    },
    Tick {
        symbol: String,
        quote: f64,
        epoch: i64,
    },
    Balance {
        amount: Decimal,
        currency: String,
    },
    Proposal {
        id: String,
        ask_price: Decimal,
        payout: Decimal,
    },
    Buy {
        contract_id: u64,
        buy_price: Decimal,
        balance_after: Option<Decimal>,
    },
    OpenContract(OpenContract),
    Sell {
        contract_id: Option<u64>,
        sold_for: Decimal,
        balance_after: Option<Decimal>,
    },
    Pong,
    Forgotten,
    /// Failed request; `msg_type` names the request that failed
    Error {
        msg_type: String,
        error: ApiError,
    },
    /// Message type this client does not act on
    Other(String),
}

/// One inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub req_id: Option<u64>,
    pub subscription_id: Option<String>,
    pub message: VenueMessage,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    msg_type: String,
    #[serde(default)]
    req_id: Option<u64>,
    #[serde(default)]
    error: Option<ApiError>,
    #[serde(default)]
    subscription: Option<Subscription>,
    #[serde(flatten)]
    body: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    id: String,
}

impl Envelope {
    fn body<T: DeserializeOwned>(&mut self, key: &str) -> Result<T> {
        let value = self
            .body
            .remove(key)
            .with_context(|| format!("{} message without body", key))?;
        serde_json::from_value(value).with_context(|| format!("Failed to parse {} body", key))
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizeBody {
    loginid: String,
    #[serde(default)]
    balance: Option<Decimal>,
    #[serde(default)]
    currency: String,
}

#[derive(Debug, Deserialize)]
struct HistoryBody {
    #[serde(default, deserialize_with = "quotes")]
    prices: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct TickBody {
    #[serde(default)]
    symbol: String,
    #[serde(deserialize_with = "quote")]
    quote: f64,
    #[serde(default)]
    epoch: i64,
}

#[derive(Debug, Deserialize)]
struct BalanceBody {
    balance: Decimal,
    #[serde(default)]
    currency: String,
}

#[derive(Debug, Deserialize)]
struct ProposalBody {
    id: String,
    ask_price: Decimal,
    #[serde(default)]
    payout: Decimal,
}

#[derive(Debug, Deserialize)]
struct BuyBody {
    contract_id: u64,
    buy_price: Decimal,
    #[serde(default)]
    balance_after: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct SellBody {
    #[serde(default)]
    contract_id: Option<u64>,
    sold_for: Decimal,
    #[serde(default)]
    balance_after: Option<Decimal>,
}

/// Quote as number or numeric string. Anything else becomes NaN so the
/// ingestor can reject it as an invalid quote.
fn to_quote(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

fn quote<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(to_quote(&value))
}

fn quotes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values.iter().map(to_quote).collect())
}

/// Parse one text frame from the venue.
pub fn parse_response(text: &str) -> Result<Response> {
    let mut envelope: Envelope =
        serde_json::from_str(text).context("Failed to parse venue message")?;

    let req_id = envelope.req_id;
    let subscription_id = envelope.subscription.take().map(|s| s.id);

    let message = if let Some(error) = envelope.error.take() {
        VenueMessage::Error {
            msg_type: envelope.msg_type.clone(),
            error,
        }
    } else {
        match envelope.msg_type.as_str() {
            "authorize" => {
                let body: AuthorizeBody = envelope.body("authorize")?;
                VenueMessage::Authorized {
                    login_id: body.loginid,
                    balance: body.balance,
                    currency: body.currency,
                }
            }
            "history" => {
                let body: HistoryBody = envelope.body("history")?;
                VenueMessage::History { prices: body.prices }
            }
            "tick" => {
                let body: TickBody = envelope.body("tick")?;
                VenueMessage::Tick {
                    symbol: body.symbol,
                    quote: body.quote,
                    epoch: body.epoch,
                }
            }
            "balance" => {
                let body: BalanceBody = envelope.body("balance")?;
                VenueMessage::Balance {
                    amount: body.balance,
                    currency: body.currency,
                }
            }
            "proposal" => {
                let body: ProposalBody = envelope.body("proposal")?;
                VenueMessage::Proposal {
                    id: body.id,
                    ask_price: body.ask_price,
                    payout: body.payout,
                }
            }
            "buy" => {
                let body: BuyBody = envelope.body("buy")?;
                VenueMessage::Buy {
                    contract_id: body.contract_id,
                    buy_price: body.buy_price,
                    balance_after: body.balance_after,
                }
            }
            "proposal_open_contract" => {
                VenueMessage::OpenContract(envelope.body("proposal_open_contract")?)
            }
            "sell" => {
                let body: SellBody = envelope.body("sell")?;
                VenueMessage::Sell {
                    contract_id: body.contract_id,
                    sold_for: body.sold_for,
                    balance_after: body.balance_after,
                }
            }
            "ping" => VenueMessage::Pong,
            "forget" | "forget_all" => VenueMessage::Forgotten,
            other => VenueMessage::Other(other.to_string()),
        }
    };

    Ok(Response {
        req_id,
        subscription_id,
        message,
    })
}
