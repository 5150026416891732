//! Moving-average momentum signal.

use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::TickBuffer;

/// Outcome of evaluating the tick window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Signal {
    /// Mean of the window, `None` until the window is full
    pub average: Option<f64>,
    pub should_trade: bool,
}

/// Pure trade/no-trade decision over a `TickBuffer`.
pub struct SignalEvaluator;

impl SignalEvaluator {
    /// Trade when the latest price is strictly above the window mean.
    pub fn evaluate(buffer: &TickBuffer) -> Signal {
        if !buffer.is_full() {
            return Signal {
                average: None,
                should_trade: false,
            };
        }

        let average = buffer.iter().mean();
        let should_trade = buffer.latest().map(|last| last > average).unwrap_or(false);

        Signal {
            average: Some(average),
            should_trade,
        }
    }
}
