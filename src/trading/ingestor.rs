//! Quote ingestion into the rolling tick buffer.

use tracing::trace;

use crate::error::TradingError;
use crate::models::TickBuffer;

/// Validates quotes and writes them into a `TickBuffer`.
pub struct QuoteIngestor;

impl QuoteIngestor {
    /// Seed the buffer from a historical backfill, replacing its contents.
    ///
    /// Only the most recent `capacity` prices are kept. If any price is
    /// invalid the whole batch is rejected and the buffer is untouched.
    pub fn ingest_history(buffer: &mut TickBuffer, prices: &[f64]) -> Result<(), TradingError> {
        if let Some(bad) = prices.iter().find(|p| !p.is_finite()) {
            return Err(TradingError::InvalidQuote(format!(
                "history contains non-finite price {}",
                bad
            )));
        }
        buffer.replace(prices);
        trace!(received = prices.len(), kept = buffer.len(), "History ingested");
        Ok(())
    }

    /// Append a single tick.
    pub fn ingest_tick(buffer: &mut TickBuffer, price: f64) -> Result<(), TradingError> {
        if !price.is_finite() {
            return Err(TradingError::InvalidQuote(format!("non-finite price {}", price)));
        }
        buffer.push(price);
        Ok(())
    }
}
