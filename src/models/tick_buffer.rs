//! Fixed-capacity rolling window of recent prices.

use std::collections::VecDeque;

/// Ordered FIFO of the most recent prices, never longer than its capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct TickBuffer {
    capacity: usize,
    prices: VecDeque<f64>,
}

impl TickBuffer {
    /// Create an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            prices: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// True once the buffer holds `capacity` prices.
    pub fn is_full(&self) -> bool {
        self.prices.len() == self.capacity
    }

    /// Most recent price.
    pub fn latest(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    /// Prices from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.prices.iter()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.prices.iter().copied().collect()
    }

    /// Replace the contents with the last `capacity` entries of `prices`.
    pub fn replace(&mut self, prices: &[f64]) {
        let skip = prices.len().saturating_sub(self.capacity);
        self.prices.clear();
        self.prices.extend(prices[skip..].iter().copied());
    }

    /// Append a price, evicting the oldest one when full.
    pub fn push(&mut self, price: f64) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_oldest() {
        let mut buffer = TickBuffer::new(3);
        for price in [1.0, 2.0, 3.0, 4.0, 5.0] {
            buffer.push(price);
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.to_vec(), vec![3.0, 4.0, 5.0]);
        assert_eq!(buffer.latest(), Some(5.0));
    }

    #[test]
    fn test_replace_keeps_most_recent() {
        let mut buffer = TickBuffer::new(3);
        buffer.push(99.0);
        buffer.replace(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.to_vec(), vec![2.0, 3.0, 4.0]);

        buffer.replace(&[7.0]);
        assert_eq!(buffer.to_vec(), vec![7.0]);
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_holds_last_capacity_prices_in_order() {
        let mut buffer = TickBuffer::new(4);
        let stream: Vec<f64> = (0..50).map(|i| (i * 7 % 13) as f64).collect();
        for (i, price) in stream.iter().enumerate() {
            buffer.push(*price);
            let start = (i + 1).saturating_sub(4);
            assert_eq!(buffer.to_vec(), stream[start..=i].to_vec());
        }
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let buffer = TickBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
    }
}
