//! Per-machine rolling history
//!
//! ```text
//! WindowStore
//!   └─ entity_id ──► Mutex<WindowedBuffer>   (VecDeque<Reading>, capacity-bounded)
//!                         └─ window(since) / aggregate(field, reducer)
//! ```
//!
//! Capacity bounds memory; time bounds what aggregates see. A reading older
//! than the longest window stays in the buffer until capacity pushes it out
//! but never contributes to an aggregate.

pub mod buffer;
pub mod store;

pub use buffer::WindowedBuffer;
pub use store::WindowStore;

use crate::messages::Reading;

/// Numeric reading field an aggregate runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingField {
    Temperature,
    Vibration,
    Power,
}

impl ReadingField {
    pub fn value(&self, reading: &Reading) -> f64 {
        match self {
            ReadingField::Temperature => reading.temperature,
            ReadingField::Vibration => reading.vibration,
            ReadingField::Power => reading.power,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingField::Temperature => "temperature",
            ReadingField::Vibration => "vibration",
            ReadingField::Power => "power",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reducer {
    Avg,
    Max,
}

impl Reducer {
    /// Reduce a set of values.
    ///
    /// An empty window yields the sentinel `0.0`. Callers cannot tell it apart
    /// from a genuine zero reading; that ambiguity is part of the contract.
    pub fn reduce<I>(&self, values: I) -> f64
    where
        I: IntoIterator<Item = f64>,
    {
        let mut count = 0usize;
        let mut acc = match self {
            Reducer::Avg => 0.0,
            Reducer::Max => f64::NEG_INFINITY,
        };

        for v in values {
            count += 1;
            acc = match self {
                Reducer::Avg => acc + v,
                Reducer::Max => acc.max(v),
            };
        }

        if count == 0 {
            return 0.0;
        }

        match self {
            Reducer::Avg => acc / count as f64,
            Reducer::Max => acc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_empty_is_sentinel() {
        assert_eq!(Reducer::Avg.reduce(Vec::new()), 0.0);
        assert_eq!(Reducer::Max.reduce(Vec::new()), 0.0);
    }

    #[test]
    fn test_reduce_values() {
        assert_eq!(Reducer::Avg.reduce([1.0, 2.0, 3.0]), 2.0);
        assert_eq!(Reducer::Max.reduce([1.0, 5.0, 3.0]), 5.0);
        // Max over negatives must not be clamped to the sentinel
        assert_eq!(Reducer::Max.reduce([-4.0, -2.0]), -2.0);
    }
}
