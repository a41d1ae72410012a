//! Per-partition span arithmetic.

use serde::{Deserialize, Serialize};

/// Closed interval of unix seconds bounding a partition's persisted alarm
/// times. `start > stop` encodes the empty span left behind after a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u64,
    pub stop: u64,
}

impl Span {
    pub fn point(t: u64) -> Self {
        Self { start: t, stop: t }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.stop
    }

    pub fn covers(&self, t: u64) -> bool {
        self.start <= t && t <= self.stop
    }

    /// Widen to include `point`.
    pub fn expand(&self, point: u64) -> Span {
        if self.is_empty() {
            return Span::point(point);
        }
        Span {
            start: self.start.min(point),
            stop: self.stop.max(point),
        }
    }

    /// Interval union; merging an incoming span with the current one on a
    /// partition-set change keeps every persisted alarm time covered.
    pub fn union(&self, other: &Span) -> Span {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Span {
            start: self.start.min(other.start),
            stop: self.stop.max(other.stop),
        }
    }

    /// Advance `start` after everything below `new_start` drained.
    pub fn shrink_to(&self, new_start: u64) -> Span {
        Span {
            start: self.start.max(new_start),
            stop: self.stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_widens_both_ends() {
        let span = Span::point(100);
        assert_eq!(span.expand(105), Span { start: 100, stop: 105 });
        assert_eq!(span.expand(95), Span { start: 95, stop: 100 });
        assert_eq!(span.expand(100), span);
    }

    #[test]
    fn shrink_past_stop_is_empty() {
        let span = Span { start: 10, stop: 12 };
        let drained = span.shrink_to(13);
        assert!(drained.is_empty());
        assert!(!drained.covers(12));
    }

    #[test]
    fn union_handles_empty_operands() {
        let live = Span { start: 5, stop: 9 };
        let empty = Span { start: 20, stop: 10 };
        assert_eq!(live.union(&empty), live);
        assert_eq!(empty.union(&live), live);
        let other = Span { start: 8, stop: 14 };
        assert_eq!(live.union(&other), Span { start: 5, stop: 14 });
    }
}
