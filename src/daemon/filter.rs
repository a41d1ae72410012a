//! Per-vBucket sequence filter.
//!
//! Normal operation deduplicates: an event is delivered only when its
//! sequence number is beyond the last one processed. During a rebalance
//! hand-off the controller arms a filter at `F`; events at or below `F`
//! are suppressed until the stream catches up, and late in-flight events
//! for a handed-off partition keep being dropped silently.

use std::sync::Mutex;

use crate::config::NUM_VBUCKETS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// At or below the last processed sequence number.
    Duplicate,
    /// Suppressed by an armed hand-off filter.
    Filtered,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    last_processed: u64,
    pending: Option<u64>,
}

/// Shared between the worker thread and the control thread; the lock is
/// held only for short read-modify-write sections.
pub struct FilterTable {
    slots: Mutex<Vec<Slot>>,
}

impl Default for FilterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![Slot::default(); NUM_VBUCKETS]),
        }
    }

    /// Decide whether to deliver `seqno` on `vb`. Reaching the filter
    /// boundary exactly disarms the filter. `vb` comes straight out of
    /// wire metadata, so an out-of-range value is `None` — a misrouted
    /// event for the caller to count and drop, never a panic.
    pub fn check(&self, vb: u16, seqno: u64) -> Option<Verdict> {
        let mut slots = self.slots.lock().expect("filter lock poisoned");
        let slot = slots.get_mut(vb as usize)?;
        if let Some(boundary) = slot.pending {
            if seqno <= boundary {
                if seqno == boundary {
                    slot.pending = None;
                }
                return Some(if seqno <= slot.last_processed {
                    Verdict::Duplicate
                } else {
                    Verdict::Filtered
                });
            }
        }
        if seqno <= slot.last_processed {
            return Some(Verdict::Duplicate);
        }
        Some(Verdict::Deliver)
    }

    /// Record a successfully dispatched sequence number. Monotone: stale
    /// values never move the mark backwards. Out-of-range `vb` is a no-op;
    /// delivery was already gated by [`FilterTable::check`].
    pub fn advance(&self, vb: u16, seqno: u64) {
        let mut slots = self.slots.lock().expect("filter lock poisoned");
        if let Some(slot) = slots.get_mut(vb as usize) {
            slot.last_processed = slot.last_processed.max(seqno);
        }
    }

    /// Hand-off request: arm a filter at `boundary` unless the stream has
    /// already passed it. Returns the last processed sequence number for
    /// the acknowledgement, or `None` when `vb` is out of range.
    pub fn install(&self, vb: u16, boundary: u64) -> Option<u64> {
        let mut slots = self.slots.lock().expect("filter lock poisoned");
        let slot = slots.get_mut(vb as usize)?;
        if slot.last_processed < boundary {
            slot.pending = Some(boundary);
        }
        Some(slot.last_processed)
    }

    pub fn last_processed(&self, vb: u16) -> u64 {
        let slots = self.slots.lock().expect("filter lock poisoned");
        slots.get(vb as usize).map_or(0, |slot| slot.last_processed)
    }

    pub fn pending(&self, vb: u16) -> Option<u64> {
        let slots = self.slots.lock().expect("filter lock poisoned");
        slots.get(vb as usize).and_then(|slot| slot.pending)
    }
}
