//! vBucket to worker-thread routing.
//!
//! The map is set by a `WorkerThreadMap` control message and read only by
//! the control thread; events for unmapped partitions are dropped by the
//! caller with a loss counter.

use std::collections::BTreeSet;

use crate::config::NUM_VBUCKETS;
use crate::proto::ThreadMapPayload;

const UNMAPPED: i32 = -1;

pub struct Router {
    map: Vec<i32>,
    partition_count: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            map: vec![UNMAPPED; NUM_VBUCKETS],
            partition_count: 0,
        }
    }

    pub fn apply(&mut self, payload: &ThreadMapPayload) {
        self.partition_count = payload.partition_count as usize;
        for entry in &payload.entries {
            for &vb in &entry.partitions {
                if (vb as usize) < self.map.len() {
                    self.map[vb as usize] = i32::from(entry.thread_id);
                }
            }
        }
    }

    pub fn worker_for(&self, vb: u16) -> Option<usize> {
        match self.map.get(vb as usize) {
            Some(&id) if id >= 0 => Some(id as usize),
            _ => None,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Split an ownership list into per-worker partition sets, dropping
    /// vBuckets with no mapping.
    pub fn split_owned(&self, vbuckets: &[u16], workers: usize) -> Vec<BTreeSet<u16>> {
        let mut out = vec![BTreeSet::new(); workers];
        for &vb in vbuckets {
            if let Some(worker) = self.worker_for(vb) {
                if worker < workers {
                    out[worker].insert(vb);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ThreadMapEntry;

    fn payload() -> ThreadMapPayload {
        ThreadMapPayload {
            partition_count: 1024,
            entries: vec![
                ThreadMapEntry {
                    thread_id: 0,
                    partitions: vec![17, 19],
                },
                ThreadMapEntry {
                    thread_id: 1,
                    partitions: vec![18],
                },
            ],
        }
    }

    #[test]
    fn routes_by_partition() {
        let mut router = Router::new();
        router.apply(&payload());
        assert_eq!(router.worker_for(17), Some(0));
        assert_eq!(router.worker_for(18), Some(1));
        assert_eq!(router.worker_for(19), Some(0));
        assert_eq!(router.worker_for(20), None);
    }

    #[test]
    fn splits_ownership_per_worker() {
        let mut router = Router::new();
        router.apply(&payload());
        let split = router.split_owned(&[17, 18, 19, 700], 2);
        assert_eq!(split[0], BTreeSet::from([17, 19]));
        assert_eq!(split[1], BTreeSet::from([18]));
    }
}
