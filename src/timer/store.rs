//! Timer persistence and the scan pass.
//!
//! Layout per partition under the handler's key prefix:
//! `{prefix}::{vb}::root` — generation counter bumped on ownership change;
//! `{prefix}::{vb}::span` — `{start, stop}` document, CAS-versioned;
//! `{prefix}::{vb}::{t}` — index of references due at second `t`;
//! `{prefix}::{vb}::{t}::{ref}` — one document per timer.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use super::{Span, TimerError, TimerEvent};
use crate::daemon::metrics::Metrics;
use crate::kv::{self, KvError};

/// CAS retry bound for span updates and index edits.
const CAS_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy)]
struct SpanDoc {
    span: Span,
    cas: u64,
}

#[derive(Debug, Default)]
struct PartitionState {
    doc: Option<SpanDoc>,
    dirty: bool,
}

pub struct TimerStore {
    kv: Arc<dyn kv::Store>,
    prefix: String,
    context_max: Arc<AtomicUsize>,
    partitions: BTreeMap<u16, PartitionState>,
    metrics: Arc<Metrics>,
}

impl TimerStore {
    pub fn new(
        kv: Arc<dyn kv::Store>,
        prefix: impl Into<String>,
        context_max: Arc<AtomicUsize>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
            context_max,
            partitions: BTreeMap::new(),
            metrics,
        }
    }

    fn root_key(&self, vb: u16) -> String {
        format!("{}::{}::root", self.prefix, vb)
    }

    fn span_key(&self, vb: u16) -> String {
        format!("{}::{}::span", self.prefix, vb)
    }

    fn index_key(&self, vb: u16, t: u64) -> String {
        format!("{}::{}::{}", self.prefix, vb, t)
    }

    fn event_key(&self, vb: u16, t: u64, reference: &str) -> String {
        format!("{}::{}::{}::{}", self.prefix, vb, t, reference)
    }

    /// Current in-memory span for a partition, if any.
    pub fn span_of(&self, vb: u16) -> Option<Span> {
        self.partitions.get(&vb).and_then(|p| p.doc).map(|d| d.span)
    }

    /// A retriable error surfacing here means the retry budget ran out.
    fn note_kv(&self, err: &KvError) {
        if err.is_retriable() {
            self.metrics.bump(&self.metrics.lcb_retry_failure);
        }
    }

    pub fn owned_partitions(&self) -> Vec<u16> {
        self.partitions.keys().copied().collect()
    }

    /// Apply a new ownership set. Newly owned partitions fence a new
    /// generation on the root counter and adopt the durable span, merged by
    /// interval union with anything still held in memory.
    pub fn update_partitions(&mut self, owned: &BTreeSet<u16>) {
        self.partitions.retain(|vb, _| owned.contains(vb));

        for &vb in owned {
            let carried = self.partitions.get(&vb).and_then(|p| p.doc);
            if carried.is_some() && !self.partitions[&vb].dirty {
                continue;
            }

            if let Err(err) = kv::with_retries(|| self.kv.counter(&self.root_key(vb), 1, 1)) {
                self.note_kv(&err);
                tracing::warn!(vb, %err, "failed to bump timer root counter");
            }

            match self.read_span(vb) {
                Ok(durable) => {
                    let merged = match (durable, carried) {
                        (Some(doc), Some(mem)) => {
                            let union = doc.span.union(&mem.span);
                            if union != doc.span {
                                self.write_span(vb, union, doc.cas)
                            } else {
                                Some(doc)
                            }
                        }
                        (Some(doc), None) => Some(doc),
                        (None, Some(mem)) => self.insert_span(vb, mem.span),
                        (None, None) => None,
                    };
                    let state = self.partitions.entry(vb).or_default();
                    state.doc = merged;
                    state.dirty = false;
                }
                Err(err) => {
                    tracing::warn!(vb, %err, "failed to read timer span; will retry on sync");
                    let state = self.partitions.entry(vb).or_default();
                    state.dirty = true;
                }
            }
        }
    }

    /// Refresh spans for every dirty partition from the store.
    pub fn sync_span(&mut self) {
        let dirty: Vec<u16> = self
            .partitions
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(vb, _)| *vb)
            .collect();
        for vb in dirty {
            match self.read_span(vb) {
                Ok(doc) => {
                    if let Some(state) = self.partitions.get_mut(&vb) {
                        state.doc = doc;
                        state.dirty = false;
                    }
                }
                Err(err) => {
                    self.note_kv(&err);
                    tracing::warn!(vb, %err, "span sync failed; partition stays dirty");
                }
            }
        }
    }

    /// Persist a timer and grow the span to cover it.
    pub fn set_timer(&mut self, event: &TimerEvent) -> Result<(), TimerError> {
        let max = self.context_max.load(Ordering::Relaxed);
        if max > 0 && event.context.len() > max {
            return Err(TimerError::ContextTooLarge {
                got: event.context.len(),
                max,
            });
        }

        let vb = event.partition;
        let t = event.alarm_time;
        let doc = json!({
            "callback": event.callback,
            "reference": event.reference,
            "alarm_time": t,
            "context": event.context,
            "origin_seq": event.origin_seq,
        });

        let key = self.event_key(vb, t, &event.reference);
        match kv::with_retries(|| self.kv.insert(&key, &doc)) {
            Ok(_) => {}
            Err(KvError::AlreadyExists) => {
                return Err(TimerError::Collision {
                    reference: event.reference.clone(),
                    alarm_time: t,
                });
            }
            Err(err) => return Err(err.into()),
        }

        self.index_add(vb, t, &event.reference)?;
        self.partitions.entry(vb).or_default().dirty = true;
        self.expand_span(vb, t);
        Ok(())
    }

    /// Remove a timer and prune its index entry.
    pub fn delete_timer(
        &mut self,
        vb: u16,
        alarm_time: u64,
        reference: &str,
    ) -> Result<(), TimerError> {
        let key = self.event_key(vb, alarm_time, reference);
        match kv::with_retries(|| self.kv.remove(&key, 0)) {
            Ok(()) | Err(KvError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        self.index_remove(vb, alarm_time, reference)
    }

    fn index_add(&self, vb: u16, t: u64, reference: &str) -> Result<(), TimerError> {
        let key = self.index_key(vb, t);
        for _ in 0..CAS_RETRIES {
            match kv::with_retries(|| self.kv.get(&key)) {
                Ok(found) => {
                    let mut refs = index_refs(&key, &found.value)?;
                    if refs.iter().any(|r| r == reference) {
                        return Ok(());
                    }
                    refs.push(reference.to_string());
                    refs.sort();
                    let doc = json!({ "refs": refs });
                    match kv::with_retries(|| self.kv.replace(&key, &doc, found.cas)) {
                        Ok(_) => return Ok(()),
                        Err(KvError::CasMismatch) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(KvError::NotFound) => {
                    let doc = json!({ "refs": [reference] });
                    match kv::with_retries(|| self.kv.insert(&key, &doc)) {
                        Ok(_) => return Ok(()),
                        Err(KvError::AlreadyExists) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(TimerError::Kv(KvError::CasMismatch))
    }

    fn index_remove(&self, vb: u16, t: u64, reference: &str) -> Result<(), TimerError> {
        let key = self.index_key(vb, t);
        for _ in 0..CAS_RETRIES {
            match kv::with_retries(|| self.kv.get(&key)) {
                Ok(found) => {
                    let mut refs = index_refs(&key, &found.value)?;
                    let before = refs.len();
                    refs.retain(|r| r != reference);
                    if refs.len() == before {
                        return Ok(());
                    }
                    let result = if refs.is_empty() {
                        kv::with_retries(|| self.kv.remove(&key, found.cas))
                    } else {
                        let doc = json!({ "refs": refs });
                        kv::with_retries(|| self.kv.replace(&key, &doc, found.cas)).map(|_| ())
                    };
                    match result {
                        Ok(()) => return Ok(()),
                        Err(KvError::CasMismatch) => continue,
                        Err(KvError::NotFound) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(KvError::NotFound) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Err(TimerError::Kv(KvError::CasMismatch))
    }

    fn read_span(&self, vb: u16) -> Result<Option<SpanDoc>, KvError> {
        match kv::with_retries(|| self.kv.get(&self.span_key(vb))) {
            Ok(found) => match serde_json::from_value::<Span>(found.value) {
                Ok(span) => Ok(Some(SpanDoc {
                    span,
                    cas: found.cas,
                })),
                Err(err) => Err(KvError::Fatal {
                    reason: format!("span document is malformed: {err}"),
                }),
            },
            Err(KvError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn insert_span(&self, vb: u16, span: Span) -> Option<SpanDoc> {
        let value = serde_json::to_value(span).expect("span serialises");
        match kv::with_retries(|| self.kv.insert(&self.span_key(vb), &value)) {
            Ok(cas) => Some(SpanDoc { span, cas }),
            Err(err) => {
                tracing::warn!(vb, %err, "failed to create span document");
                None
            }
        }
    }

    fn write_span(&self, vb: u16, span: Span, cas: u64) -> Option<SpanDoc> {
        let value = serde_json::to_value(span).expect("span serialises");
        match kv::with_retries(|| self.kv.replace(&self.span_key(vb), &value, cas)) {
            Ok(cas) => Some(SpanDoc { span, cas }),
            Err(err) => {
                tracing::warn!(vb, %err, "failed to update span document");
                None
            }
        }
    }

    /// Grow the durable span to cover `point`. Bounded CAS retries; on
    /// repeated misses the partition stays dirty and the next sync pass
    /// picks the loss up.
    fn expand_span(&mut self, vb: u16, point: u64) {
        for _ in 0..CAS_RETRIES {
            let current = match self.read_span(vb) {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::warn!(vb, point, %err, "span read failed during expand");
                    return;
                }
            };
            match current {
                None => {
                    if let Some(doc) = self.insert_span(vb, Span::point(point)) {
                        self.remember(vb, doc);
                        return;
                    }
                    // Lost the create race; re-read and expand instead.
                    continue;
                }
                Some(doc) => {
                    let expanded = doc.span.expand(point);
                    if expanded == doc.span {
                        self.remember(vb, doc);
                        return;
                    }
                    let value = serde_json::to_value(expanded).expect("span serialises");
                    match kv::with_retries(|| self.kv.replace(&self.span_key(vb), &value, doc.cas))
                    {
                        Ok(cas) => {
                            self.remember(vb, SpanDoc { span: expanded, cas });
                            return;
                        }
                        Err(KvError::CasMismatch) => continue,
                        Err(err) => {
                            tracing::warn!(vb, point, %err, "span expand failed");
                            return;
                        }
                    }
                }
            }
        }
        tracing::warn!(vb, point, "span expand exhausted its CAS retries");
    }

    /// Advance `start` after second `new_start - 1` fully drained.
    fn shrink_span(&mut self, vb: u16, new_start: u64) {
        for _ in 0..CAS_RETRIES {
            let current = match self.read_span(vb) {
                Ok(Some(doc)) => doc,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(vb, new_start, %err, "span read failed during shrink");
                    return;
                }
            };
            let shrunk = current.span.shrink_to(new_start);
            if shrunk == current.span {
                self.remember(vb, current);
                return;
            }
            let value = serde_json::to_value(shrunk).expect("span serialises");
            match kv::with_retries(|| self.kv.replace(&self.span_key(vb), &value, current.cas)) {
                Ok(cas) => {
                    self.remember(vb, SpanDoc { span: shrunk, cas });
                    return;
                }
                Err(KvError::CasMismatch) => continue,
                Err(err) => {
                    tracing::warn!(vb, new_start, %err, "span shrink failed");
                    return;
                }
            }
        }
        tracing::warn!(vb, new_start, "span shrink exhausted its CAS retries");
    }

    fn remember(&mut self, vb: u16, doc: SpanDoc) {
        let state = self.partitions.entry(vb).or_default();
        state.doc = Some(doc);
        state.dirty = false;
    }

    fn load_second(&mut self, vb: u16, t: u64) -> Vec<TimerEvent> {
        let index_key = self.index_key(vb, t);
        let refs = match kv::with_retries(|| self.kv.get(&index_key)) {
            Ok(found) => match index_refs(&index_key, &found.value) {
                Ok(refs) => refs,
                Err(err) => {
                    tracing::error!(vb, t, %err, "timer index is malformed; skipping second");
                    return Vec::new();
                }
            },
            Err(KvError::NotFound) => return Vec::new(),
            Err(err) => {
                self.note_kv(&err);
                tracing::warn!(vb, t, %err, "timer index read failed; will retry next scan");
                if let Some(state) = self.partitions.get_mut(&vb) {
                    state.dirty = true;
                }
                return Vec::new();
            }
        };

        let mut events = Vec::with_capacity(refs.len());
        for reference in refs {
            let key = self.event_key(vb, t, &reference);
            match kv::with_retries(|| self.kv.get(&key)) {
                Ok(found) => match parse_event(vb, t, &reference, &key, &found.value) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        tracing::error!(vb, t, reference, %err, "skipping malformed timer");
                    }
                },
                // Cancelled between index read and fetch.
                Err(KvError::NotFound) => {}
                Err(err) => {
                    tracing::warn!(vb, t, reference, %err, "timer fetch failed");
                }
            }
        }
        events
    }

    fn finish_second(&mut self, vb: u16, t: u64) {
        let index_key = self.index_key(vb, t);
        match kv::with_retries(|| self.kv.remove(&index_key, 0)) {
            Ok(()) | Err(KvError::NotFound) => {}
            Err(err) => {
                tracing::warn!(vb, t, %err, "failed to prune timer index");
            }
        }
        self.shrink_span(vb, t + 1);
    }

    fn delete_event_doc(&self, event: &TimerEvent) {
        let key = self.event_key(event.partition, event.alarm_time, &event.reference);
        match kv::with_retries(|| self.kv.remove(&key, 0)) {
            Ok(()) | Err(KvError::NotFound) => {}
            Err(err) => {
                tracing::warn!(key, %err, "failed to delete fired timer");
            }
        }
    }
}

fn index_refs(key: &str, value: &Value) -> Result<Vec<String>, TimerError> {
    let refs = value
        .get("refs")
        .and_then(Value::as_array)
        .ok_or_else(|| TimerError::MalformedDoc {
            key: key.to_string(),
            reason: "missing refs array".into(),
        })?;
    refs.iter()
        .map(|r| {
            r.as_str()
                .map(String::from)
                .ok_or_else(|| TimerError::MalformedDoc {
                    key: key.to_string(),
                    reason: "non-string reference".into(),
                })
        })
        .collect()
}

fn parse_event(
    vb: u16,
    t: u64,
    reference: &str,
    key: &str,
    value: &Value,
) -> Result<TimerEvent, TimerError> {
    let callback = value
        .get("callback")
        .and_then(Value::as_str)
        .ok_or_else(|| TimerError::MalformedDoc {
            key: key.to_string(),
            reason: "missing callback".into(),
        })?;
    let context = value
        .get("context")
        .and_then(Value::as_str)
        .unwrap_or("undefined");
    let origin_seq = value.get("origin_seq").and_then(Value::as_u64).unwrap_or(0);
    Ok(TimerEvent {
        partition: vb,
        alarm_time: t,
        reference: reference.to_string(),
        callback: callback.to_string(),
        context: context.to_string(),
        origin_seq,
    })
}

/// One scan pass over all owned partitions: due timers come out lazily in
/// ascending `(time, partition, reference)` order. A pass is not
/// restartable; request a new one per `ScanTimer` tick.
pub struct Scan {
    store: Arc<Mutex<TimerStore>>,
    now: u64,
    current: Option<u64>,
    queue: VecDeque<TimerEvent>,
    /// Partitions whose second `current` was loaded and must be pruned and
    /// shrunk once the queue drains.
    loaded: Vec<u16>,
    exhausted: bool,
}

impl Scan {
    pub fn new(store: Arc<Mutex<TimerStore>>, now: u64) -> Self {
        Self {
            store,
            now,
            current: None,
            queue: VecDeque::new(),
            loaded: Vec::new(),
            exhausted: false,
        }
    }

    /// Next due timer, or `None` once the pass is complete.
    pub fn next(&mut self) -> Option<TimerEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.exhausted {
                return None;
            }

            self.finish_current();

            let previous = self.current;
            let next = self.next_due_second();
            match next {
                Some(t) if previous.map_or(true, |p| t > p) => {
                    self.load(t);
                }
                Some(t) => {
                    // A shrink failed upstream and the span did not move;
                    // bail out rather than spin on the same second.
                    tracing::warn!(t, "scan could not advance past a stuck span");
                    self.exhausted = true;
                    return None;
                }
                None => {
                    self.exhausted = true;
                    return None;
                }
            }
        }
    }

    /// Acknowledge a fired timer; its document is deleted so it can never
    /// fire again.
    pub fn ack_fired(&mut self, event: &TimerEvent) {
        let store = self.store.lock().expect("timer store lock poisoned");
        store.delete_event_doc(event);
    }

    fn next_due_second(&self) -> Option<u64> {
        let store = self.store.lock().expect("timer store lock poisoned");
        store
            .partitions
            .values()
            .filter_map(|p| p.doc)
            .map(|d| d.span)
            .filter(|s| !s.is_empty() && s.start <= self.now)
            .map(|s| s.start)
            .min()
    }

    fn load(&mut self, t: u64) {
        let mut store = self.store.lock().expect("timer store lock poisoned");
        let covered: Vec<u16> = store
            .partitions
            .iter()
            .filter(|(_, p)| p.doc.map_or(false, |d| d.span.covers(t)))
            .map(|(vb, _)| *vb)
            .collect();
        for vb in &covered {
            let events = store.load_second(*vb, t);
            self.queue.extend(events);
        }
        self.loaded = covered;
        self.current = Some(t);
    }

    fn finish_current(&mut self) {
        let Some(t) = self.current else {
            return;
        };
        let mut store = self.store.lock().expect("timer store lock poisoned");
        for vb in std::mem::take(&mut self.loaded) {
            store.finish_second(vb, t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn fixture() -> (Arc<Mutex<TimerStore>>, MemoryStore, Arc<Metrics>) {
        let kv = MemoryStore::new();
        let metrics = Arc::new(Metrics::default());
        let store = TimerStore::new(
            Arc::new(kv.clone()),
            "evt::fn1",
            Arc::new(AtomicUsize::new(1024)),
            Arc::clone(&metrics),
        );
        (Arc::new(Mutex::new(store)), kv, metrics)
    }

    fn own(store: &Arc<Mutex<TimerStore>>, vbs: &[u16]) {
        let owned: BTreeSet<u16> = vbs.iter().copied().collect();
        store
            .lock()
            .unwrap()
            .update_partitions(&owned);
    }

    fn timer(vb: u16, t: u64, reference: &str) -> TimerEvent {
        TimerEvent {
            partition: vb,
            alarm_time: t,
            reference: reference.into(),
            callback: "Callback".into(),
            context: r#"{"n":1}"#.into(),
            origin_seq: 42,
        }
    }

    #[test]
    fn set_timer_expands_span_to_cover_alarm() {
        let (store, _kv, _) = fixture();
        own(&store, &[4]);

        store.lock().unwrap().set_timer(&timer(4, 100, "r1")).unwrap();
        store.lock().unwrap().set_timer(&timer(4, 107, "r2")).unwrap();
        store.lock().unwrap().set_timer(&timer(4, 95, "r3")).unwrap();

        let span = store.lock().unwrap().span_of(4).unwrap();
        assert!(span.covers(95) && span.covers(100) && span.covers(107));

        // Sync from the durable copy must agree.
        {
            let mut guard = store.lock().unwrap();
            guard.partitions.get_mut(&4).unwrap().dirty = true;
            guard.sync_span();
            assert_eq!(guard.span_of(4).unwrap(), span);
        }
    }

    #[test]
    fn duplicate_reference_is_a_collision() {
        let (store, _kv, _) = fixture();
        own(&store, &[4]);
        store.lock().unwrap().set_timer(&timer(4, 100, "r1")).unwrap();
        let err = store
            .lock()
            .unwrap()
            .set_timer(&timer(4, 100, "r1"))
            .unwrap_err();
        assert!(matches!(err, TimerError::Collision { .. }));
    }

    #[test]
    fn oversized_context_is_rejected() {
        let (store, _kv, _) = fixture();
        own(&store, &[4]);
        let mut event = timer(4, 100, "big");
        event.context = "x".repeat(2048);
        let err = store.lock().unwrap().set_timer(&event).unwrap_err();
        assert!(matches!(err, TimerError::ContextTooLarge { .. }));
    }

    #[test]
    fn scan_fires_due_timers_in_order_and_shrinks() {
        let (store, kv, _) = fixture();
        own(&store, &[4, 5]);

        store.lock().unwrap().set_timer(&timer(4, 100, "r2")).unwrap();
        store.lock().unwrap().set_timer(&timer(4, 100, "r1")).unwrap();
        store.lock().unwrap().set_timer(&timer(5, 99, "s1")).unwrap();
        store.lock().unwrap().set_timer(&timer(4, 200, "later")).unwrap();

        let mut scan = Scan::new(Arc::clone(&store), 150);
        let mut fired = Vec::new();
        while let Some(event) = scan.next() {
            scan.ack_fired(&event);
            fired.push((event.alarm_time, event.partition, event.reference.clone()));
        }

        assert_eq!(
            fired,
            vec![
                (99, 5, "s1".to_string()),
                (100, 4, "r1".to_string()),
                (100, 4, "r2".to_string()),
            ]
        );

        // Drained seconds advanced both spans past their fired points.
        let guard = store.lock().unwrap();
        assert!(guard.span_of(5).unwrap().start > 99);
        assert!(guard.span_of(4).unwrap().start > 100);
        // The undue timer is still persisted and covered.
        assert!(guard.span_of(4).unwrap().covers(200));
        assert!(kv.contains("evt::fn1::4::200::later"));
        drop(guard);

        // Fired documents are gone; a second pass finds nothing due.
        assert!(!kv.contains("evt::fn1::4::100::r1"));
        let mut again = Scan::new(Arc::clone(&store), 150);
        assert!(again.next().is_none());
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let (store, _kv, _) = fixture();
        own(&store, &[4]);
        store.lock().unwrap().set_timer(&timer(4, 100, "keep")).unwrap();
        store.lock().unwrap().set_timer(&timer(4, 100, "gone")).unwrap();
        store.lock().unwrap().delete_timer(4, 100, "gone").unwrap();

        let mut scan = Scan::new(Arc::clone(&store), 150);
        let mut fired = Vec::new();
        while let Some(event) = scan.next() {
            scan.ack_fired(&event);
            fired.push(event.reference.clone());
        }
        assert_eq!(fired, vec!["keep".to_string()]);
    }

    #[test]
    fn partition_handoff_merges_overlapping_spans() {
        let (store, _kv, _) = fixture();
        own(&store, &[4]);
        store.lock().unwrap().set_timer(&timer(4, 100, "r1")).unwrap();

        // Simulate another owner having widened the durable span while this
        // worker still holds [100, 100] in memory.
        {
            let guard = store.lock().unwrap();
            let doc = guard.read_span(4).unwrap().unwrap();
            guard.write_span(4, doc.span.expand(130), doc.cas).unwrap();
            drop(guard);
        }
        {
            let mut guard = store.lock().unwrap();
            guard.partitions.get_mut(&4).unwrap().dirty = true;
        }

        own(&store, &[4]);
        let span = store.lock().unwrap().span_of(4).unwrap();
        assert!(span.covers(100) && span.covers(130));
    }
}
