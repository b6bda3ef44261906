//! Notification aggregation engine.
//!
//! Fans raw per-characteristic GATT notifications into a single stream of
//! [`Record`]s according to a [`StreamMode`] and a rate cap. The transport's
//! notification threads feed an internal state machine; a single worker
//! thread owns the timer and the callback, so the callback never runs
//! concurrently with itself.
//!
//! Backpressure: the queue between aggregation and the callback is bounded.
//! Overflow discards the oldest queued record and flags the next emission
//! with `dropped`; nothing ever blocks the transport side.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::cancel::CancelToken;
use crate::constants::{DEFAULT_POLL_TIMEOUT, RECORD_QUEUE_DEPTH};
use crate::error::TransportError;
use crate::gatt::{uuid, GattConnection, Record, RecordFlags, StreamMode, SubscribeOptions};

/// Callback receiving emitted records on the engine's worker thread.
///
/// Must not block on external I/O; everything downstream of it (script
/// calls, PTY writes) is non-blocking by construction.
pub type RecordCallback = Arc<dyn Fn(Record) + Send + Sync>;

#[derive(Default)]
struct AggState {
    /// Batched mode: per-characteristic arrival-ordered values.
    batch: BTreeMap<String, Vec<Vec<u8>>>,
    /// AggregatedLatest mode: most recent value per characteristic.
    latest: BTreeMap<String, Vec<u8>>,
    /// Characteristics updated since the previous tick.
    updated: BTreeSet<String>,
    /// Whether any notification has ever arrived (first-tick gate).
    any_data: bool,
}

struct EngineShared {
    mode: StreamMode,
    subscribed: Vec<String>,
    queue: Mutex<VecDeque<Record>>,
    queue_cond: Condvar,
    /// Set when the queue dropped a record; transferred onto the next
    /// emitted record's flags.
    overflowed: AtomicBool,
    records_dropped: AtomicU64,
    agg: Mutex<AggState>,
}

impl EngineShared {
    fn new(mode: StreamMode, subscribed: Vec<String>) -> Self {
        Self {
            mode,
            subscribed,
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            overflowed: AtomicBool::new(false),
            records_dropped: AtomicU64::new(0),
            agg: Mutex::new(AggState::default()),
        }
    }

    /// Entry point for the transport's notification threads.
    fn handle_notification(&self, char_uuid: &str, value: Vec<u8>) {
        match self.mode {
            StreamMode::EveryUpdate => {
                self.push_record(Record::single(char_uuid.to_string(), value));
            }
            StreamMode::Batched => {
                let mut agg = self.agg.lock().expect("aggregation mutex poisoned");
                agg.batch.entry(char_uuid.to_string()).or_default().push(value);
                agg.any_data = true;
            }
            StreamMode::AggregatedLatest => {
                let mut agg = self.agg.lock().expect("aggregation mutex poisoned");
                agg.latest.insert(char_uuid.to_string(), value);
                agg.updated.insert(char_uuid.to_string());
                agg.any_data = true;
            }
        }
    }

    fn push_record(&self, record: Record) {
        let mut queue = self.queue.lock().expect("record queue mutex poisoned");
        if queue.len() >= RECORD_QUEUE_DEPTH {
            queue.pop_front();
            self.overflowed.store(true, Ordering::SeqCst);
            self.records_dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(record);
        self.queue_cond.notify_one();
    }

    /// Pop one queued record, transferring the overflow flag onto it.
    fn pop_record(&self) -> Option<Record> {
        let mut queue = self.queue.lock().expect("record queue mutex poisoned");
        let mut record = queue.pop_front()?;
        drop(queue);
        if self.overflowed.swap(false, Ordering::SeqCst) {
            record.flags.dropped = true;
        }
        Some(record)
    }

    /// Build the record for one rate-interval tick, if anything warrants
    /// emission.
    fn build_tick_record(&self) -> Option<Record> {
        let mut agg = self.agg.lock().expect("aggregation mutex poisoned");
        match self.mode {
            StreamMode::EveryUpdate => None,
            StreamMode::Batched => {
                if agg.batch.is_empty() {
                    return None;
                }
                let batch = std::mem::take(&mut agg.batch);
                Some(Record {
                    timestamp: Utc::now(),
                    values: None,
                    batch_values: Some(batch),
                    flags: RecordFlags::default(),
                })
            }
            StreamMode::AggregatedLatest => {
                // A tick before any data must not emit.
                if !agg.any_data {
                    return None;
                }
                let mut values = BTreeMap::new();
                let mut missing = false;
                for uuid in &self.subscribed {
                    // Never-seen characteristics carry an empty value.
                    values.insert(uuid.clone(), agg.latest.get(uuid).cloned().unwrap_or_default());
                    if !agg.updated.contains(uuid) {
                        missing = true;
                    }
                }
                agg.updated.clear();
                Some(Record {
                    timestamp: Utc::now(),
                    values: Some(values),
                    batch_values: None,
                    flags: RecordFlags {
                        dropped: false,
                        missing,
                    },
                })
            }
        }
    }
}

/// Aggregates notifications from one connection into records.
///
/// Created via [`NotificationEngine::start`]; must be stopped with
/// [`NotificationEngine::stop`] (also done on drop).
pub struct NotificationEngine {
    shared: Arc<EngineShared>,
    conn: Arc<dyn GattConnection>,
    token: CancelToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl NotificationEngine {
    /// Subscribe `subscriptions` on `conn` and start emitting records to
    /// `callback`.
    ///
    /// Characteristic UUIDs are normalised before subscribing. The engine's
    /// lifetime is tied to `parent`: cancelling the parent token stops the
    /// worker (but the caller should still invoke `stop()` for the
    /// unsubscribe handshake).
    ///
    /// # Errors
    ///
    /// Anything the transport's subscribe reports, plus
    /// `TransportError::Protocol` for malformed UUIDs or an empty
    /// characteristic set.
    pub fn start(
        conn: Arc<dyn GattConnection>,
        subscriptions: &[SubscribeOptions],
        mode: StreamMode,
        max_rate: Duration,
        callback: RecordCallback,
        parent: &CancelToken,
    ) -> Result<Self, TransportError> {
        let mut seen = BTreeSet::new();
        for opts in subscriptions {
            for raw in &opts.characteristic_uuids {
                let normal = uuid::normalize(raw)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                seen.insert(normal);
            }
        }
        let subscribed: Vec<String> = seen.into_iter().collect();
        if subscribed.is_empty() {
            return Err(TransportError::Protocol(
                "no characteristics to subscribe".into(),
            ));
        }

        let shared = Arc::new(EngineShared::new(mode, subscribed.clone()));
        let sink: crate::gatt::NotificationSink = {
            let shared = Arc::clone(&shared);
            Arc::new(move |char_uuid: &str, value: Vec<u8>| {
                shared.handle_notification(char_uuid, value);
            })
        };
        conn.subscribe(&subscribed, sink)?;

        let token = parent.child();
        let worker = {
            let shared = Arc::clone(&shared);
            let token = token.clone();
            thread::Builder::new()
                .name("gatt-notify".into())
                .spawn(move || run_worker(&shared, &token, &callback, mode, max_rate))
                .map_err(|e| TransportError::Protocol(format!("spawn failed: {e}")))?
        };

        log::debug!(
            "notification engine started: mode={}, max_rate={:?}, chars={:?}",
            mode,
            max_rate,
            subscribed
        );

        Ok(Self {
            shared,
            conn,
            token,
            worker: Mutex::new(Some(worker)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Records discarded by queue overflow so far.
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.shared.records_dropped.load(Ordering::Relaxed)
    }

    /// Stop the timer, unsubscribe, and join the worker. Idempotent.
    ///
    /// Pending batched content is discarded, not flushed.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        // Wake a callback-side wait immediately.
        self.shared.queue_cond.notify_all();
        if let Some(worker) = self
            .worker
            .lock()
            .expect("notification worker mutex poisoned")
            .take()
        {
            let _ = worker.join();
        }
        if let Err(e) = self.conn.unsubscribe_all() {
            log::warn!("unsubscribe during shutdown failed: {}", e);
        }
        log::debug!("notification engine stopped");
    }
}

impl Drop for NotificationEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    shared: &EngineShared,
    token: &CancelToken,
    callback: &RecordCallback,
    mode: StreamMode,
    max_rate: Duration,
) {
    match mode {
        StreamMode::EveryUpdate => {
            while !token.is_cancelled() {
                while let Some(record) = shared.pop_record() {
                    callback(record);
                    if token.is_cancelled() {
                        return;
                    }
                }
                let queue = shared.queue.lock().expect("record queue mutex poisoned");
                if queue.is_empty() {
                    // Bounded wait keeps cancellation latency at one interval.
                    let _ = shared
                        .queue_cond
                        .wait_timeout(queue, DEFAULT_POLL_TIMEOUT)
                        .expect("record queue mutex poisoned");
                }
            }
        }
        StreamMode::Batched | StreamMode::AggregatedLatest => {
            let mut next_tick = Instant::now() + max_rate;
            while !token.is_cancelled() {
                let now = Instant::now();
                if now < next_tick && token.wait_timeout(next_tick - now) {
                    return;
                }
                next_tick += max_rate;
                if let Some(record) = shared.build_tick_record() {
                    shared.push_record(record);
                }
                while let Some(record) = shared.pop_record() {
                    callback(record);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(mode: StreamMode, chars: &[&str]) -> EngineShared {
        EngineShared::new(mode, chars.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_every_update_one_record_per_notification() {
        let shared = shared(StreamMode::EveryUpdate, &["2a37"]);
        shared.handle_notification("2a37", vec![0x01]);
        shared.handle_notification("2a37", vec![0x02]);

        let first = shared.pop_record().unwrap();
        assert_eq!(first.values.as_ref().unwrap()["2a37"], vec![0x01]);
        assert_eq!(first.values.as_ref().unwrap().len(), 1);
        assert!(first.batch_values.is_none());

        let second = shared.pop_record().unwrap();
        assert_eq!(second.values.as_ref().unwrap()["2a37"], vec![0x02]);
        assert!(shared.pop_record().is_none());
    }

    #[test]
    fn test_batched_preserves_arrival_order() {
        let shared = shared(StreamMode::Batched, &["2a37"]);
        shared.handle_notification("2a37", vec![0x0a]);
        shared.handle_notification("2a37", vec![0x0b]);
        shared.handle_notification("2a37", vec![0x0c]);

        let record = shared.build_tick_record().unwrap();
        let batch = record.batch_values.unwrap();
        assert_eq!(batch["2a37"], vec![vec![0x0a], vec![0x0b], vec![0x0c]]);
        assert!(record.values.is_none());

        // The batch was consumed; an empty window emits nothing.
        assert!(shared.build_tick_record().is_none());
    }

    #[test]
    fn test_aggregated_first_tick_without_data_is_silent() {
        let shared = shared(StreamMode::AggregatedLatest, &["2a37", "2a38"]);
        assert!(shared.build_tick_record().is_none());
    }

    #[test]
    fn test_aggregated_missing_carries_last_known() {
        let shared = shared(StreamMode::AggregatedLatest, &["2a37", "2a38"]);
        shared.handle_notification("2a37", vec![0x10]);

        let record = shared.build_tick_record().unwrap();
        let values = record.values.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["2a37"], vec![0x10]);
        assert_eq!(values["2a38"], Vec::<u8>::new());
        assert!(record.flags.missing);

        // Next window with no updates at all: every entry is stale.
        let record = shared.build_tick_record().unwrap();
        assert_eq!(record.values.unwrap()["2a37"], vec![0x10]);
        assert!(record.flags.missing);
    }

    #[test]
    fn test_aggregated_full_window_clears_missing() {
        let shared = shared(StreamMode::AggregatedLatest, &["2a37", "2a38"]);
        shared.handle_notification("2a37", vec![0x01]);
        shared.handle_notification("2a38", vec![0x02]);
        let record = shared.build_tick_record().unwrap();
        assert!(!record.flags.missing);
    }

    #[test]
    fn test_queue_overflow_flags_next_emission() {
        let shared = shared(StreamMode::EveryUpdate, &["2a37"]);
        for i in 0..=RECORD_QUEUE_DEPTH {
            shared.handle_notification("2a37", vec![i as u8]);
        }
        assert_eq!(shared.records_dropped.load(Ordering::Relaxed), 1);

        // Oldest record was discarded; the first pop carries the flag.
        let first = shared.pop_record().unwrap();
        assert_eq!(first.values.unwrap()["2a37"], vec![0x01]);
        assert!(first.flags.dropped);

        let second = shared.pop_record().unwrap();
        assert!(!second.flags.dropped);
    }
}
