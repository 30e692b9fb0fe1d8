//! Bounded in-memory queues for log records and track events

use crate::persistence::PersistedState;
use crate::telemetry::{current_timestamp_ms, Batch, LogRecord, QueueKind, Record, TrackEvent};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Current queue lengths, not counting a batch that is being sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSizes {
    pub logs: usize,
    pub track: usize,
}

impl QueueSizes {
    pub fn total(&self) -> usize {
        self.logs + self.track
    }

    pub fn get(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Logs => self.logs,
            QueueKind::Track => self.track,
        }
    }
}

/// Two independent FIFO queues plus the first-queued watermark.
///
/// A batch taken for delivery is held as the queue's in-flight batch until
/// it is completed or restored, so snapshots never lose it.
#[derive(Debug)]
pub struct QueueStore {
    logs: VecDeque<LogRecord>,
    track: VecDeque<TrackEvent>,
    in_flight_logs: Vec<LogRecord>,
    in_flight_track: Vec<TrackEvent>,
    first_queued_at_ms: Option<i64>,
    max_size: usize,
}

impl QueueStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            logs: VecDeque::new(),
            track: VecDeque::new(),
            in_flight_logs: Vec::new(),
            in_flight_track: Vec::new(),
            first_queued_at_ms: None,
            max_size: max_size.max(1),
        }
    }

    /// Add a record to its queue, evicting the oldest entries on overflow.
    /// Returns the number of evicted records.
    pub fn enqueue(&mut self, record: Record) -> usize {
        self.enqueue_at(record, current_timestamp_ms())
    }

    pub fn enqueue_at(&mut self, record: Record, now_ms: i64) -> usize {
        if self.first_queued_at_ms.is_none() {
            self.first_queued_at_ms = Some(now_ms);
        }

        let kind = record.kind();
        let evicted = match record {
            Record::Log(log) => {
                self.logs.push_back(log);
                trim_front(&mut self.logs, self.max_size)
            }
            Record::Track(event) => {
                self.track.push_back(event);
                trim_front(&mut self.track, self.max_size)
            }
        };

        if evicted > 0 {
            warn!(%kind, evicted, "Queue overflow, dropping oldest records");
        }

        evicted
    }

    /// Copy up to `max` records from the front of a queue.
    pub fn peek_batch(&self, kind: QueueKind, max: usize) -> Batch {
        match kind {
            QueueKind::Logs => Batch::Logs(self.logs.iter().take(max).cloned().collect()),
            QueueKind::Track => Batch::Track(self.track.iter().take(max).cloned().collect()),
        }
    }

    /// Drop up to `count` records from the front of a queue.
    pub fn remove_batch(&mut self, kind: QueueKind, count: usize) -> usize {
        match kind {
            QueueKind::Logs => {
                let n = count.min(self.logs.len());
                self.logs.drain(..n);
                n
            }
            QueueKind::Track => {
                let n = count.min(self.track.len());
                self.track.drain(..n);
                n
            }
        }
    }

    /// Move up to `max` records out of a queue for delivery. The batch stays
    /// part of every snapshot until `complete_batch` or `restore_batch`.
    pub fn take_batch(&mut self, kind: QueueKind, max: usize) -> Option<Batch> {
        let batch = match kind {
            QueueKind::Logs => {
                let n = max.min(self.logs.len());
                if n == 0 {
                    return None;
                }
                let taken: Vec<LogRecord> = self.logs.drain(..n).collect();
                self.in_flight_logs = taken.clone();
                Batch::Logs(taken)
            }
            QueueKind::Track => {
                let n = max.min(self.track.len());
                if n == 0 {
                    return None;
                }
                let taken: Vec<TrackEvent> = self.track.drain(..n).collect();
                self.in_flight_track = taken.clone();
                Batch::Track(taken)
            }
        };

        debug!(%kind, count = batch.len(), "Took batch for delivery");
        Some(batch)
    }

    /// The in-flight batch of a queue was delivered.
    pub fn complete_batch(&mut self, kind: QueueKind) {
        match kind {
            QueueKind::Logs => self.in_flight_logs.clear(),
            QueueKind::Track => self.in_flight_track.clear(),
        }
    }

    /// Put a batch back at the front of its queue in its original order.
    /// The size cap still applies, so under pressure the restored (oldest)
    /// records are the first to go. Returns the number of evicted records.
    pub fn restore_batch(&mut self, batch: Batch) -> usize {
        let kind = batch.kind();
        let evicted = match batch {
            Batch::Logs(logs) => {
                self.in_flight_logs.clear();
                for log in logs.into_iter().rev() {
                    self.logs.push_front(log);
                }
                trim_front(&mut self.logs, self.max_size)
            }
            Batch::Track(events) => {
                self.in_flight_track.clear();
                for event in events.into_iter().rev() {
                    self.track.push_front(event);
                }
                trim_front(&mut self.track, self.max_size)
            }
        };

        if self.first_queued_at_ms.is_none() && !self.is_empty() {
            self.first_queued_at_ms = Some(current_timestamp_ms());
        }

        if evicted > 0 {
            warn!(%kind, evicted, "Queue overflow while restoring batch, dropping oldest records");
        }

        evicted
    }

    pub fn sizes(&self) -> QueueSizes {
        QueueSizes {
            logs: self.logs.len(),
            track: self.track.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.track.is_empty()
    }

    fn has_in_flight(&self) -> bool {
        !self.in_flight_logs.is_empty() || !self.in_flight_track.is_empty()
    }

    /// Milliseconds since the epoch at which the oldest unflushed record was
    /// queued.
    pub fn watermark(&self) -> Option<i64> {
        self.first_queued_at_ms
    }

    /// Clear the watermark once both queues and any in-flight batch are gone.
    pub fn clear_watermark_if_drained(&mut self) -> bool {
        if self.is_empty() && !self.has_in_flight() {
            self.first_queued_at_ms = None;
            true
        } else {
            false
        }
    }

    /// Full state of both queues, in-flight records first.
    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            v: PersistedState::VERSION,
            first_queued_at_ms: self.first_queued_at_ms.unwrap_or(0),
            logs: self
                .in_flight_logs
                .iter()
                .chain(self.logs.iter())
                .cloned()
                .collect(),
            track: self
                .in_flight_track
                .iter()
                .chain(self.track.iter())
                .cloned()
                .collect(),
        }
    }

    /// Prepend previously persisted records, oldest first, honouring the cap.
    /// Returns the number of records loaded.
    pub fn hydrate(&mut self, state: PersistedState) -> usize {
        let loaded = state.logs.len() + state.track.len();
        if loaded == 0 {
            return 0;
        }

        for log in state.logs.into_iter().rev() {
            self.logs.push_front(log);
        }
        for event in state.track.into_iter().rev() {
            self.track.push_front(event);
        }
        let evicted = trim_front(&mut self.logs, self.max_size)
            + trim_front(&mut self.track, self.max_size);
        if evicted > 0 {
            warn!(evicted, "Persisted queue exceeds max_queue_size, dropping oldest records");
        }

        let persisted = Some(state.first_queued_at_ms).filter(|ms| *ms > 0);
        self.first_queued_at_ms = match (self.first_queued_at_ms, persisted) {
            (Some(current), Some(loaded)) => Some(current.min(loaded)),
            (None, Some(loaded)) => Some(loaded),
            (current, None) => current.or_else(|| Some(current_timestamp_ms())),
        };

        loaded
    }
}

fn trim_front<T>(queue: &mut VecDeque<T>, max: usize) -> usize {
    let excess = queue.len().saturating_sub(max);
    if excess > 0 {
        queue.drain(..excess);
    }
    excess
}
