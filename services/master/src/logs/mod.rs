//! Task log aggregation.
//!
//! Each allocation has one append-only stream. Appends are sequenced under
//! the stream's lock, written through to the store, and fanned out to
//! followers over a broadcast channel. Records are never changed or
//! reordered once appended.

pub mod query;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use gantry_events::{LogEntry, LogFields, LogRecord};
use gantry_id::{AllocationId, Seq};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::db::{DbError, Store};

pub use query::{LogFilter, LogQuery, SortOrder, DEFAULT_LIMIT, MAX_LIMIT};

/// Live records buffered per stream before a slow follower lags.
const BROADCAST_CAPACITY: usize = 1024;

/// Records buffered per follower.
const FOLLOW_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("unknown allocation: {0}")]
    UnknownAllocation(AllocationId),

    #[error("batch of {size} records exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Store(#[from] DbError),
}

#[derive(Debug, Clone)]
enum StreamItem {
    Record(LogRecord),
    Closed,
}

struct StreamState {
    records: Vec<LogRecord>,
    fields: LogFields,
    next_seq: Seq,
    closed: bool,
}

struct LogStream {
    state: Mutex<StreamState>,
    live: broadcast::Sender<StreamItem>,
}

impl LogStream {
    fn new(records: Vec<LogRecord>, closed: bool) -> Self {
        let mut fields = LogFields::default();
        for record in &records {
            fields.observe(record);
        }
        let next_seq = records
            .iter()
            .map(|r| r.seq)
            .max()
            .map_or(Seq::FIRST, |s| s.next());
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(StreamState {
                records,
                fields,
                next_seq,
                closed,
            }),
            live,
        }
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct LogAggregator {
    store: Store,
    max_batch: usize,
    max_message_bytes: usize,
    streams: RwLock<HashMap<AllocationId, Arc<LogStream>>>,
}

impl LogAggregator {
    pub fn new(store: Store, max_batch: usize, max_message_bytes: usize) -> Self {
        Self {
            store,
            max_batch,
            max_message_bytes,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Start an empty stream for a new allocation.
    pub fn open(&self, allocation_id: AllocationId) {
        self.streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(allocation_id)
            .or_insert_with(|| Arc::new(LogStream::new(Vec::new(), false)));
    }

    /// Sequence and append a batch. Returns the assigned sequence numbers.
    pub fn append(
        &self,
        allocation_id: AllocationId,
        entries: Vec<LogEntry>,
    ) -> Result<Vec<Seq>, LogError> {
        if entries.len() > self.max_batch {
            return Err(LogError::BatchTooLarge {
                size: entries.len(),
                max: self.max_batch,
            });
        }
        let stream = self.stream(allocation_id)?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = stream.state();
        let mut seq = state.next_seq;
        let records: Vec<LogRecord> = entries
            .into_iter()
            .map(|entry| {
                let mut record = LogRecord::from_entry(allocation_id, seq, entry);
                record.truncated = truncate(&mut record.message, self.max_message_bytes);
                seq = seq.next();
                record
            })
            .collect();

        // Nothing is visible until the batch is durable.
        self.store.append_logs(&records)?;
        state.next_seq = seq;

        let seqs = records.iter().map(|r| r.seq).collect();
        for record in records {
            state.fields.observe(&record);
            if !state.closed {
                // No followers is fine.
                let _ = stream.live.send(StreamItem::Record(record.clone()));
            }
            state.records.push(record);
        }
        Ok(seqs)
    }

    pub fn query(
        &self,
        allocation_id: AllocationId,
        query: &LogQuery,
    ) -> Result<Vec<LogRecord>, LogError> {
        let stream = self.stream(allocation_id)?;
        let state = stream.state();
        Ok(query.apply(&state.records))
    }

    /// Distinct values per dimension over everything appended so far.
    pub fn fields(&self, allocation_id: AllocationId) -> Result<LogFields, LogError> {
        let stream = self.stream(allocation_id)?;
        let fields = stream.state().fields.clone();
        Ok(fields)
    }

    /// Matching history in ascending order, then live matching records
    /// until the stream is closed or the receiver is dropped.
    pub fn follow(
        &self,
        allocation_id: AllocationId,
        query: &LogQuery,
    ) -> Result<ReceiverStream<LogRecord>, LogError> {
        let stream = self.stream(allocation_id)?;
        let history_query = LogQuery {
            order: SortOrder::Asc,
            ..query.clone()
        };
        let filter = query.filter.clone();

        // Subscribe under the lock so no record falls between history and live.
        let (history, mut live, mut last, closed) = {
            let state = stream.state();
            let live = stream.live.subscribe();
            let last = state.records.last().map(|r| r.seq);
            (history_query.apply(&state.records), live, last, state.closed)
        };

        let (tx, rx) = mpsc::channel(FOLLOW_BUFFER);
        tokio::spawn(async move {
            for record in history {
                if tx.send(record).await.is_err() {
                    return;
                }
            }
            if closed {
                return;
            }

            loop {
                let item = tokio::select! {
                    item = live.recv() => item,
                    _ = tx.closed() => return,
                };
                let batch = match item {
                    Ok(StreamItem::Record(record)) => vec![record],
                    Ok(StreamItem::Closed) | Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%allocation_id, skipped, "Follower lagged, catching up from memory");
                        let (closed, missed) = {
                            let state = stream.state();
                            (state.closed, missed_since(&state.records, last))
                        };
                        if closed {
                            // Deliver what was missed, then stop.
                            for record in missed.into_iter().filter(|r| filter.matches(r)) {
                                if tx.send(record).await.is_err() {
                                    return;
                                }
                            }
                            return;
                        }
                        missed
                    }
                };

                for record in batch {
                    if last.is_some_and(|l| record.seq <= l) {
                        continue;
                    }
                    last = Some(record.seq);
                    if filter.matches(&record) && tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Mark the stream finished and drop it from memory. Followers drain
    /// and end; later reads go to the store.
    pub fn close(&self, allocation_id: AllocationId) {
        let Some(stream) = self
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&allocation_id)
        else {
            return;
        };
        let mut state = stream.state();
        if !state.closed {
            state.closed = true;
            let _ = stream.live.send(StreamItem::Closed);
            debug!(%allocation_id, records = state.records.len(), "Log stream closed");
        }
    }

    /// Streams held in memory.
    pub fn resident(&self) -> usize {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The in-memory stream of a live allocation, loaded from the store on
    /// first use. Terminal allocations get a detached copy that is not kept.
    fn stream(&self, allocation_id: AllocationId) -> Result<Arc<LogStream>, LogError> {
        if let Some(stream) = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&allocation_id)
        {
            return Ok(stream.clone());
        }

        let Some(allocation) = self.store.load_allocation(&allocation_id)? else {
            return Err(LogError::UnknownAllocation(allocation_id));
        };
        let records = self.store.load_logs(&allocation_id)?;
        if allocation.is_terminal() {
            return Ok(Arc::new(LogStream::new(records, true)));
        }
        let stream = Arc::new(LogStream::new(records, false));

        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        Ok(streams.entry(allocation_id).or_insert(stream).clone())
    }
}

fn missed_since(records: &[LogRecord], last: Option<Seq>) -> Vec<LogRecord> {
    records
        .iter()
        .filter(|r| last.is_none_or(|l| r.seq > l))
        .cloned()
        .collect()
}

/// Cut `message` to at most `max` bytes on a character boundary.
fn truncate(message: &mut String, max: usize) -> bool {
    if message.len() <= max {
        return false;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
    warn!(max_bytes = max, "Truncated oversized log message");
    true
}
