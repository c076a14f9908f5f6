//! Output broadcaster - fans server output out to log subscribers.
//!
//! Every published line gets the next sequence number, is appended to the
//! history buffer and is offered to each subscriber's bounded queue, all in
//! one critical section. Registration snapshots the history and inserts the
//! subscriber in the same critical section, so a new subscriber sees the
//! replay followed by live lines with no gap and no duplicate.
//!
//! Delivery never waits. A subscriber whose queue is full is dropped; the
//! server's output is never slowed down by a slow reader.

use super::{LineSplitter, LogBuffer, LogLine, LogStream};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Identity of a registered subscriber
pub type SubscriberId = u64;

const READ_CHUNK: usize = 4096;

/// Tuning for the broadcaster
#[derive(Debug, Clone)]
pub struct BroadcasterOptions {
    /// Lines kept for replay
    pub history_limit: usize,

    /// Per-subscriber backlog before the subscriber is dropped
    pub subscriber_queue: usize,

    /// Longest line before it is cut
    pub max_line_bytes: usize,

    /// Idle time after which a partial line is published anyway (zero disables)
    pub partial_flush: Duration,
}

impl Default for BroadcasterOptions {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            subscriber_queue: 256,
            max_line_bytes: 8192,
            partial_flush: Duration::from_millis(250),
        }
    }
}

struct BroadcastState {
    next_seq: u64,
    next_subscriber: SubscriberId,
    history: LogBuffer,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<LogLine>>>,
}

struct Shared {
    options: BroadcasterOptions,
    state: Mutex<BroadcastState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: SubscriberId) -> bool {
        self.lock().subscribers.remove(&id).is_some()
    }

    fn contains(&self, id: SubscriberId) -> bool {
        self.lock().subscribers.contains_key(&id)
    }
}

/// Fans log lines out to any number of subscribers
#[derive(Clone)]
pub struct OutputBroadcaster {
    shared: Arc<Shared>,
}

impl OutputBroadcaster {
    pub fn new(options: BroadcasterOptions) -> Self {
        let history = LogBuffer::new(options.history_limit);
        Self {
            shared: Arc::new(Shared {
                options,
                state: Mutex::new(BroadcastState {
                    next_seq: 1,
                    next_subscriber: 1,
                    history,
                    subscribers: HashMap::new(),
                }),
            }),
        }
    }

    pub fn options(&self) -> &BroadcasterOptions {
        &self.shared.options
    }

    /// Publish one line and return its sequence number
    pub fn publish(&self, stream: LogStream, text: impl Into<String>) -> u64 {
        let mut state = self.shared.lock();

        let seq = state.next_seq;
        state.next_seq += 1;

        let line = Arc::new(LogLine {
            seq,
            timestamp: Utc::now(),
            stream,
            text: text.into(),
        });
        state.history.push(Arc::clone(&line));

        let mut dropped = Vec::new();
        for (id, sender) in &state.subscribers {
            match sender.try_send(Arc::clone(&line)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, seq, "Dropping log subscriber: queue full");
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = id, "Removing closed log subscriber");
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            state.subscribers.remove(&id);
        }

        seq
    }

    /// Register a subscriber. The subscription yields the current history
    /// first, then live lines.
    pub fn subscribe(&self) -> Subscription {
        let capacity = self.shared.options.subscriber_queue.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let mut state = self.shared.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        let replay: VecDeque<Arc<LogLine>> = state.history.snapshot().into();
        state.subscribers.insert(id, tx);
        drop(state);

        tracing::debug!(subscriber = id, replay = replay.len(), "Log subscriber registered");

        Subscription {
            id,
            replay,
            receiver: rx,
            owner: Arc::downgrade(&self.shared),
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.shared.remove(id);
        if removed {
            tracing::debug!(subscriber = id, "Log subscriber unregistered");
        }
        removed
    }

    /// Whether `id` is still registered. False once a slow subscriber has
    /// been dropped.
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.shared.contains(id)
    }

    /// Buffered history, oldest first
    pub fn history(&self) -> Vec<Arc<LogLine>> {
        self.shared.lock().history.snapshot()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Sequence number of the most recently published line
    pub fn last_sequence(&self) -> Option<u64> {
        let state = self.shared.lock();
        (state.next_seq > 1).then(|| state.next_seq - 1)
    }

    /// Read `reader` to EOF, publishing each line.
    ///
    /// A partial line that stays idle for `partial_flush` is published as is,
    /// so console prompts without a trailing newline still show up.
    pub async fn drain<R>(&self, stream: LogStream, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let partial_flush = self.shared.options.partial_flush;
        let mut splitter = LineSplitter::new(self.shared.options.max_line_bytes);
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let read = if splitter.has_pending() && !partial_flush.is_zero() {
                match tokio::time::timeout(partial_flush, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        if let Some(line) = splitter.flush() {
                            self.publish(stream, line);
                        }
                        continue;
                    }
                }
            } else {
                reader.read(&mut buf).await
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        self.publish(stream, line);
                    }
                }
                Err(e) => {
                    tracing::warn!("Error reading server {}: {}", stream, e);
                    break;
                }
            }
        }

        if let Some(line) = splitter.flush() {
            self.publish(stream, line);
        }

        tracing::debug!("Server {} drain finished", stream);
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterOptions::default())
    }
}

/// A registered log subscriber.
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    id: SubscriberId,
    replay: VecDeque<Arc<LogLine>>,
    receiver: mpsc::Receiver<Arc<LogLine>>,
    owner: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Replay lines not yet consumed
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Next line: replay first, then live.
    ///
    /// Returns `None` once the broadcaster has dropped this subscriber (or
    /// is gone) and the remaining backlog is consumed.
    pub async fn recv(&mut self) -> Option<Arc<LogLine>> {
        if let Some(line) = self.replay.pop_front() {
            return Some(line);
        }
        self.receiver.recv().await
    }

    /// Like [`recv`](Self::recv) but never waits
    pub fn try_recv(&mut self) -> Option<Arc<LogLine>> {
        if let Some(line) = self.replay.pop_front() {
            return Some(line);
        }
        self.receiver.try_recv().ok()
    }

    /// Whether the broadcaster still delivers to this subscription
    pub fn is_registered(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|shared| shared.contains(self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.owner.upgrade() {
            if shared.remove(self.id) {
                tracing::debug!(subscriber = self.id, "Log subscriber released");
            }
        }
    }
}
