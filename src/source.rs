//! One monitored log stream and the coordination between its tailer,
//! history, broadcaster and subscribers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::history::HistoryBuffer;
use crate::hub::BroadcastHub;
use crate::reader::TailReader;
use crate::subscribers::{ChannelSubscriber, Subscriber, SubscriberId, SubscriberSet};
use crate::{Line, Published};

/// Turns a source name into the identifier used in URLs.
pub fn endpoint_for(name: &str) -> String {
    name.replace(' ', "-")
}

/// Lifecycle of a source's monitoring.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SourceState {
    /// Registered, the file isn't being followed yet.
    Starting = 0,
    /// Following the file.
    Live = 1,
    /// Following stopped for good; no further lines will be published.
    Failed = 2,
}

impl SourceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SourceState::Starting,
            1 => SourceState::Live,
            _ => SourceState::Failed,
        }
    }
}

/// A monitored file together with its history window and subscribers.
pub struct Source {
    name: String,
    endpoint: String,
    path: PathBuf,
    history: HistoryBuffer,
    subscribers: Arc<SubscriberSet>,
    subscriber_buffer: usize,
    state: AtomicU8,
}

impl Source {
    /// `history_lines` bounds the replay window, `subscriber_buffer` the
    /// number of undelivered lines a subscriber may fall behind before it is
    /// dropped.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        history_lines: usize,
        subscriber_buffer: usize,
    ) -> Self {
        let name = name.into();
        Source {
            endpoint: endpoint_for(&name),
            name,
            path: path.into(),
            history: HistoryBuffer::new(history_lines),
            subscribers: Arc::new(SubscriberSet::new()),
            subscriber_buffer: subscriber_buffer.max(1),
            state: AtomicU8::new(SourceState::Starting as u8),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    pub fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Registers a new subscriber and returns its history replay together
    /// with the receiving end of its live feed.
    ///
    /// The snapshot and the registration happen under the history lock, so
    /// the replay is followed by exactly the lines published after it: none
    /// are repeated and none are skipped. If the source has stopped, the
    /// subscription still carries the replay but its live feed is already
    /// closed.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);

        let (replay, id) = self.history.snapshot_with(|watermark| {
            let subscriber = Arc::new(ChannelSubscriber::new(watermark, tx));
            let id = subscriber.id();
            self.subscribers.add(subscriber);
            id
        });

        debug!(
            source = %self.endpoint,
            subscriber = %id,
            replay = replay.len(),
            "subscriber joined"
        );

        Subscription {
            id,
            replay,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Wires up the publishing side of this source: a [`Publisher`] for the
    /// tailer and the [`BroadcastHub`] consuming what it publishes.
    pub fn pipeline(self: &Arc<Self>, buffer: usize) -> (Publisher, BroadcastHub) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let hub = BroadcastHub::new(self.endpoint.clone(), Arc::clone(&self.subscribers), rx);
        let publisher = Publisher {
            source: Arc::clone(self),
            tx,
        };

        (publisher, hub)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("path", &self.path)
            .field("state", &self.state())
            .field("history", &self.history)
            .field("subscribers", &self.subscribers)
            .finish()
    }
}

/// The broadcast loop for a source has stopped.
#[derive(Debug)]
pub struct HubClosed;

/// Publishing handle of a source, owned by its tailer.
pub struct Publisher {
    source: Arc<Source>,
    tx: mpsc::Sender<Published>,
}

impl Publisher {
    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    /// Records `line` in the history window and hands it to the broadcast
    /// loop, in that order. Empty lines are dropped; returns whether the line
    /// was published.
    pub async fn publish(&self, line: Line) -> Result<bool, HubClosed> {
        if line.is_empty() {
            return Ok(false);
        }

        let seq = self.source.history.append(line.clone());
        self.tx
            .send(Published { seq, line })
            .await
            .map_err(|_| HubClosed)?;

        Ok(true)
    }
}

/// Follows the source's file and publishes every line until the file can no
/// longer be followed.
///
/// Only returns on failure: either the file couldn't be opened, reading it
/// failed, or the change watcher stopped (reported as `Ok(())`).
pub async fn follow(publisher: Publisher, poll_interval: Duration) -> Result<()> {
    let source = Arc::clone(publisher.source());
    let mut reader = TailReader::open(source.path(), poll_interval).await?;

    source.set_state(SourceState::Live);
    info!(
        source = %source.endpoint(),
        path = %source.path().display(),
        "tailing log file"
    );

    while let Some(line) = reader.next_line().await? {
        if publisher.publish(line).await.is_err() {
            break;
        }
    }

    Ok(())
}

/// A subscriber's view of a source: the history it joined with, then every
/// later line.
///
/// Dropping the subscription deregisters the subscriber.
pub struct Subscription {
    id: SubscriberId,
    replay: Vec<Line>,
    rx: mpsc::Receiver<Line>,
    subscribers: Arc<SubscriberSet>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// History lines at the time of joining, oldest first.
    pub fn replay(&self) -> &[Line] {
        &self.replay
    }

    pub fn take_replay(&mut self) -> Vec<Line> {
        std::mem::take(&mut self.replay)
    }

    /// Next live line. `None` once the subscriber was dropped for falling
    /// behind or the source stopped.
    pub async fn recv(&mut self) -> Option<Line> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.remove(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("replay", &self.replay.len())
            .finish()
    }
}
