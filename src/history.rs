//! Bounded window of the most recent lines of a source.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::Line;

/// Position of a line in a source's publish order. The first line is `1`;
/// `0` means "nothing published yet".
pub type Seq = u64;

struct Window {
    lines: VecDeque<Line>,
    /// Sequence number of the newest line ever appended.
    last_seq: Seq,
}

/// Fixed-capacity FIFO of the last `capacity` lines.
///
/// Appending to a full buffer evicts the oldest line first. Snapshots are
/// taken under the same lock as appends, so a reader never sees a torn or
/// duplicated entry.
pub struct HistoryBuffer {
    capacity: usize,
    window: Mutex<Window>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        HistoryBuffer {
            capacity,
            window: Mutex::new(Window {
                lines: VecDeque::with_capacity(capacity),
                last_seq: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        // A panic while holding the lock can't leave the deque half-updated,
        // so poisoning is ignored.
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends `line`, evicting the oldest entry if the buffer is full, and
    /// returns the sequence number assigned to it.
    ///
    /// Lines are numbered even when the capacity is zero and nothing is
    /// retained.
    pub fn append(&self, line: Line) -> Seq {
        let mut window = self.lock();
        window.last_seq += 1;

        if self.capacity > 0 {
            if window.lines.len() == self.capacity {
                window.lines.pop_front();
            }
            window.lines.push_back(line);
        }

        window.last_seq
    }

    /// Returns the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<Line> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Takes a snapshot and calls `f` with the sequence number of the newest
    /// line it contains, while still excluding concurrent appends.
    ///
    /// Anything `f` registers is therefore ordered strictly between the
    /// snapshot and the next appended line.
    pub fn snapshot_with<T>(&self, f: impl FnOnce(Seq) -> T) -> (Vec<Line>, T) {
        let window = self.lock();
        let lines = window.lines.iter().cloned().collect();
        let out = f(window.last_seq);

        (lines, out)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the newest line appended so far.
    pub fn last_seq(&self) -> Seq {
        self.lock().last_seq
    }
}

impl fmt::Debug for HistoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let window = self.lock();
        f.debug_struct("HistoryBuffer")
            .field("capacity", &self.capacity)
            .field("len", &window.lines.len())
            .field("last_seq", &window.last_seq)
            .finish()
    }
}
