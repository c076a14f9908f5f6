//! Ring buffer of recent log lines

use super::LogLine;
use std::collections::VecDeque;
use std::sync::Arc;

/// Fixed-capacity history, oldest line evicted first
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<Arc<LogLine>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full
    pub fn push(&mut self, line: Arc<LogLine>) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Copy of the buffered lines, oldest first
    pub fn snapshot(&self) -> Vec<Arc<LogLine>> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.lines.front().map(|l| l.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.lines.back().map(|l| l.seq)
    }
}
