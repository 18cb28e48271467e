//! Sliding window of role-tagged turns.
//!
//! Two zones with different retention policies:
//! 1. **Pinned**: every `system` turn ever appended. Never evicted.
//! 2. **Recent**: the last `retention_limit` non-system turns, in append
//!    order. Older ones are dropped eagerly on append.
//!
//! [`SlidingWindow::get`] returns the pinned zone followed by the recent
//! zone. Eviction is eager, so `get` is a pure read and repeated calls with
//! no intervening append return identical results.

use crate::error::OutOfOrderTurn;
use crate::{DEFAULT_RETENTION_LIMIT, Turn, TurnRole};
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    /// System turns, in original order.
    pinned: Vec<Turn>,
    /// Most recent non-system turns, oldest first.
    recent: VecDeque<Turn>,
    retention_limit: usize,
    /// Sequence of the last appended turn, if any.
    last_sequence: Option<u64>,
    /// Non-system turns dropped so far.
    evicted: usize,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_LIMIT)
    }
}

impl SlidingWindow {
    /// Create a window that keeps at most `retention_limit` non-system turns.
    pub fn new(retention_limit: usize) -> Self {
        Self {
            pinned: Vec::new(),
            recent: VecDeque::with_capacity(retention_limit + 1),
            retention_limit,
            last_sequence: None,
            evicted: 0,
        }
    }

    pub fn retention_limit(&self) -> usize {
        self.retention_limit
    }

    /// Next sequence number [`push`](Self::push) would assign.
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence.map_or(0, |s| s + 1)
    }

    /// Append a turn, assigning it the next sequence number.
    pub fn push(&mut self, role: TurnRole, content: impl Into<String>) -> u64 {
        let sequence = self.next_sequence();
        self.insert(Turn::new(role, content, sequence));
        sequence
    }

    /// Append a pre-built turn. Its sequence must be strictly greater than
    /// that of every turn appended before it.
    pub fn append(&mut self, turn: Turn) -> Result<(), OutOfOrderTurn> {
        if let Some(last) = self.last_sequence
            && turn.sequence <= last
        {
            return Err(OutOfOrderTurn {
                sequence: turn.sequence,
                last,
            });
        }
        self.insert(turn);
        Ok(())
    }

    fn insert(&mut self, turn: Turn) {
        self.last_sequence = Some(turn.sequence);
        if turn.is_system() {
            self.pinned.push(turn);
            return;
        }

        self.recent.push_back(turn);
        while self.recent.len() > self.retention_limit {
            if let Some(old) = self.recent.pop_front() {
                self.evicted += 1;
                trace!("window evicted {} turn #{}", old.role, old.sequence);
            }
        }
    }

    /// All system turns followed by the retained non-system turns, each
    /// group in original order.
    pub fn get(&self) -> Vec<Turn> {
        self.pinned
            .iter()
            .chain(self.recent.iter())
            .cloned()
            .collect()
    }

    /// Number of turns [`get`](Self::get) would return.
    pub fn len(&self) -> usize {
        self.pinned.len() + self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-system turns dropped since the window was created.
    pub fn evicted(&self) -> usize {
        self.evicted
    }
}
