//! Main-thread timer manager
//!
//! The server loop polls with a timeout derived from the earliest deadline
//! here. Tokens are opaque to the manager; the server matches them back to
//! the action (device open retry, idle device sweep).

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Timer<T> {
    id: TimerId,
    deadline: Instant,
    token: T,
}

#[derive(Debug)]
pub struct TimerManager<T> {
    timers: Vec<Timer<T>>,
    next_id: u64,
}

impl<T> Default for TimerManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerManager<T> {
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn arm(&mut self, deadline: Instant, token: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.push(Timer {
            id,
            deadline,
            token,
        });
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// The earliest pending deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// Removes and returns all timers that have fired, in deadline order.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired: Vec<Timer<T>> = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline <= now {
                expired.push(self.timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
        expired.sort_by_key(|t| t.deadline);
        expired.into_iter().map(|t| t.token).collect()
    }
}
