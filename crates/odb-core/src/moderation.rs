use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::domain::UserId;

// ============== Sliding Window ==============

/// Drop timestamps older than `window` relative to `now`. Timestamps are appended in order.
fn prune(bucket: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(front) = bucket.front() {
        if now.saturating_duration_since(*front) > window {
            bucket.pop_front();
        } else {
            break;
        }
    }
}

/// Remove every bucket whose pruned window is empty. Returns the number of buckets removed.
fn sweep_map(map: &DashMap<UserId, VecDeque<Instant>>, window: Duration, now: Instant) -> usize {
    let before = map.len();
    map.retain(|_, bucket| {
        prune(bucket, window, now);
        !bucket.is_empty()
    });
    before.saturating_sub(map.len())
}

// ============== Rate Limiter ==============

/// Per-user sliding-window post limiter.
///
/// Check and record happen under the user's map shard lock, so two events from the same
/// user can never both observe the last free slot. Different users mostly land on different
/// shards and do not contend.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    posts_per_window: usize,
    window: Duration,
    buckets: DashMap<UserId, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(posts_per_window: usize, window: Duration) -> Self {
        Self {
            posts_per_window,
            window,
            buckets: DashMap::new(),
        }
    }

    pub fn allow(&self, user_id: UserId, now: Instant) -> bool {
        let mut bucket = self.buckets.entry(user_id).or_default();
        prune(&mut bucket, self.window, now);
        if bucket.len() >= self.posts_per_window {
            // Rejected attempts are not recorded.
            return false;
        }
        bucket.push_back(now);
        true
    }

    /// Forget users with no posts inside the window.
    pub fn sweep(&self, now: Instant) -> usize {
        sweep_map(&self.buckets, self.window, now)
    }

    pub fn tracked_users(&self) -> usize {
        self.buckets.len()
    }
}

// ============== Violation Escalation ==============

/// Enforcement action for an accumulated violation count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sanction {
    None,
    Kick,
    Ban,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViolationReport {
    pub count: usize,
    pub action: Sanction,
    pub remaining_to_kick: usize,
    pub remaining_to_ban: usize,
}

/// Per-user counter of recent sanctioned events (deleted messages).
///
/// Only classifies; applying the sanction is the caller's job.
#[derive(Debug)]
pub struct ViolationTracker {
    window: Duration,
    kick_after: usize,
    ban_after: usize,
    logs: DashMap<UserId, VecDeque<Instant>>,
}

impl ViolationTracker {
    pub fn new(window: Duration, kick_after: usize, ban_after: usize) -> Self {
        Self {
            window,
            kick_after,
            ban_after,
            logs: DashMap::new(),
        }
    }

    pub fn record_and_classify(&self, user_id: UserId, now: Instant) -> ViolationReport {
        let count = {
            let mut log = self.logs.entry(user_id).or_default();
            prune(&mut log, self.window, now);
            log.push_back(now);
            log.len()
        };
        self.classify(count)
    }

    fn classify(&self, count: usize) -> ViolationReport {
        let action = if count >= self.ban_after {
            Sanction::Ban
        } else if count >= self.kick_after {
            Sanction::Kick
        } else {
            Sanction::None
        };

        ViolationReport {
            count,
            action,
            remaining_to_kick: self.kick_after.saturating_sub(count),
            remaining_to_ban: self.ban_after.saturating_sub(count),
        }
    }

    pub fn sweep(&self, now: Instant) -> usize {
        sweep_map(&self.logs, self.window, now)
    }

    pub fn tracked_users(&self) -> usize {
        self.logs.len()
    }
}
