//! Per-command response accounting.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for one command id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    /// Responses matched in time
    pub normal: u64,
    /// Responses that arrived after their request was settled
    pub delayed: u64,
    /// Requests that hit their deadline
    pub timeouts: u64,
    /// Sum of round-trip times of normal responses
    pub total_latency: Duration,
    /// Largest round-trip time seen
    pub max_latency: Duration,
}

impl CommandStats {
    /// Mean round-trip time of normal responses
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.normal == 0 {
            None
        } else {
            Some(self.total_latency / self.normal as u32)
        }
    }
}

/// Response statistics shared by every peer of a node
#[derive(Debug, Default)]
pub struct ResponseStats {
    commands: DashMap<u8, CommandStats>,
    delayed_total: AtomicU64,
}

impl ResponseStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a response matched after `latency`
    pub fn record_normal(&self, command: u8, latency: Duration) {
        let mut entry = self.commands.entry(command).or_default();
        entry.normal += 1;
        entry.total_latency += latency;
        if latency > entry.max_latency {
            entry.max_latency = latency;
        }
    }

    /// Record a late or unknown response
    pub fn record_delayed(&self, command: u8) {
        self.commands.entry(command).or_default().delayed += 1;
        self.delayed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that reached its deadline
    pub fn record_timeout(&self, command: u8) {
        self.commands.entry(command).or_default().timeouts += 1;
    }

    /// Counters for one command
    pub fn command(&self, command: u8) -> CommandStats {
        self.commands
            .get(&command)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    /// Late responses across all commands
    pub fn delayed_total(&self) -> u64 {
        self.delayed_total.load(Ordering::Relaxed)
    }

    /// Counters of every command seen so far, sorted by id
    pub fn snapshot(&self) -> Vec<(u8, CommandStats)> {
        let mut all: Vec<_> = self
            .commands
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        all.sort_by_key(|(command, _)| *command);
        all
    }
}
