use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Named counters the engine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    DirectoriesCreated,
    DirectoriesDeleted,
    FilesWritten,
    FilesDeleted,
    SetsReceived,
    SetsProcessed,
    DeletesReceived,
    DeletesProcessed,
}

impl Counter {
    const ALL: [Counter; 8] = [
        Counter::DirectoriesCreated,
        Counter::DirectoriesDeleted,
        Counter::FilesWritten,
        Counter::FilesDeleted,
        Counter::SetsReceived,
        Counter::SetsProcessed,
        Counter::DeletesReceived,
        Counter::DeletesProcessed,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Counter::DirectoriesCreated => "directories_created",
            Counter::DirectoriesDeleted => "directories_deleted",
            Counter::FilesWritten => "files_written",
            Counter::FilesDeleted => "files_deleted",
            Counter::SetsReceived => "sets_received",
            Counter::SetsProcessed => "sets_processed",
            Counter::DeletesReceived => "deletes_received",
            Counter::DeletesProcessed => "deletes_processed",
        }
    }
}

/// Increment-only sink handed to the engine at construction.
pub trait Metrics: Send + Sync {
    fn incr(&self, counter: Counter);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _counter: Counter) {}
}

#[derive(Debug, Default)]
pub struct Statistics {
    counters: [AtomicU64; Counter::ALL.len()],
}

impl Statistics {
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.slot()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            values: Counter::ALL.map(|counter| self.get(counter)),
        }
    }
}

impl Metrics for Statistics {
    fn incr(&self, counter: Counter) {
        self.counters[counter.slot()].fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    values: [u64; Counter::ALL.len()],
}

impl StatsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.slot()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        Counter::ALL.iter().map(|counter| (*counter, self.get(*counter)))
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dc: {}, dd: {}, fw: {}, fd: {}, sets: {}/{}, deletes: {}/{}",
            self.get(Counter::DirectoriesCreated),
            self.get(Counter::DirectoriesDeleted),
            self.get(Counter::FilesWritten),
            self.get(Counter::FilesDeleted),
            self.get(Counter::SetsProcessed),
            self.get(Counter::SetsReceived),
            self.get(Counter::DeletesProcessed),
            self.get(Counter::DeletesReceived),
        )
    }
}
