pub mod backoff;
pub mod checkpoint;
pub mod engine;
pub mod error;
#[cfg(test)]
mod fake_store;
pub mod lease;
pub mod materializer;
pub mod paths;
pub mod processor;
pub mod snapshot;
pub mod stats;
pub mod watcher;
