mod client;
mod node;
mod store;

pub use client::{DEFAULT_ENDPOINT, EtcdClient, Member};
pub use reqwest::StatusCode;
pub use node::{Action, Event, Node};
pub use store::{EventStream, Store, StoreError, codes};
