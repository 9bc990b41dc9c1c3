//! In-memory store used by the engine tests. The feed is scripted per `watch` call, so
//! tests can hand the engine reordered, duplicated or missing events.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use oldschool_core::{Action, Event, EventStream, Node, StatusCode, Store, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    dir: bool,
    value: Option<String>,
    modified: u64,
    created: u64,
}

struct WatchScript {
    events: Vec<Result<Event, StoreError>>,
    close: bool,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history_floor: u64,
    scripts: VecDeque<WatchScript>,
    watch_calls: Vec<u64>,
    get_calls: Vec<String>,
    writes: HashMap<String, Vec<String>>,
    refreshes: usize,
    fail_sets: bool,
}

#[derive(Default)]
pub struct FakeStore {
    state: Mutex<State>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_value(&self, key: &str, value: &str, index: u64) {
        let mut state = self.state.lock().unwrap();
        insert(&mut state, key, Some(value.to_string()), index);
    }

    pub fn put_dir(&self, key: &str, index: u64) {
        let mut state = self.state.lock().unwrap();
        insert(&mut state, key, None, index);
    }

    /// Watches starting below `floor` fail with a cleared-history error.
    pub fn set_history_floor(&self, floor: u64) {
        self.state.lock().unwrap().history_floor = floor;
    }

    pub fn set_index(&self, index: u64) {
        self.state.lock().unwrap().index = index;
    }

    /// Events the next `watch` call yields before idling.
    pub fn push_watch(&self, events: Vec<Result<Event, StoreError>>) {
        self.state.lock().unwrap().scripts.push_back(WatchScript {
            events,
            close: false,
        });
    }

    /// Events the next `watch` call yields before its stream ends.
    pub fn push_watch_then_close(&self, events: Vec<Result<Event, StoreError>>) {
        self.state.lock().unwrap().scripts.push_back(WatchScript {
            events,
            close: true,
        });
    }

    pub fn fail_sets(&self, fail: bool) {
        self.state.lock().unwrap().fail_sets = fail;
    }

    pub fn value(&self, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.entries.get(key).and_then(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    pub fn writes_to(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.writes.get(key).cloned().unwrap_or_default()
    }

    pub fn watch_calls(&self) -> Vec<u64> {
        self.state.lock().unwrap().watch_calls.clone()
    }

    pub fn recursive_gets(&self) -> Vec<String> {
        self.state.lock().unwrap().get_calls.clone()
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().unwrap().refreshes
    }
}

fn insert(state: &mut State, key: &str, value: Option<String>, index: u64) {
    let mut ancestor = String::new();
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        ancestor.push('/');
        ancestor.push_str(segment);
        state.entries.entry(ancestor.clone()).or_insert(Entry {
            dir: true,
            value: None,
            modified: index,
            created: index,
        });
    }
    let created = state
        .entries
        .get(key)
        .map(|entry| entry.created)
        .unwrap_or(index);
    state.entries.insert(
        key.to_string(),
        Entry {
            dir: value.is_none(),
            value,
            modified: index,
            created,
        },
    );
    state.index = state.index.max(index);
}

fn build_node(state: &State, key: &str, recursive: bool, depth: usize) -> Option<Node> {
    let entry = state.entries.get(key)?;
    let mut node = Node {
        key: key.to_string(),
        dir: entry.dir,
        value: entry.value.clone(),
        modified_index: entry.modified,
        created_index: entry.created,
        ..Node::default()
    };
    if entry.dir && (recursive || depth == 0) {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        for child in state.entries.keys() {
            let Some(rest) = child.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            if let Some(mut child_node) = build_node(state, child, recursive, depth + 1) {
                if !recursive {
                    child_node.nodes.clear();
                }
                node.nodes.push(child_node);
            }
        }
    }
    Some(node)
}

fn not_found(key: &str, index: u64) -> StoreError {
    StoreError::KeyNotFound {
        key: key.to_string(),
        index,
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Event, StoreError> {
        let mut state = self.state.lock().unwrap();
        if recursive {
            state.get_calls.push(key.to_string());
        }
        let node = build_node(&state, key, recursive, 0)
            .ok_or_else(|| not_found(key, state.index))?;
        let mut event = Event::new(Action::Get, node);
        event.etcd_index = state.index;
        Ok(event)
    }

    async fn watch(
        &self,
        _key: &str,
        from_index: u64,
        _recursive: bool,
    ) -> Result<EventStream, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.watch_calls.push(from_index);
        if from_index > 0 && from_index < state.history_floor {
            let cleared = StoreError::HistoryExhausted {
                requested: from_index,
                index: state.index,
            };
            return Ok(futures_util::stream::iter(vec![Err(cleared)]).boxed());
        }
        let script = state.scripts.pop_front().unwrap_or(WatchScript {
            events: Vec::new(),
            close: false,
        });
        let events = futures_util::stream::iter(script.events);
        if script.close {
            Ok(events.boxed())
        } else {
            Ok(events.chain(futures_util::stream::pending()).boxed())
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sets {
            return Err(StoreError::Http {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: "set rejected".to_string(),
            });
        }
        let index = state.index + 1;
        insert(&mut state, key, Some(value.to_string()), index);
        state
            .writes
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(index)
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        _ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
                index: state.index,
            });
        }
        let index = state.index + 1;
        insert(&mut state, key, Some(value.to_string()), index);
        Ok(index)
    }

    async fn refresh(&self, key: &str, _ttl: Duration) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let index = state.index;
        let entry = state.entries.get(key).ok_or_else(|| not_found(key, index))?;
        let modified = entry.modified;
        state.refreshes += 1;
        Ok(modified)
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let index = state.index;
        state.entries.remove(key).ok_or_else(|| not_found(key, index))?;
        state.index += 1;
        Ok(state.index)
    }
}

pub fn set_event(key: &str, value: &str, index: u64) -> Event {
    Event::new(Action::Set, Node::file(key, value, index))
}

pub fn mkdir_event(key: &str, index: u64) -> Event {
    Event::new(Action::Set, Node::directory(key, Vec::new(), index))
}

pub fn delete_event(key: &str, dir: bool, index: u64) -> Event {
    let mut node = Node::file(key, "", index);
    node.value = None;
    node.dir = dir;
    Event::new(Action::Delete, node)
}
