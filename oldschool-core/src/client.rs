use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::node::Event;
use crate::store::{EventStream, Store, StoreError, codes};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4001";

const KEYS_PREFIX: [&str; 2] = ["v2", "keys"];
const MEMBERS_PREFIX: [&str; 2] = ["v2", "members"];

/// etcd v2 client with endpoint failover.
#[derive(Clone)]
pub struct EtcdClient {
    http: Client,
    endpoints: Arc<Vec<Url>>,
    active: Arc<AtomicUsize>,
}

impl EtcdClient {
    pub fn new(endpoints: Vec<Url>) -> Result<Self, StoreError> {
        if endpoints.is_empty() {
            return Err(StoreError::NoEndpoints);
        }
        Ok(Self {
            http: Client::new(),
            endpoints: Arc::new(endpoints),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_endpoints(endpoints: &[&str]) -> Result<Self, StoreError> {
        let parsed = endpoints
            .iter()
            .map(|raw| Url::parse(raw.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(parsed)
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    pub async fn members(&self) -> Result<Vec<Member>, StoreError> {
        let response = self
            .send_with_failover(&MEMBERS_PREFIX, "/", |http, url| http.get(url))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http { status, body });
        }
        let payload: MembersResponse = response.json().await?;
        Ok(payload.members)
    }

    /// Replaces the endpoint list with the client URLs the cluster advertises.
    pub async fn sync_cluster(&mut self) -> Result<Vec<Url>, StoreError> {
        let members = self.members().await?;
        let discovered: Vec<Url> = members
            .iter()
            .flat_map(|member| member.client_urls.iter())
            .filter_map(|raw| match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(url = %raw, error = %err, "ignoring unparsable member client url");
                    None
                }
            })
            .collect();
        if !discovered.is_empty() {
            self.endpoints = Arc::new(discovered);
            self.active = Arc::new(AtomicUsize::new(0));
        }
        Ok(self.endpoints.to_vec())
    }

    async fn wait_for_change(
        &self,
        key: &str,
        mut wait_index: u64,
        recursive: bool,
    ) -> Result<Event, StoreError> {
        loop {
            let response = self
                .send_with_failover(&KEYS_PREFIX, key, |http, mut url| {
                    {
                        let mut query = url.query_pairs_mut();
                        query.append_pair("wait", "true");
                        if recursive {
                            query.append_pair("recursive", "true");
                        }
                        if wait_index > 0 {
                            query.append_pair("waitIndex", &wait_index.to_string());
                        }
                    }
                    http.get(url)
                })
                .await?;
            let header_index = IndexHeaders::from_headers(response.headers()).etcd_index;
            match Self::handle_response(response, key, wait_index).await? {
                Some(event) => return Ok(event),
                // The server ends idle long-polls with an empty body.
                None => {
                    // A "from now" poll must not lose changes made before the next one.
                    if wait_index == 0 && header_index > 0 {
                        wait_index = header_index.saturating_add(1);
                    }
                    debug!(key, wait_index, "long-poll expired, re-issuing");
                }
            }
        }
    }

    async fn request_event<F>(&self, key: &str, build: F) -> Result<Event, StoreError>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let response = self.send_with_failover(&KEYS_PREFIX, key, build).await?;
        let status = response.status();
        Self::handle_response(response, key, 0)
            .await?
            .ok_or(StoreError::Http {
                status,
                body: String::new(),
            })
    }

    async fn send_with_failover<F>(
        &self,
        prefix: &[&str],
        key: &str,
        build: F,
    ) -> Result<Response, StoreError>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let count = self.endpoints.len();
        if count == 0 {
            return Err(StoreError::NoEndpoints);
        }
        let start = self.active.load(Ordering::Relaxed) % count;
        for offset in 0..count {
            let slot = (start + offset) % count;
            let endpoint = &self.endpoints[slot];
            let url = endpoint_url(endpoint, prefix, key)?;
            let last = offset + 1 == count;
            match build(&self.http, url).send().await {
                Ok(response) if response.status().is_server_error() && !last => {
                    warn!(
                        %endpoint,
                        status = %response.status(),
                        "store endpoint failed, trying next"
                    );
                }
                Ok(response) => {
                    self.active.store(slot, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(err) if (err.is_connect() || err.is_timeout()) && !last => {
                    warn!(%endpoint, error = %err, "store endpoint unreachable, trying next");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::NoEndpoints)
    }

    async fn handle_response(
        response: Response,
        key: &str,
        wait_index: u64,
    ) -> Result<Option<Event>, StoreError> {
        let status = response.status();
        let meta = IndexHeaders::from_headers(response.headers());
        let body = response.text().await?;
        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(None);
            }
            let mut event: Event = serde_json::from_str(&body)?;
            event.etcd_index = meta.etcd_index;
            event.raft_index = meta.raft_index;
            event.raft_term = meta.raft_term;
            return Ok(Some(event));
        }
        match serde_json::from_str::<ErrorBody>(&body) {
            Ok(error) => Err(error.into_store_error(status, key, wait_index, meta.etcd_index)),
            Err(_) => Err(StoreError::Http { status, body }),
        }
    }
}

#[async_trait]
impl Store for EtcdClient {
    async fn get(&self, key: &str, recursive: bool) -> Result<Event, StoreError> {
        self.request_event(key, |http, mut url| {
            if recursive {
                url.query_pairs_mut().append_pair("recursive", "true");
            }
            http.get(url)
        })
        .await
    }

    async fn watch(
        &self,
        key: &str,
        from_index: u64,
        recursive: bool,
    ) -> Result<EventStream, StoreError> {
        let client = self.clone();
        let key = key.to_string();
        let stream = futures_util::stream::try_unfold(from_index, move |next| {
            let client = client.clone();
            let key = key.clone();
            async move {
                let event = client.wait_for_change(&key, next, recursive).await?;
                let following = event.node.modified_index.saturating_add(1).max(next);
                Ok::<_, StoreError>(Some((event, following)))
            }
        });
        Ok(stream.boxed())
    }

    async fn set(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let event = self
            .request_event(key, |http, url| http.put(url).form(&[("value", value)]))
            .await?;
        Ok(event.node.modified_index)
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let ttl = ttl.map(|ttl| ttl.as_secs().max(1).to_string());
        let event = self
            .request_event(key, |http, url| {
                let mut form = vec![("value", value), ("prevExist", "false")];
                if let Some(ttl) = ttl.as_deref() {
                    form.push(("ttl", ttl));
                }
                http.put(url).form(&form)
            })
            .await?;
        Ok(event.node.modified_index)
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let ttl = ttl.as_secs().max(1).to_string();
        let event = self
            .request_event(key, |http, url| {
                http.put(url).form(&[
                    ("refresh", "true"),
                    ("prevExist", "true"),
                    ("ttl", ttl.as_str()),
                ])
            })
            .await?;
        Ok(event.node.modified_index)
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let event = self.request_event(key, |http, url| http.delete(url)).await?;
        Ok(event.node.modified_index)
    }
}

fn endpoint_url(endpoint: &Url, prefix: &[&str], key: &str) -> Result<Url, StoreError> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| StoreError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(prefix)
        .extend(key.split('/').filter(|segment| !segment.is_empty()));
    Ok(url)
}

#[derive(Debug, Default, Clone, Copy)]
struct IndexHeaders {
    etcd_index: u64,
    raft_index: u64,
    raft_term: u64,
}

impl IndexHeaders {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        };
        Self {
            etcd_index: read("X-Etcd-Index"),
            raft_index: read("X-Raft-Index"),
            raft_term: read("X-Raft-Term"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl ErrorBody {
    fn into_store_error(
        self,
        status: StatusCode,
        key: &str,
        wait_index: u64,
        header_index: u64,
    ) -> StoreError {
        let index = if self.index > 0 {
            self.index
        } else {
            header_index
        };
        match self.error_code {
            codes::KEY_NOT_FOUND => StoreError::KeyNotFound {
                key: key.to_string(),
                index,
            },
            codes::EVENT_INDEX_CLEARED => StoreError::HistoryExhausted {
                requested: wait_index,
                index,
            },
            codes::NODE_EXISTS => StoreError::AlreadyExists {
                key: key.to_string(),
                index,
            },
            code => StoreError::Api {
                status,
                code,
                message: self.message,
                cause: self.cause,
                index,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "peerURLs")]
    pub peer_urls: Vec<String>,
    #[serde(default, rename = "clientURLs")]
    pub client_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<Member>,
}
