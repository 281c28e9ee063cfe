use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Explanation shown with a message that the queue no longer holds.
pub const NOT_QUEUED_STATUS: &str =
    "Most probably this means that the message was already delivered or bounced";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("Message \"{id}\" is not in queue")]
    NotQueued { id: String, status: &'static str },
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("counter store error: {0}")]
    Counters(#[from] redis::RedisError),
}

/// One delivery zone as listed by the queue service; unknown attributes are
/// passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Active and deferred queue sizes keyed by zone name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneGauges {
    pub active: HashMap<String, u64>,
    pub deferred: HashMap<String, u64>,
}

/// Zone with its live gauges and day counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub name: String,
    pub active: u64,
    pub deferred: u64,
    pub counter_delivered: u64,
    pub counter_bounced: u64,
    pub speed: f64,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct GaugeEntries {
    #[serde(default)]
    entries: Vec<GaugeEntry>,
}

#[derive(Debug, Deserialize)]
struct GaugeEntry {
    key: String,
    #[serde(default)]
    value: u64,
}

#[derive(Debug, Default, Deserialize)]
struct GaugeResponse {
    #[serde(default)]
    active: GaugeEntries,
    #[serde(default)]
    deferred: GaugeEntries,
}

/// Queued message as returned by `GET /message/:id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<QueueMember>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// One recipient (sequence member) of a queued message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMember {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub seq: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<Deferral>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deferral {
    #[serde(default)]
    pub next: Option<i64>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub log: Vec<SmtpLogLine>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmtpLogLine {
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SuppressionEntry {
    pub address: String,
    pub domain: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    list: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct SuppressedBody {
    #[serde(default)]
    suppressed: Vec<Value>,
}

/// Typed client for the queue service HTTP API.
///
/// Every call is a single request; nothing is retried. Non-2xx answers become
/// [`RemoteError::Status`] carrying the service's `error` text when it sent
/// one.
#[derive(Debug, Clone)]
pub struct QueueClient {
    http: Client,
    base: Url,
}

impl QueueClient {
    pub fn new(
        api_server: &str,
        timeout: Duration
    ) -> Result<Self> {
        let base = Url::parse(api_server)
            .with_context(|| format!("invalid api server url: {api_server}"))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base })
    }

    pub async fn list_zones(
        &self,
        include_disabled: bool
    ) -> Result<Vec<Zone>, RemoteError> {
        let mut url = self.url(&["zones"]);
        if include_disabled {
            url.query_pairs_mut().append_pair("includeDisabled", "true");
        }
        self.get_json(url).await
    }

    pub async fn zone_gauges(&self) -> Result<ZoneGauges, RemoteError> {
        // trailing empty segment keeps the `/counter/zone/` form
        let data: GaugeResponse = self.get_json(self.url(&["counter", "zone", ""])).await?;
        Ok(ZoneGauges {
            active: data
                .active
                .entries
                .into_iter()
                .map(|entry| (entry.key, entry.value))
                .collect(),
            deferred: data
                .deferred
                .entries
                .into_iter()
                .map(|entry| (entry.key, entry.value))
                .collect(),
        })
    }

    /// All zones, disabled ones included, with their active and deferred
    /// gauges. Day counters and speed are left at zero.
    pub async fn fetch_zone_list(&self) -> Result<Vec<ZoneSnapshot>, RemoteError> {
        let zones = self.list_zones(true).await?;
        let gauges = self.zone_gauges().await?;

        Ok(zones
            .into_iter()
            .map(|zone| ZoneSnapshot {
                active: gauges.active.get(&zone.name).copied().unwrap_or_default(),
                deferred: gauges.deferred.get(&zone.name).copied().unwrap_or_default(),
                name: zone.name,
                attributes: zone.attributes,
                ..ZoneSnapshot::default()
            })
            .collect())
    }

    pub async fn zone_counter(
        &self,
        zone: &str
    ) -> Result<Value, RemoteError> {
        self.get_json(self.url(&["counter", "zone", zone])).await
    }

    /// Queue listing for one zone; `query` is forwarded as-is so the
    /// service's own pagination keeps working.
    pub async fn list_queued(
        &self,
        zone: &str,
        kind: &str,
        query: &[(String, String)]
    ) -> Result<Value, RemoteError> {
        let mut url = self.url(&["queued", kind, zone]);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        self.get_json(url).await
    }

    pub async fn message(
        &self,
        id: &str
    ) -> Result<QueuedMessage, RemoteError> {
        let url = self.url(&["message", id]);
        let response = self.send(self.http.get(url.clone()), &url).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotQueued {
                id: id.to_string(),
                status: NOT_QUEUED_STATUS,
            });
        }
        decode_json(&url, check_status(response).await?).await
    }

    /// Submits a raw RFC 822 message for delivery.
    pub async fn send_raw(
        &self,
        message: Bytes
    ) -> Result<Value, RemoteError> {
        let url = self.url(&["send-raw"]);
        let response = self.send(self.http.post(url.clone()).body(message), &url).await?;
        decode_json(&url, check_status(response).await?).await
    }

    pub async fn delete_message(
        &self,
        id: &str,
        seq: Option<&str>
    ) -> Result<Value, RemoteError> {
        self.message_command(Method::DELETE, id, seq).await
    }

    /// Forces an immediate delivery attempt.
    pub async fn send_now(
        &self,
        id: &str,
        seq: Option<&str>
    ) -> Result<Value, RemoteError> {
        self.message_command(Method::PUT, id, seq).await
    }

    pub async fn blacklist(&self) -> Result<Vec<Value>, RemoteError> {
        let body: ListBody = self.get_json(self.url(&["blacklist"])).await?;
        Ok(body.list)
    }

    pub async fn add_to_blacklist(
        &self,
        entry: &Value
    ) -> Result<Value, RemoteError> {
        let url = self.url(&["blacklist"]);
        self.send_json(self.http.post(url.clone()).json(entry), &url).await
    }

    pub async fn remove_from_blacklist(
        &self,
        id: &str
    ) -> Result<Value, RemoteError> {
        let mut url = self.url(&["blacklist"]);
        url.query_pairs_mut().append_pair("id", id);
        self.send_json(self.http.delete(url.clone()), &url).await
    }

    pub async fn suppression_list(&self) -> Result<Vec<Value>, RemoteError> {
        let body: SuppressedBody = self.get_json(self.url(&["suppressionlist"])).await?;
        Ok(body.suppressed)
    }

    pub async fn add_to_suppression_list(
        &self,
        entry: &SuppressionEntry
    ) -> Result<Value, RemoteError> {
        let url = self.url(&["suppressionlist"]);
        self.send_json(self.http.post(url.clone()).json(entry), &url).await
    }

    pub async fn delete_from_suppression_list(
        &self,
        id: &str
    ) -> Result<Value, RemoteError> {
        let mut url = self.url(&["suppressionlist"]);
        url.query_pairs_mut().append_pair("id", id);
        self.send_json(self.http.delete(url.clone()), &url).await
    }

    /// Opens the raw message body; the caller streams the response.
    pub async fn fetch_stream(
        &self,
        id: &str
    ) -> Result<Response, RemoteError> {
        let url = self.url(&["fetch", id]);
        let response = self.send(self.http.get(url.clone()), &url).await?;
        check_status(response).await
    }

    async fn message_command(
        &self,
        method: Method,
        id: &str,
        seq: Option<&str>
    ) -> Result<Value, RemoteError> {
        let url = self.url(&["message", id, seq.unwrap_or_default()]);
        self.send_json(self.http.request(method, url.clone()), &url).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url
    ) -> Result<T, RemoteError> {
        let response = self.send(self.http.get(url.clone()), &url).await?;
        decode_json(&url, check_status(response).await?).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url
    ) -> Result<T, RemoteError> {
        let response = self.send(request, url).await?;
        decode_json(url, check_status(response).await?).await
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url
    ) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(|source| RemoteError::Transport {
            url: url.to_string(),
            source,
        })?;
        debug!("queue api call: url={}, status={}", url, response.status());
        Ok(response)
    }

    fn url(
        &self,
        segments: &[&str]
    ) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<ErrorBody>(&body)
        .ok()
        .and_then(|body| body.error)
        .filter(|error| !error.is_empty())
        .unwrap_or_else(|| format!("Invalid response code {status}"));

    Err(RemoteError::Status { status, message })
}

async fn decode_json<T: DeserializeOwned>(
    url: &Url,
    response: Response
) -> Result<T, RemoteError> {
    let body = response.bytes().await.map_err(|source| RemoteError::Transport {
        url: url.to_string(),
        source,
    })?;
    serde_json::from_slice(&body).map_err(|err| RemoteError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::extract::{Path, Query, RawQuery};
    use axum::http::StatusCode;
    use axum::routing::{delete, get, post, put};
    use axum::Json;
    use serde_json::json;

    use super::fake::spawn_queue_service;
    use super::*;

    async fn client(router: Router) -> QueueClient {
        let base = spawn_queue_service(router).await;
        QueueClient::new(&base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn zone_list_merges_gauges() {
        let router = Router::new()
            .route(
                "/zones",
                get(|RawQuery(query): RawQuery| async move {
                    assert_eq!(query.as_deref(), Some("includeDisabled=true"));
                    Json(json!([
                        { "name": "default", "pool": "p1" },
                        { "name": "bulk", "disabled": true }
                    ]))
                }),
            )
            .route(
                "/counter/zone/",
                get(|| async {
                    Json(json!({
                        "active": { "entries": [{ "key": "default", "value": 12 }] },
                        "deferred": { "entries": [
                            { "key": "default", "value": 3 },
                            { "key": "bulk", "value": 7 }
                        ] }
                    }))
                }),
            );

        let zones = client(router).await.fetch_zone_list().await.unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].name, "default");
        assert_eq!((zones[0].active, zones[0].deferred), (12, 3));
        assert_eq!(zones[0].attributes.get("pool"), Some(&json!("p1")));
        assert_eq!((zones[1].active, zones[1].deferred), (0, 7));
    }

    #[tokio::test]
    async fn missing_message_is_not_queued() {
        let router = Router::new().route(
            "/message/{id}",
            get(|Path(id): Path<String>| async move {
                if id == "known" {
                    Ok(Json(json!({
                        "meta": { "from": "a@b" },
                        "messages": [{ "id": "known", "seq": "001",
                            "deferred": { "next": 1, "log": [
                                { "time": 0, "level": "info", "message": "hi" }
                            ] } }]
                    })))
                } else {
                    Err(StatusCode::NOT_FOUND)
                }
            }),
        );
        let client = client(router).await;

        let message = client.message("known").await.unwrap();
        assert_eq!(message.messages[0].seq, "001");
        assert_eq!(message.messages[0].deferred.as_ref().unwrap().log[0].message, "hi");

        let err = client.message("gone").await.unwrap_err();
        assert!(matches!(err, RemoteError::NotQueued { ref id, .. } if id == "gone"));
        assert_eq!(err.to_string(), "Message \"gone\" is not in queue");
    }

    #[tokio::test]
    async fn error_body_is_surfaced() {
        let router = Router::new()
            .route(
                "/message/{id}/",
                delete(|| async {
                    (StatusCode::BAD_REQUEST, Json(json!({ "error": "Locked" })))
                }),
            )
            .route(
                "/message/{id}/{seq}",
                put(|Path((id, seq)): Path<(String, String)>| async move {
                    Json(json!({ "id": id, "seq": seq }))
                }),
            )
            .route("/blacklist", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let client = client(router).await;

        let err = client.delete_message("abc", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::Status { status: 400, .. }));
        assert_eq!(err.to_string(), "Locked");

        let sent = client.send_now("abc", Some("002")).await.unwrap();
        assert_eq!(sent, json!({ "id": "abc", "seq": "002" }));

        let err = client.blacklist().await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid response code 503");
    }

    #[tokio::test]
    async fn queue_listing_forwards_query() {
        let router = Router::new().route(
            "/queued/{kind}/{zone}",
            get(
                |Path((kind, zone)): Path<(String, String)>,
                 Query(query): Query<HashMap<String, String>>| async move {
                    Json(json!({ "kind": kind, "zone": zone, "page": query.get("page") }))
                },
            ),
        );
        let queued = client(router)
            .await
            .list_queued("my zone", "deferred", &[("page".to_string(), "3".to_string())])
            .await
            .unwrap();
        assert_eq!(queued, json!({ "kind": "deferred", "zone": "my zone", "page": "3" }));
    }

    #[tokio::test]
    async fn suppression_list_calls() {
        let router = Router::new().route(
            "/suppressionlist",
            get(|| async { Json(json!({ "suppressed": [{ "id": "s1", "address": "x@y" }] })) })
                .post(|Json(entry): Json<Value>| async move {
                    Json(json!({ "suppressed": { "id": "s2", "address": entry["address"] } }))
                })
                .delete(|Query(query): Query<HashMap<String, String>>| async move {
                    Json(json!({ "deleted": query.get("id") }))
                }),
        );
        let client = client(router).await;

        assert_eq!(client.suppression_list().await.unwrap().len(), 1);
        let added = client
            .add_to_suppression_list(&SuppressionEntry {
                address: "a@b".to_string(),
                domain: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(added["suppressed"]["address"], "a@b");
        let deleted = client.delete_from_suppression_list("s1").await.unwrap();
        assert_eq!(deleted, json!({ "deleted": "s1" }));
    }

    #[tokio::test]
    async fn raw_send_and_transport_failure() {
        let router = Router::new().route(
            "/send-raw",
            post(|body: Bytes| async move { Json(json!({ "id": "q1", "size": body.len() })) }),
        );
        let client = client(router).await;
        let sent = client.send_raw(Bytes::from_static(b"Subject: hi\r\n\r\nbody")).await.unwrap();
        assert_eq!(sent, json!({ "id": "q1", "size": 19 }));

        let closed = QueueClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            closed.list_zones(false).await,
            Err(RemoteError::Transport { .. })
        ));
    }
}
