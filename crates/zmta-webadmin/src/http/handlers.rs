use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use tracing::{info, warn};

use super::error::ApiError;
use super::extract::{ApiBody, ApiJson, ApiPath, ApiQuery};
use super::views::{
    Dashboard, MessageView, SearchView, build_dashboard, format_transaction, index_rows,
    indexed_items, log_entries
};
use crate::app::AppState;
use crate::core::{
    Cursor, EventStore, IndexFilter, ParsedQuery, QueueMember, SearchRequest, SuppressionEntry,
    is_queue_id, normalize_term, parse_query, split_queue_id
};

/// Rows shown by the find box for a message-id fragment.
const FIND_LIMIT: u32 = 100;

pub async fn dashboard<S: EventStore>(
    State(state): State<AppState<S>>
) -> Result<Json<Dashboard>, ApiError> {
    let zones = state.queue.fetch_zone_list().await?;
    let names: Vec<String> = zones.iter().map(|zone| zone.name.clone()).collect();
    let counters = state.counters.day_counters(&names).await?;
    let blacklist = state.queue.blacklist().await?;

    Ok(Json(build_dashboard(
        zones,
        counters,
        &state.speeds.snapshot(),
        blacklist.len(),
    )))
}

pub async fn zone<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiPath((zone, kind)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<Vec<(String, String)>>
) -> Result<Json<Value>, ApiError> {
    let counter = state.queue.zone_counter(&zone).await?;
    let queued = state.queue.list_queued(&zone, &kind, &query).await?;

    let (items, queue) = match queued {
        Value::Object(mut queue) => {
            let items = match queue.remove("list") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            (items, queue)
        }
        _ => (Vec::new(), Map::new()),
    };

    Ok(Json(json!({
        "zone": zone,
        "type": kind,
        "counter": counter,
        "is_active": kind != "deferred",
        "is_deferred": kind == "deferred",
        "queue": queue,
        "items": indexed_items(items, false),
    })))
}

/// Delivery log from the store plus live queue data. When the queue no
/// longer has the message the error document still carries the log.
pub async fn message<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiPath(raw_id): ApiPath<String>
) -> Response {
    let (id, seq) = split_queue_id(&raw_id);

    let events = match state.store.events_for(id).await {
        Ok(events) => events,
        Err(err) => {
            warn!("delivery log lookup failed: id={id}, error={err}");
            Vec::new()
        }
    };

    match state.queue.message(id).await {
        Ok(message) => Json(MessageView::build(
            id,
            seq,
            &events,
            message,
            OffsetDateTime::now_utc(),
        ))
        .into_response(),
        Err(err) => {
            let (log, seq_to) = log_entries(&events, seq);
            let mut extra = Map::new();
            extra.insert("id".to_string(), json!(id));
            extra.insert("seq".to_string(), json!(seq));
            extra.insert("seq_to".to_string(), seq_to.unwrap_or(Value::Null));
            extra.insert("log".to_string(), json!(log));
            ApiError::from(err).into_response_with(extra)
        }
    }
}

pub async fn smtp_log<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiPath((id, seq)): ApiPath<(String, String)>
) -> Result<Json<Value>, ApiError> {
    let message = state.queue.message(&id).await?;
    let QueueMember { id: member_id, deferred, .. } = message
        .messages
        .into_iter()
        .find(|member| member.seq == seq)
        .ok_or_else(|| ApiError::NotFound("Log not found".to_string()))?;

    let transaction = deferred
        .map(|deferred| format_transaction(&deferred.log))
        .unwrap_or_default();

    let id = if member_id.is_empty() { id } else { member_id };
    Ok(Json(json!({
        "id": id,
        "seq": seq,
        "transaction": transaction,
    })))
}

/// Streams the raw message from the queue service.
pub async fn fetch<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiPath(id): ApiPath<String>
) -> Result<Response, ApiError> {
    let upstream = state.queue.fetch_stream(&id).await?;
    let body = Body::from_stream(upstream.bytes_stream());
    Ok(([(header::CONTENT_TYPE, "message/rfc822")], body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct FindForm {
    #[serde(default)]
    id: String,
}

pub async fn find<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiJson(form): ApiJson<FindForm>
) -> Result<Response, ApiError> {
    let term = normalize_term(&form.id);
    if term.is_empty() {
        return Ok(Redirect::to("/").into_response());
    }
    if is_queue_id(&term) {
        return Ok(Redirect::to(&format!("/message/{term}")).into_response());
    }

    let request = SearchRequest {
        filter: IndexFilter { text: Some(term.clone()), ..IndexFilter::default() },
        limit: Some(FIND_LIMIT),
        ..SearchRequest::default()
    };
    let page = state.search.search(&request).await?;
    if page.rows.is_empty() {
        return Err(ApiError::NotFound("Nothing found".to_string()));
    }

    Ok(Json(json!({ "query": term, "items": index_rows(&page.rows, 1) })).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    cursor: Option<String>,
    limit: Option<u32>,
    page: Option<u32>,
}

pub async fn search<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiQuery(params): ApiQuery<SearchParams>
) -> Result<Response, ApiError> {
    let query = params.q.unwrap_or_default();

    let filter = match parse_query(&query)? {
        ParsedQuery::Lookup(id) => {
            return Ok(Redirect::to(&format!("/message/{id}")).into_response());
        }
        ParsedQuery::Filter(filter) => filter,
    };

    let cursor = params
        .cursor
        .as_deref()
        .filter(|cursor| !cursor.is_empty())
        .map(Cursor::decode)
        .transpose()?;

    let request = SearchRequest { filter, cursor, limit: params.limit, page: params.page };
    let page = state.search.search(&request).await?;
    Ok(Json(SearchView::new(&query, page)).into_response())
}

pub async fn send<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiBody(body): ApiBody
) -> Result<Json<Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("Empty message".to_string()));
    }
    let size = body.len();
    let message = state.queue.send_raw(body).await?;
    info!("raw message submitted: size={size}");
    Ok(Json(json!({ "message": message })))
}

#[derive(Debug, Deserialize)]
pub struct MessageCommand {
    #[serde(default)]
    id: String,
    #[serde(default)]
    seq: Option<String>,
}

impl MessageCommand {
    fn target(&self) -> Result<(&str, Option<&str>), ApiError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ApiError::BadRequest("Missing message id".to_string()));
        }
        let seq = self.seq.as_deref().map(str::trim).filter(|seq| !seq.is_empty());
        Ok((id, seq))
    }
}

pub async fn delete<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiJson(command): ApiJson<MessageCommand>
) -> Result<Redirect, ApiError> {
    let (id, seq) = command.target()?;
    state.queue.delete_message(id, seq).await?;
    info!("message deleted: id={}, seq={}", id, seq.unwrap_or("-"));
    Ok(Redirect::to(&format!("/message/{id}")))
}

pub async fn send_now<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiJson(command): ApiJson<MessageCommand>
) -> Result<Redirect, ApiError> {
    let (id, seq) = command.target()?;
    state.queue.send_now(id, seq).await?;
    info!("message rescheduled: id={}, seq={}", id, seq.unwrap_or("-"));
    Ok(Redirect::to(&format!("/message/{id}")))
}

pub async fn blacklist<S: EventStore>(
    State(state): State<AppState<S>>
) -> Result<Json<Value>, ApiError> {
    let list = state.queue.blacklist().await?;
    Ok(Json(json!({ "items": indexed_items(list, true) })))
}

pub async fn blacklist_add<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiJson(entry): ApiJson<Value>
) -> Result<Json<Value>, ApiError> {
    if !entry.as_object().is_some_and(|entry| !entry.is_empty()) {
        return Err(ApiError::BadRequest("Empty values".to_string()));
    }
    let result = state.queue.add_to_blacklist(&entry).await?;
    Ok(Json(json!({ "result": result })))
}

#[derive(Debug, Deserialize)]
pub struct IdForm {
    #[serde(default)]
    id: String,
}

pub async fn blacklist_delete<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiJson(form): ApiJson<IdForm>
) -> Result<Json<Value>, ApiError> {
    let id = form.id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("Empty values".to_string()));
    }
    let result = state.queue.remove_from_blacklist(id).await?;
    Ok(Json(json!({ "result": result })))
}

pub async fn suppression_list<S: EventStore>(
    State(state): State<AppState<S>>
) -> Result<Json<Value>, ApiError> {
    let list = state.queue.suppression_list().await?;
    Ok(Json(json!({ "items": indexed_items(list, true) })))
}

#[derive(Debug, Deserialize)]
pub struct SuppressionForm {
    #[serde(default)]
    address: String,
    #[serde(default)]
    domain: String,
}

pub async fn suppression_add<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiJson(form): ApiJson<SuppressionForm>
) -> Result<Json<Value>, ApiError> {
    let entry = SuppressionEntry {
        address: form.address.trim().to_string(),
        domain: form.domain.trim().to_string(),
    };
    if entry.address.is_empty() && entry.domain.is_empty() {
        return Err(ApiError::BadRequest("Empty values".to_string()));
    }

    let result = state.queue.add_to_suppression_list(&entry).await?;
    let notice = result
        .pointer("/suppressed/id")
        .and_then(zmta_proto::scalar_text)
        .map(|id| format!("New entry added with id {id}"));
    Ok(Json(json!({ "result": result, "message": notice })))
}

pub async fn suppression_delete<S: EventStore>(
    State(state): State<AppState<S>>,
    ApiJson(form): ApiJson<IdForm>
) -> Result<Json<Value>, ApiError> {
    let id = form.id.trim();
    if id.is_empty() {
        return Err(ApiError::BadRequest("Empty values".to_string()));
    }

    let result = state.queue.delete_from_suppression_list(id).await?;
    let notice = result
        .get("deleted")
        .and_then(zmta_proto::scalar_text)
        .map(|id| format!("Entry deleted with id {id}"));
    Ok(Json(json!({ "result": result, "message": notice })))
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".to_string())
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::Rejected {
        status: StatusCode::METHOD_NOT_ALLOWED,
        message: "Method not allowed".to_string(),
    }
}
