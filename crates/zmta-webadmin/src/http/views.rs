use std::collections::HashMap;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::macros::format_description;
use zmta_proto::{Action, scalar_text};

use crate::core::{
    DayCounters, IndexRow, QueueMember, QueuedMessage, SearchPage, SmtpLogLine, StoredEvent,
    TopDomain, ZoneSnapshot
};

const LOG_CONTINUATION_INDENT: usize = 48;

/// `2024-01-01T00:00:00.000Z`
pub fn iso_time(value: OffsetDateTime) -> String {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");
    value
        .to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

/// Milliseconds since the epoch rendered like [`iso_time`]; out of range
/// values fall back to the epoch.
pub fn iso_millis(millis: i64) -> String {
    let value = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    iso_time(value)
}

fn millis_of(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|millis| millis as i64))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldView {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntryView {
    pub time: String,
    pub id: String,
    pub action: Option<String>,
    pub label: Option<&'static str>,
    pub fields: Vec<FieldView>,
}

impl LogEntryView {
    pub fn from_event(event: &StoredEvent) -> Self {
        let id = match &event.seq {
            Some(seq) => format!("{}.{}", event.id, seq),
            None => event.id.clone(),
        };
        let label = event
            .action
            .as_deref()
            .and_then(|action| Action::from_str(action).ok())
            .and_then(|action| action.label());

        let mut fields: Vec<FieldView> = event
            .fields
            .iter()
            .filter_map(|(key, value)| {
                let value = render_field(key, value)?;
                Some(FieldView { key: key.clone(), value })
            })
            .collect();
        fields.sort_by(|a, b| a.key.cmp(&b.key));

        Self {
            time: iso_time(event.t),
            id,
            action: event.action.clone(),
            label,
            fields,
        }
    }
}

fn render_field(
    key: &str,
    value: &Value
) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Array(_) | Value::Object(_) => value.to_string(),
        scalar => scalar_text(scalar)?,
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    Some(match key {
        "size" | "body" => format!("{text} B"),
        "start" | "timer" => {
            let millis = text.parse::<f64>().unwrap_or_default();
            format!("{} sec", millis / 1000.0)
        }
        _ => text.to_string(),
    })
}

/// Delivery log of a message plus, when an `id.seq` was requested, the
/// recipient of that sequence member.
pub fn log_entries(
    events: &[StoredEvent],
    seq: Option<&str>
) -> (Vec<LogEntryView>, Option<Value>) {
    let seq_to = seq.and_then(|seq| {
        events
            .iter()
            .find(|event| event.seq.as_deref() == Some(seq))
            .and_then(|event| event.fields.get("to").cloned())
    });
    (events.iter().map(LogEntryView::from_event).collect(), seq_to)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpamView {
    pub label: &'static str,
    pub text: String,
    pub score: String,
    pub tests: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
    pub index: usize,
    pub seq: String,
    pub label: &'static str,
    pub next_attempt: String,
    pub server_response: String,
    /// Number of SMTP transaction log lines available for this member.
    pub smtp_log: usize,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl MemberView {
    fn new(
        index: usize,
        member: QueueMember
    ) -> Self {
        let QueueMember { id, seq, deferred, mut rest } = member;
        rest.insert("id".to_string(), Value::String(id));

        match deferred {
            Some(deferred) => Self {
                index,
                seq,
                label: "warning",
                next_attempt: iso_millis(deferred.next.unwrap_or_default()),
                server_response: deferred.response.unwrap_or_default(),
                smtp_log: deferred.log.len(),
                rest,
            },
            None => Self {
                index,
                seq,
                label: "success",
                next_attempt: "Whenever possible".to_string(),
                server_response: "N/A".to_string(),
                smtp_log: 0,
                rest,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub id: String,
    pub seq: Option<String>,
    pub seq_to: Option<Value>,
    pub log: Vec<LogEntryView>,
    pub created: String,
    pub expires_after: Option<String>,
    pub subject: Option<String>,
    pub spam: Option<SpamView>,
    pub mail_from: String,
    pub rcpt_to: String,
    pub headers: String,
    pub size: u64,
    pub has_deferred: bool,
    pub members: Vec<MemberView>,
    pub meta: Map<String, Value>,
}

impl MessageView {
    pub fn build(
        id: &str,
        seq: Option<&str>,
        events: &[StoredEvent],
        message: QueuedMessage,
        now: OffsetDateTime
    ) -> Self {
        let (log, seq_to) = log_entries(events, seq);
        let meta = message.meta;

        let created = millis_of(meta.get("time"))
            .map(iso_millis)
            .unwrap_or_else(|| iso_time(now));
        let expires_after = millis_of(meta.get("expiresAfter")).map(iso_millis);

        let header_lines = header_lines(meta.get("headers"));
        let subject = header_lines.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case("subject").then(|| value.trim().to_string())
        });
        let header_bytes: usize = header_lines.iter().map(|line| line.len() + 2).sum::<usize>() + 2;
        let body_size = meta.get("bodySize").and_then(Value::as_u64).unwrap_or_default();

        let mail_from = meta
            .get("from")
            .and_then(scalar_text)
            .filter(|from| !from.is_empty())
            .unwrap_or_else(|| "<>".to_string());
        let rcpt_to = match meta.get("to") {
            Some(Value::Array(items)) => {
                items.iter().filter_map(scalar_text).collect::<Vec<_>>().join(", ")
            }
            Some(other) => scalar_text(other).unwrap_or_default(),
            None => String::new(),
        };

        let members: Vec<MemberView> = message
            .messages
            .into_iter()
            .enumerate()
            .map(|(i, member)| MemberView::new(i + 1, member))
            .collect();

        Self {
            id: id.to_string(),
            seq: seq.map(str::to_string),
            seq_to,
            log,
            created,
            expires_after,
            subject,
            spam: spam_view(&meta),
            mail_from,
            rcpt_to,
            headers: header_lines.join("\n"),
            size: header_bytes as u64 + body_size,
            has_deferred: members.iter().any(|member| member.label == "warning"),
            members,
            meta,
        }
    }
}

/// Header lines from the queue's parsed header list (`[{ key, line }]`).
fn header_lines(headers: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(headers)) = headers else {
        return Vec::new();
    };
    headers
        .iter()
        .filter_map(|header| match header {
            Value::Object(header) => header.get("line").and_then(Value::as_str),
            Value::String(line) => Some(line.as_str()),
            _ => None,
        })
        .map(|line| line.replace('\r', "").trim_end().to_string())
        .collect()
}

fn spam_view(meta: &Map<String, Value>) -> Option<SpamView> {
    let spam = meta.get("spam")?;
    let verdict = spam.get("default")?;
    let action = verdict.get("action").and_then(Value::as_str).unwrap_or_default();

    let (label, text) = match action {
        "no action" => ("success", "Clean".to_string()),
        "reject" => ("danger", "Spam".to_string()),
        other => ("warning", capitalize(other)),
    };
    let score = verdict
        .get("score")
        .and_then(|score| score.as_f64().or_else(|| score.as_str()?.parse().ok()))
        .unwrap_or_default();
    let tests = spam
        .get("tests")
        .and_then(Value::as_array)
        .map(|tests| tests.iter().filter_map(scalar_text).collect::<Vec<_>>().join(", "))
        .unwrap_or_default();

    Some(SpamView { label, text, score: format!("{score:.2}"), tests })
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// SMTP transaction of one deferred member, one `TIME [LEVEL]: message` line
/// per entry with continuation lines indented under the message column.
pub fn format_transaction(lines: &[SmtpLogLine]) -> String {
    let continuation = format!("\n{}", " ".repeat(LOG_CONTINUATION_INDENT));
    lines
        .iter()
        .map(|line| {
            format!(
                "{} [{}]: {}",
                iso_millis(line.time.unwrap_or_default()),
                line.level,
                line.message.replace('\n', &continuation)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedZone {
    pub index: usize,
    #[serde(flatten)]
    pub zone: ZoneSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub counter_delivered: u64,
    pub counter_bounced: u64,
    pub speed: f64,
    pub active: u64,
    pub deferred: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub zones: Vec<IndexedZone>,
    pub top: Vec<TopDomain>,
    pub totals: Totals,
    pub blacklist: usize,
}

pub fn build_dashboard(
    zones: Vec<ZoneSnapshot>,
    counters: DayCounters,
    speeds: &HashMap<String, f64>,
    blacklist: usize
) -> Dashboard {
    let mut totals = Totals::default();

    let zones = zones
        .into_iter()
        .enumerate()
        .map(|(i, mut zone)| {
            let counter = counters.zones.get(&zone.name).copied().unwrap_or_default();
            zone.counter_delivered = counter.delivered;
            zone.counter_bounced = counter.bounced;
            zone.speed = speeds.get(&zone.name).copied().unwrap_or_default();

            totals.counter_delivered += zone.counter_delivered;
            totals.counter_bounced += zone.counter_bounced;
            totals.speed += zone.speed;
            totals.active += zone.active;
            totals.deferred += zone.deferred;

            IndexedZone { index: i + 1, zone }
        })
        .collect();

    Dashboard { zones, top: counters.top, totals, blacklist }
}

/// Numbers list items from 1 and, when `with_time` is set, renders their
/// `created` timestamp (ms) as `time`.
pub fn indexed_items(
    items: Vec<Value>,
    with_time: bool
) -> Vec<Value> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let mut item = match item {
                Value::Object(item) => item,
                other => Map::from_iter([("value".to_string(), other)]),
            };
            item.insert("index".to_string(), Value::from(i + 1));
            if with_time {
                let created = millis_of(item.get("created")).unwrap_or_default();
                item.insert("time".to_string(), Value::String(iso_millis(created)));
            }
            Value::Object(item)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRowView {
    pub index: usize,
    pub id: String,
    pub mid: String,
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub created: String,
}

pub fn index_rows(
    rows: &[IndexRow],
    first_index: usize
) -> Vec<IndexRowView> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| IndexRowView {
            index: first_index + i,
            id: row.entry.id.clone(),
            mid: row.entry.mid.clone(),
            message_id: format!("<{}>", row.entry.mid),
            from: row.entry.from.clone(),
            to: row.entry.to.clone(),
            created: iso_time(row.entry.t),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchView {
    pub query: String,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub has_next: bool,
    pub has_previous: bool,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub items: Vec<IndexRowView>,
}

impl SearchView {
    pub fn new(
        query: &str,
        page: SearchPage
    ) -> Self {
        let first_index = (page.page.saturating_sub(1) as usize) * page.limit as usize + 1;
        Self {
            query: query.to_string(),
            total: page.total,
            page: page.page,
            limit: page.limit,
            has_next: page.has_next,
            has_previous: page.has_previous,
            next: page.next.map(|cursor| cursor.encode()),
            previous: page.previous.map(|cursor| cursor.encode()),
            items: index_rows(&page.rows, first_index),
        }
    }
}
