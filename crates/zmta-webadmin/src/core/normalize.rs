use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Longest search term accepted from the find box.
pub const MAX_TERM_LEN: usize = 255;

/// Strips leading `<`/whitespace and trailing `>`/whitespace.
pub fn strip_angle_brackets(value: &str) -> &str {
    value
        .trim_start_matches(|c: char| c == '<' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '>' || c.is_whitespace())
}

pub fn normalize_message_id(value: &str) -> String {
    strip_angle_brackets(value).to_string()
}

/// Envelope address form used by the message-id index: brackets and
/// surrounding whitespace removed, lower-cased.
pub fn normalize_address(value: &str) -> String {
    strip_angle_brackets(value).to_lowercase()
}

/// Recipients arrive either as a comma separated string or as an array.
pub fn normalize_recipients(value: &Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| zmta_proto::scalar_text(item))
            .collect(),
        other => zmta_proto::scalar_text(other)
            .map(|text| text.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    };

    raw.iter()
        .flat_map(|item| item.split(','))
        .map(normalize_address)
        .filter(|address| !address.is_empty())
        .collect()
}

/// Cleans a free-text search term the way the find box does.
pub fn normalize_term(value: &str) -> String {
    let term = strip_angle_brackets(value);
    match term.char_indices().nth(MAX_TERM_LEN) {
        Some((cut, _)) => term[..cut].to_string(),
        None => term.to_string(),
    }
}

/// True when `term` has the shape of a queue id (18 alnum, 16 for ids
/// written by older senders, plus an optional `.seq` of 3 alnum), which means
/// it can be opened directly.
pub fn is_queue_id(term: &str) -> bool {
    static QUEUE_ID: OnceLock<Regex> = OnceLock::new();
    QUEUE_ID
        .get_or_init(|| {
            Regex::new(r"(?i)^[0-9a-z]{16,18}(\.[0-9a-z]{3})?$")
                .unwrap_or_else(|err| panic!("invalid queue id pattern: {err}"))
        })
        .is_match(term)
}

/// Splits `id.seq` into its parts; ids without a dot have no seq.
pub fn split_queue_id(value: &str) -> (&str, Option<&str>) {
    let value = value.trim();
    match value.rsplit_once('.') {
        Some((id, seq)) if !seq.is_empty() => (id, Some(seq)),
        _ => (value, None),
    }
}

/// Escapes `%`, `_` and `\` so the value matches literally inside `LIKE`.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 4);
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
