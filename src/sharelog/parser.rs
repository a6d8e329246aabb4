//! Sharelog line parsing
//!
//! A line is one JSON object as written by ckpool. Blank lines and anything
//! that is not a JSON object are dropped without error.

use crate::types::Share;
use crate::utils::{current_timestamp_secs, fold_case};
use serde_json::{Map, Value};

/// Parse a line, stamping records that carry no usable time with "now"
pub fn parse_share_line(line: &str) -> Option<Share> {
    parse_share_line_at(line, current_timestamp_secs())
}

/// Parse a line with an explicit fallback timestamp
pub fn parse_share_line_at(line: &str, now: f64) -> Option<Share> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }

    let record: Map<String, Value> = serde_json::from_str(line).ok()?;

    let workername = record.get("workername").and_then(text_of);
    let username = record.get("username").and_then(text_of);
    let (workername_addr, worker_suffix) = match workername.as_deref() {
        Some(name) => split_workername(name),
        None => (None, None),
    };

    // The account field is authoritative; fall back to the workername prefix
    let address = username
        .as_deref()
        .and_then(fold_case)
        .or_else(|| workername_addr.as_deref().and_then(fold_case));
    let worker = worker_suffix.as_deref().and_then(fold_case);

    let field = |name: &str| record.get(name).filter(|v| !v.is_null()).cloned();
    let createdate = field("createdate");
    let ts = createdate.as_ref().and_then(parse_createdate).unwrap_or(now);

    Some(Share {
        workinfoid: field("workinfoid"),
        clientid: field("clientid"),
        diff: field("diff"),
        sdiff: field("sdiff"),
        hash: field("hash"),
        result: field("result"),
        errn: field("errn"),
        createdate,
        ts,
        workername,
        username,
        address,
        worker,
        workername_addr,
        ip: field("address"),
        agent: field("agent"),
        reject_reason: field("reject-reason"),
        round: None,
        file: None,
        raw: record,
    })
}

/// Split `<address>[.<worker>]` at the first dot
///
/// Parts are trimmed but otherwise returned verbatim; an empty name yields
/// neither part.
pub fn split_workername(workername: &str) -> (Option<String>, Option<String>) {
    let name = workername.trim();
    if name.is_empty() {
        return (None, None);
    }
    match name.split_once('.') {
        Some((addr, worker)) => (Some(addr.to_string()), Some(worker.to_string())),
        None => (Some(name.to_string()), None),
    }
}

/// Convert a `createdate` value to fractional epoch seconds
///
/// ckpool writes `"<secs>,<fraction digits>"`; anything else is tried as a
/// plain number.
pub fn parse_createdate(value: &Value) -> Option<f64> {
    let text = match value {
        Value::Number(n) => return n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }

    if let Some((whole, fraction)) = text.split_once(',') {
        if is_digits(whole) && is_digits(fraction) {
            let whole: f64 = whole.parse().ok()?;
            let fraction: f64 = format!("0.{}", fraction).parse().ok()?;
            return Some(whole + fraction);
        }
    }

    text.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Text form of a scalar JSON value
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
