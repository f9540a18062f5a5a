//! Inbound request validation.  Everything here runs before any outbound
//! call is made.

use serde::Deserialize;
use serde_json::Value;

/// A rejected inbound request; the message is returned to the caller as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Invalid(pub &'static str);

pub const MAX_LIMIT: i64 = 100;
const DEFAULT_SKIP: i64 = 0;
const DEFAULT_LIMIT: i64 = 100;
const MAX_AREA_ID_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Areas listing
// ---------------------------------------------------------------------------

/// Raw `?skip=&limit=` query.  Kept as strings so malformed numbers become a
/// 400 with our own envelope rather than an extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct AreasQuery {
    pub skip: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub skip: u64,
    pub limit: u32,
}

/// `skip` must be a non-negative integer, `limit` an integer in `1..=100`.
/// Missing or empty values take the defaults (0 and 100).
pub fn pagination(query: &AreasQuery) -> Result<Pagination, Invalid> {
    let skip = parse_int(query.skip.as_deref(), DEFAULT_SKIP)
        .filter(|n| *n >= 0)
        .ok_or(Invalid("Invalid skip parameter"))?;
    let limit = parse_int(query.limit.as_deref(), DEFAULT_LIMIT)
        .filter(|n| (1..=MAX_LIMIT).contains(n))
        .ok_or(Invalid("Invalid limit parameter (1-100)"))?;

    Ok(Pagination {
        skip: skip as u64,
        limit: limit as u32,
    })
}

fn parse_int(raw: Option<&str>, default: i64) -> Option<i64> {
    match raw.map(str::trim) {
        None | Some("") => Some(default),
        Some(s) => s.parse().ok(),
    }
}

// ---------------------------------------------------------------------------
// Path segments
// ---------------------------------------------------------------------------

/// Area ids are interpolated into upstream paths, so only a conservative
/// alphabet is accepted.
pub fn area_id(raw: &str) -> Result<&str, Invalid> {
    let ok = !raw.is_empty()
        && raw.len() <= MAX_AREA_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(raw)
    } else {
        Err(Invalid("Invalid area id"))
    }
}

// ---------------------------------------------------------------------------
// JSON bodies
// ---------------------------------------------------------------------------

/// Parse a request body that must be a JSON object.
pub fn json_object(body: &[u8]) -> Result<Value, Invalid> {
    let value: Value = serde_json::from_slice(body).map_err(|_| Invalid("Invalid JSON body"))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(Invalid("Request body must be a JSON object"))
    }
}

/// `POST /areas/compare` needs a non-empty `area_ids` array.
pub fn compare_body(body: &Value) -> Result<&[Value], Invalid> {
    body.get("area_ids")
        .and_then(Value::as_array)
        .filter(|ids| !ids.is_empty())
        .map(Vec::as_slice)
        .ok_or(Invalid("area_ids array is required"))
}

/// `POST /wellbeing/ranking` needs a `weights` object.
pub fn ranking_body(body: &Value) -> Result<(), Invalid> {
    match body.get("weights") {
        Some(Value::Object(_)) => Ok(()),
        _ => Err(Invalid("Invalid request: weights required")),
    }
}
