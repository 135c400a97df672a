//! Cache-status, freshness and validator response headers.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use http::{
    header::{
        InvalidHeaderValue, CACHE_CONTROL, ETAG, EXPIRES, LAST_MODIFIED,
    },
    HeaderMap, HeaderName, HeaderValue,
};

use crate::{conditional::entity_tag, Ttl, Value};

/// Default name of the cache-status header.
pub const DEFAULT_RESPONSE_HEADER: &str = "x-fastapi-cache";

/// Payload field copied into `Last-Modified` when present.
pub const LAST_MODIFIED_FIELD: &str = "last_modified";

/// Represents a basic cache status, written to the cache-status header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HitOrMiss {
    /// Served from the store
    Hit,
    /// Freshly computed
    Miss,
}

impl fmt::Display for HitOrMiss {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "Hit"),
            Self::Miss => write!(f, "Miss"),
        }
    }
}

/// Writes the cache-status, `Expires`, `Cache-Control`, `ETag` and, when the
/// payload carries a `last_modified` field, `Last-Modified` headers.
///
/// `encoded` is the payload's codec form and is what the entity tag is
/// derived from. The payload itself is never modified.
pub fn apply_headers(
    headers: &mut HeaderMap,
    status_header: &HeaderName,
    hit_or_miss: HitOrMiss,
    encoded: &str,
    payload: &Value,
    ttl: Ttl,
) -> Result<(), InvalidHeaderValue> {
    let secs = ttl.header_seconds();
    headers.insert(
        status_header.clone(),
        HeaderValue::from_str(&hit_or_miss.to_string())?,
    );
    let now = SystemTime::now();
    let expires_at = now.checked_add(Duration::from_secs(secs)).unwrap_or(now);
    headers.insert(
        EXPIRES,
        HeaderValue::from_str(&httpdate::fmt_http_date(expires_at))?,
    );
    headers
        .insert(CACHE_CONTROL, HeaderValue::from_str(&format!("max-age={secs}"))?);
    headers.insert(ETAG, HeaderValue::from_str(&entity_tag(encoded))?);
    if let Some(last_modified) = payload.get(LAST_MODIFIED_FIELD) {
        let raw = match last_modified {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match HeaderValue::from_str(&raw) {
            Ok(value) => {
                headers.insert(LAST_MODIFIED, value);
            }
            Err(_) => log::debug!(
                "skipping Last-Modified, `{raw}` is not a valid header value"
            ),
        }
    }
    Ok(())
}
