//! Entity tags and `If-None-Match` evaluation.

use http::{header::IF_NONE_MATCH, HeaderMap};

/// Derives the weak entity tag of an encoded payload.
///
/// Uses a fast non-cryptographic hash; equal encodings always produce equal
/// tags, including across process restarts.
pub fn entity_tag(encoded: &str) -> String {
    format!("W/\"{:016x}\"", seahash::hash(encoded.as_bytes()))
}

/// Parses every `If-None-Match` header into its entity-tag tokens.
///
/// Returns `None` when the request carries no such header.
fn if_none_match(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut values = headers.get_all(IF_NONE_MATCH).iter().peekable();
    values.peek()?;
    Some(
        values
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}

/// Whether a conditional GET is already satisfied by the cached payload.
///
/// A lone `*` matches any cached representation. Otherwise the cached
/// payload's [`entity_tag`] must appear in the list.
pub fn is_not_modified(headers: &HeaderMap, cached: &str) -> bool {
    let Some(tags) = if_none_match(headers) else {
        return false;
    };
    if tags.len() == 1 && tags[0] == "*" {
        return true;
    }
    let etag = entity_tag(cached);
    tags.iter().any(|tag| *tag == etag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const CACHED: &str = r#"{"success":true}"#;

    fn with_if_none_match(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn etag_is_stable_and_weak() {
        let tag = entity_tag(CACHED);
        assert_eq!(tag, entity_tag(CACHED));
        assert!(tag.starts_with("W/\""));
        assert_ne!(tag, entity_tag(r#"{"success":false}"#));
    }

    #[test]
    fn missing_header_never_matches() {
        assert!(!is_not_modified(&HeaderMap::new(), CACHED));
    }

    #[test]
    fn wildcard_matches() {
        assert!(is_not_modified(&with_if_none_match("*"), CACHED));
        assert!(is_not_modified(&with_if_none_match(" * , "), CACHED));
    }

    #[test]
    fn list_membership() {
        let etag = entity_tag(CACHED);
        let listed = format!("W/\"0000000000000000\", {etag}");
        assert!(is_not_modified(&with_if_none_match(&listed), CACHED));
        assert!(!is_not_modified(
            &with_if_none_match("W/\"0000000000000000\""),
            CACHED
        ));
        assert!(!is_not_modified(&with_if_none_match(" , "), CACHED));
    }

    #[test]
    fn header_lines_are_combined() {
        let mut headers = HeaderMap::new();
        headers.append(IF_NONE_MATCH, HeaderValue::from_static("W/\"1\""));
        headers.append(
            IF_NONE_MATCH,
            HeaderValue::from_str(&entity_tag(CACHED)).unwrap(),
        );
        assert!(is_not_modified(&headers, CACHED));
    }
}
