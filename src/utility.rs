//! Small helpers shared between the dispatcher and the renderer.

use crate::prelude::*;

/// Escapes text for embedding into an HTML body.
///
/// `&` and `<` are replaced; enough for displayed URLs and status reasons.
#[must_use]
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// A hard-coded minimal HTML page for `status`.
#[must_use]
pub fn status_body(status: StatusCode) -> Bytes {
    let code = status.as_str();
    let reason = status.canonical_reason().unwrap_or("");
    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(b"<html><head><title>");
    body.extend_from_slice(code.as_bytes());
    body.extend_from_slice(b" ");
    body.extend_from_slice(reason.as_bytes());
    body.extend_from_slice(b"</title></head><body><center><h1>");
    body.extend_from_slice(code.as_bytes());
    body.extend_from_slice(b" ");
    body.extend_from_slice(reason.as_bytes());
    body.extend_from_slice(b"</h1><hr></center></body></html>");
    Bytes::from(body)
}

/// Parses a query string (without the leading `?`) into a parameter map.
///
/// Both keys and values may be empty; of repeated keys, the last wins.
#[must_use]
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => map.insert(key.to_owned(), value.to_owned()),
            None => map.insert(pair.to_owned(), String::new()),
        };
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        assert_eq!(html_escape("a<b&c"), "a&lt;b&amp;c");
        assert_eq!(html_escape("https://x/?a=1"), "https://x/?a=1");
    }

    #[test]
    fn status_page_mentions_code_and_reason() {
        let body = status_body(StatusCode::NOT_FOUND);
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("404 Not Found"));
    }

    #[test]
    fn query_parsing() {
        let map = parse_query("a=1&b=&c&a=2");
        assert_eq!(map.get("a").map(String::as_str), Some("2"));
        assert_eq!(map.get("b").map(String::as_str), Some(""));
        assert_eq!(map.get("c").map(String::as_str), Some(""));
        assert!(parse_query("").is_empty());
    }
}
