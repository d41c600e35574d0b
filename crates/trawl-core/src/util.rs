use url::Url;

/// Normalized request identity used as the cache key.
///
/// Parses the URL (lower-cases scheme and host, resolves default ports) and
/// drops the fragment. Unparseable input is used as-is, trimmed.
/// Example: `"HTTPS://Api.Example.com:443/t?i=1#top"` → `"https://api.example.com/t?i=1"`
pub fn cache_key(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.trim().to_string(),
    }
}

/// Appends `name=value` to the query of `url`, form-encoding both.
pub fn append_query_param(url: &str, name: &str, value: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair(name, value);
            parsed.to_string()
        }
        Err(_) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            let encoded: String = url::form_urlencoded::Serializer::new(String::new())
                .append_pair(name, value)
                .finish();
            format!("{url}{separator}{encoded}")
        }
    }
}

/// Percent-encodes the final path segment of `url`, leaving the rest intact.
///
/// Used once as a corrective retry when a listing link contains characters
/// the server or transport rejects (spaces, non-ASCII titles, quotes).
/// Returns `None` when there is nothing to encode or the URL has no path.
pub fn encode_last_path_segment(url: &str) -> Option<String> {
    let (head, query) = match url.find(['?', '#']) {
        Some(idx) => url.split_at(idx),
        None => (url, ""),
    };
    let scheme_end = head.find("://").map(|i| i + 3).unwrap_or(0);
    let last_slash = head.rfind('/').filter(|&i| i >= scheme_end)?;
    let (prefix, segment) = head.split_at(last_slash + 1);
    if segment.is_empty() {
        return None;
    }

    let encoded = percent_encode_segment(segment);
    if encoded == segment {
        return None;
    }
    Some(format!("{prefix}{encoded}{query}"))
}

/// A `%` survives only as the start of an existing `%XX` escape.
fn percent_encode_segment(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, &byte) in bytes.iter().enumerate() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'%' if bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit)) =>
            {
                out.push('%')
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Whether `url` addresses page `page`, either through a `{param}={page}`
/// query pair or through adjacent `{param}/{page}` path segments.
pub fn url_reflects_page(url: &str, param: &str, page: u32) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let expected = page.to_string();
    if parsed
        .query_pairs()
        .any(|(name, value)| name == param && value == expected)
    {
        return true;
    }
    parsed.path_segments().is_some_and(|segments| {
        let segments: Vec<&str> = segments.collect();
        segments
            .windows(2)
            .any(|pair| pair[0] == param && pair[1] == expected)
    })
}
