//! Small helpers for picking apart relayed request targets.

use indexmap::IndexMap;

/// Parse a raw query string (with or without the leading `?`).
///
/// - pairs are split on `&`, then on the first `=`
/// - keys are lowercased, so lookups are case-insensitive
/// - values are URL-decoded (`%XX` escapes, `+` as space)
/// - pairs without `=` are ignored
/// - the first occurrence of a key wins
pub fn parse_query(raw: &str) -> IndexMap<String, String> {
    let mut params = IndexMap::new();
    for part in raw.trim_start_matches('?').split('&') {
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        params
            .entry(key.to_lowercase())
            .or_insert_with(|| url_decode(value));
    }
    params
}

/// Decode a form-encoded query value. Malformed escapes pass through
/// literally and invalid UTF-8 is replaced.
pub fn url_decode(value: &str) -> String {
    let spaced = value.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

/// Split a request target into `(path, query)`. Absolute targets
/// (`https://host/path?q`) are reduced to their path first.
pub fn split_target(target: &str) -> (&str, &str) {
    let target = match target.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
        None => target,
    };
    let target = target.split('#').next().unwrap_or(target);
    target.split_once('?').unwrap_or((target, ""))
}

/// Strip the hybrid connection path from a request path, leaving the route.
///
/// Both sides are trimmed of `/`. The prefix is removed case-insensitively
/// when the path is `prefix/route`; a path equal to the prefix yields `""`;
/// anything else is returned trimmed but otherwise unchanged.
pub fn route_from_path<'a>(path: &'a str, channel_path: &str) -> &'a str {
    let route = path.trim_matches('/');
    let prefix = channel_path.trim_matches('/');
    if prefix.is_empty() {
        return route;
    }
    if route.eq_ignore_ascii_case(prefix) {
        return "";
    }
    match route.get(..prefix.len()) {
        Some(head)
            if head.eq_ignore_ascii_case(prefix)
                && route.as_bytes().get(prefix.len()) == Some(&b'/') =>
        {
            &route[prefix.len() + 1..]
        }
        _ => route,
    }
}
