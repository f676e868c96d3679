//! `http://` and `https://` URL splitting.

use crate::channel::ParsedUrl;

const SCHEMES: [&str; 2] = ["http://", "https://"];

/// Split an HTTP URL into its channel URI (scheme and authority) and object
/// URI (path after the first `/`, without that slash).
///
/// Returns `None` for other schemes or an empty authority.
pub fn parse(url: &str) -> Option<ParsedUrl> {
    let scheme_len = SCHEMES.iter().find_map(|scheme| {
        url.get(..scheme.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .map(|_| scheme.len())
    })?;

    let rest = &url[scheme_len..];
    let authority_len = rest.find('/').unwrap_or(rest.len());
    if authority_len == 0 {
        return None;
    }

    let object = rest.get(authority_len + 1..).unwrap_or_default();
    Some(ParsedUrl {
        channel_uri: url[..scheme_len + authority_len].to_string(),
        object_uri: (!object.is_empty()).then(|| object.to_string()),
    })
}

/// Join a channel URI and a request URI or object URI into a full URL.
pub fn join(channel_uri: &str, uri: &str) -> String {
    format!(
        "{}/{}",
        channel_uri.trim_end_matches('/'),
        uri.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_object_uri() {
        let parsed = parse("http://localhost:8080/app/Calc.rem").unwrap();
        assert_eq!(parsed.channel_uri, "http://localhost:8080");
        assert_eq!(parsed.object_uri.as_deref(), Some("app/Calc.rem"));
    }

    #[test]
    fn test_parse_without_path() {
        let parsed = parse("http://localhost:8080").unwrap();
        assert_eq!(parsed.channel_uri, "http://localhost:8080");
        assert!(parsed.object_uri.is_none());

        let parsed = parse("http://localhost:8080/").unwrap();
        assert!(parsed.object_uri.is_none());
    }

    #[test]
    fn test_parse_https_and_scheme_case() {
        let parsed = parse("HTTPS://example.com/Foo").unwrap();
        assert_eq!(parsed.channel_uri, "HTTPS://example.com");
        assert_eq!(parsed.object_uri.as_deref(), Some("Foo"));
    }

    #[test]
    fn test_parse_rejects_foreign_urls() {
        assert!(parse("ipc://pipe/Foo").is_none());
        assert!(parse("http:///Foo").is_none());
        assert!(parse("ftp://host/Foo").is_none());
        assert!(parse("ht").is_none());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("http://h:1", "/Foo"), "http://h:1/Foo");
        assert_eq!(join("http://h:1/", "Foo"), "http://h:1/Foo");
    }
}
