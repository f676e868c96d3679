//! `ipc://<pipe-name>/<object-uri>` URL grammar.

use crate::channel::ParsedUrl;

pub const SCHEME_PREFIX: &str = "ipc://";

/// Pipe names are non-empty and free of path separators.
pub fn is_valid_pipe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\'])
}

/// Split an IPC URL into channel URI, pipe name and object URI.
///
/// Returns `None` when the scheme is not `ipc://` or the pipe name is
/// invalid.
pub fn parse(url: &str) -> Option<(ParsedUrl, String)> {
    let rest = url.strip_prefix(SCHEME_PREFIX)?;
    let (pipe, object) = match rest.find('/') {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    };
    if !is_valid_pipe_name(pipe) {
        return None;
    }
    let parsed = ParsedUrl {
        channel_uri: format!("{}{}", SCHEME_PREFIX, pipe),
        object_uri: object.filter(|o| !o.is_empty()).map(str::to_string),
    };
    Some((parsed, pipe.to_string()))
}

/// Build the URL a client uses to reach `object_uri` on `pipe`.
pub fn object_url(pipe: &str, object_uri: &str) -> String {
    format!(
        "{}{}/{}",
        SCHEME_PREFIX,
        pipe,
        object_uri.trim_start_matches('/')
    )
}

/// Reduce a request URI to its path form (`/obj`). Full `ipc://` URLs lose
/// their scheme and pipe name; anything else is returned unchanged.
pub fn request_path(request_uri: &str) -> String {
    match parse(request_uri) {
        Some((parsed, _)) => format!("/{}", parsed.object_uri.unwrap_or_default()),
        None => request_uri.to_string(),
    }
}
