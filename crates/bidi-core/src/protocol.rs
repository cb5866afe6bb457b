//! Wire constants shared by server and client.

/// Content type of the push stream.
pub const EVENT_STREAM: &str = "text/event-stream";

/// Named event that carries the encoded session id, sent once and first.
pub const HANDSHAKE_EVENT: &str = "id";

/// Default SSE event name used by peers for unnamed `data:` frames.
pub const MESSAGE_EVENT: &str = "message";

/// Named event that reports an undecodable reverse-direction body.
pub const UNEXPECTED_EVENT: &str = "unexpected";

/// Query parameter carrying the session id on reverse-direction requests.
pub const SESSION_PARAM: &str = "id";

/// Base path used when none is configured.
pub const DEFAULT_BASE_PATH: &str = "/bidi-sse";

/// Whether an `Accept` header value lists the push content type.
///
/// Parameters (`;q=...`) are ignored; wildcards do not count.
pub fn accepts_event_stream(accept: &str) -> bool {
    accept
        .split(',')
        .filter_map(|part| part.split(';').next())
        .any(|media| media.trim().eq_ignore_ascii_case(EVENT_STREAM))
}

/// Whether `name` can be placed on an SSE `event:` line.
pub fn is_valid_event_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['\r', '\n'])
}
