//! Server-sent event framing.
//!
//! Frames are written by hand: one `data:` event per child output line and
//! a final `done` event on POST streams.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;

/// Content type of an event stream.
pub const EVENT_STREAM: &str = "text/event-stream";

/// Terminator sent after the last relayed line of a POST stream.
pub const DONE_FRAME: &str = "event: done\ndata: \n\n";

/// Frames one line as a `data:` event.
#[must_use]
pub fn data_frame(line: &str) -> Bytes {
    Bytes::from(format!("data: {line}\n\n"))
}

/// The `done` event.
#[must_use]
pub const fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME.as_bytes())
}

/// Wraps a streaming body in a 200 response with event-stream headers.
#[must_use]
pub fn response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// One decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// The `data:` lines, joined with `\n`.
    pub data: String,
}

/// Splits an event-stream body into events.
///
/// Only the `event` and `data` fields are understood; comments and other
/// fields are ignored.
#[must_use]
pub fn parse_events(text: &str) -> Vec<Event> {
    let mut events = Vec::new();

    for block in text.split("\n\n") {
        if block.trim().is_empty() {
            continue;
        }
        let mut event = Event::default();
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                event.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }
        event.data = data.join("\n");
        events.push(event);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames() {
        assert_eq!(data_frame(r#"{"id":1}"#), Bytes::from("data: {\"id\":1}\n\n"));
        assert_eq!(done_frame(), Bytes::from("event: done\ndata: \n\n"));
    }

    #[test]
    fn response_headers() {
        let response = response(Body::empty());
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers["x-accel-buffering"], "no");
    }

    #[test]
    fn parse_framed_stream() {
        let mut body = String::new();
        body.push_str(std::str::from_utf8(&data_frame(r#"{"a":1}"#)).unwrap());
        body.push_str(std::str::from_utf8(&data_frame(r#"{"b":2}"#)).unwrap());
        body.push_str(DONE_FRAME);

        let events = parse_events(&body);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert_eq!(events[1].data, r#"{"b":2}"#);
        assert_eq!(events[2].event.as_deref(), Some("done"));
        assert_eq!(events[2].data, "");
    }
}
