//! Wire decoding: SSE framing and message classification.

use chrono::{DateTime, Utc};
use domainflow_types::DifferentialPatch;
use serde_json::Value;

// ---------------------------------------------------------------------------
// SSE frame decoding
// ---------------------------------------------------------------------------

/// Incremental decoder for `text/event-stream` bodies.
///
/// Feed raw byte chunks in; complete event payloads (the joined `data:`
/// lines) come out. Comment lines and non-`data` fields are ignored; there is
/// no resume/offset handling because the server offers none.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every event payload it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();

            if line.is_empty() {
                // Blank line dispatches the accumulated event.
                if !self.data_lines.is_empty() {
                    frames.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // Comments (":...") and other fields (event:, id:, retry:) are dropped.
        }

        frames
    }
}

// ---------------------------------------------------------------------------
// Message classification
// ---------------------------------------------------------------------------

/// A classified wire message. `payload` keeps the full original JSON so the
/// pool can forward it (or a synthesized variant of it) to subscribers.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    /// Liveness signal; never forwarded to subscribers.
    Heartbeat { server_time: Option<DateTime<Utc>> },
    /// Incremental change tagged `differential_update`.
    DifferentialUpdate {
        patch: DifferentialPatch,
        payload: Value,
    },
    /// Authoritative reset tagged `full_snapshot`.
    FullSnapshot { snapshot: Value, payload: Value },
    /// Any other well-formed JSON message; forwarded unmodified.
    Plain { payload: Value },
    /// Unparseable payload, forwarded verbatim.
    Raw { data: String },
}

/// Classify one wire frame. Parse failures degrade to [`StreamMessage::Raw`]
/// rather than failing the handler; a tagged message whose inner shape does
/// not match degrades to [`StreamMessage::Plain`].
pub fn decode_message(text: &str) -> StreamMessage {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            tracing::debug!(%err, "non-JSON frame, passing through raw");
            return StreamMessage::Raw {
                data: text.to_string(),
            };
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("heartbeat") => {
            let server_time = value
                .get("serverTime")
                .cloned()
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok());
            StreamMessage::Heartbeat { server_time }
        }
        Some("differential_update") => match value.get("patch").cloned() {
            Some(raw_patch) => match serde_json::from_value::<DifferentialPatch>(raw_patch) {
                Ok(patch) => StreamMessage::DifferentialUpdate {
                    patch,
                    payload: value,
                },
                Err(err) => {
                    tracing::warn!(%err, "malformed differential patch, forwarding as plain");
                    StreamMessage::Plain { payload: value }
                }
            },
            None => StreamMessage::Plain { payload: value },
        },
        Some("full_snapshot") => match value.get("snapshot").cloned() {
            Some(snapshot) => StreamMessage::FullSnapshot {
                snapshot,
                payload: value,
            },
            None => StreamMessage::Plain { payload: value },
        },
        _ => StreamMessage::Plain { payload: value },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decoder_splits_events_on_blank_line() {
        let mut dec = SseFrameDecoder::new();
        let frames = dec.feed(b"data: one\n\ndata: two\n\n");
        assert_eq!(frames, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn decoder_handles_chunks_split_mid_line() {
        let mut dec = SseFrameDecoder::new();
        assert!(dec.feed(b"data: {\"a\":").is_empty());
        let frames = dec.feed(b" 1}\n\n");
        assert_eq!(frames, vec!["{\"a\": 1}".to_string()]);
    }

    #[test]
    fn decoder_joins_multiple_data_lines() {
        let mut dec = SseFrameDecoder::new();
        let frames = dec.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut dec = SseFrameDecoder::new();
        let frames = dec.feed(b": keepalive\nevent: update\nid: 4\ndata: x\n\n");
        assert_eq!(frames, vec!["x".to_string()]);
    }

    #[test]
    fn decoder_handles_crlf() {
        let mut dec = SseFrameDecoder::new();
        let frames = dec.feed(b"data: x\r\n\r\n");
        assert_eq!(frames, vec!["x".to_string()]);
    }

    #[test]
    fn decode_heartbeat_with_server_time() {
        let msg = decode_message(r#"{"type":"heartbeat","serverTime":"2025-06-01T12:00:00Z"}"#);
        match msg {
            StreamMessage::Heartbeat { server_time } => assert!(server_time.is_some()),
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn decode_heartbeat_without_server_time() {
        let msg = decode_message(r#"{"type":"heartbeat"}"#);
        assert!(matches!(
            msg,
            StreamMessage::Heartbeat { server_time: None }
        ));
    }

    #[test]
    fn decode_differential_update() {
        let frame = json!({
            "type": "differential_update",
            "patch": {
                "type": "delta",
                "timestamp": "2025-06-01T12:00:00Z",
                "changes": [{"op": "set", "path": "status", "value": "running"}],
                "sequenceNumber": 3
            }
        })
        .to_string();
        match decode_message(&frame) {
            StreamMessage::DifferentialUpdate { patch, payload } => {
                assert_eq!(patch.sequence_number, Some(3));
                assert_eq!(payload["type"], "differential_update");
            }
            other => panic!("expected differential update, got {other:?}"),
        }
    }

    #[test]
    fn decode_malformed_patch_degrades_to_plain() {
        let msg = decode_message(r#"{"type":"differential_update","patch":{"type":"nope"}}"#);
        assert!(matches!(msg, StreamMessage::Plain { .. }));
    }

    #[test]
    fn decode_full_snapshot() {
        let msg = decode_message(r#"{"type":"full_snapshot","snapshot":{"status":"done"}}"#);
        match msg {
            StreamMessage::FullSnapshot { snapshot, .. } => {
                assert_eq!(snapshot["status"], "done");
            }
            other => panic!("expected full snapshot, got {other:?}"),
        }
    }

    #[test]
    fn decode_plain_message() {
        let msg = decode_message(r#"{"type":"campaign.progress","data":{"progressPercent":40}}"#);
        match msg {
            StreamMessage::Plain { payload } => assert_eq!(payload["type"], "campaign.progress"),
            other => panic!("expected plain, got {other:?}"),
        }
    }

    #[test]
    fn decode_non_json_falls_back_to_raw() {
        let msg = decode_message("not json at all");
        match msg {
            StreamMessage::Raw { data } => assert_eq!(data, "not json at all"),
            other => panic!("expected raw, got {other:?}"),
        }
    }
}
