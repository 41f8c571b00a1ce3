//! Framed codec for worker communication.
//!
//! Uses [`LineFramer`] for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (child pipes, in-memory duplex, etc).
//!
//! Decoding never fails on content: a line that is not valid JSON, or valid
//! JSON of the wrong shape, is logged and skipped so one corrupt line cannot
//! stall every pending command behind it.

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::framer::{DEFAULT_MAX_LINE_BYTES, LineFramer};
use super::protocol::{Command, InboundMessage, ProtocolError};

/// Longest slice of a discarded line echoed into logs.
const LOG_PREVIEW_BYTES: usize = 200;

/// Newline-delimited JSON codec: decodes [`InboundMessage`], encodes [`Command`].
#[derive(Debug)]
pub struct WireCodec {
    framer: LineFramer,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl WireCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            framer: LineFramer::new(max_line_bytes),
        }
    }
}

/// Parse one complete line into a classified message.
pub fn parse_inbound(line: &[u8]) -> Result<InboundMessage, ProtocolError> {
    let value = serde_json::from_slice::<serde_json::Value>(line)?;
    InboundMessage::from_value(value)
}

fn preview(line: &[u8]) -> String {
    let end = line.len().min(LOG_PREVIEW_BYTES);
    String::from_utf8_lossy(&line[..end]).into_owned()
}

fn accept(line: &[u8]) -> Option<InboundMessage> {
    match parse_inbound(line) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(
                target: "ocularum::protocol",
                error = %e,
                line = %preview(line),
                "Discarding inbound line"
            );
            None
        }
    }
}

impl Decoder for WireCodec {
    type Item = InboundMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.framer.decode(src)? {
            if let Some(message) = accept(&line) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.framer.decode_eof(src)? {
            if let Some(message) = accept(&line) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

impl Encoder<Command> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(
            target: "ocularum::protocol",
            command_id = %item.id,
            json_size_bytes = json.len(),
            "Encoding command"
        );
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CommandId, Notification, Response};
    use serde_json::json;

    #[test]
    fn encodes_one_line_per_command() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::new();
        let command = Command {
            id: CommandId::from("abc"),
            command_type: "get_stream_qualities".to_string(),
            params: json!({"channel": "alice"}),
        };
        codec.encode(command, &mut buf).unwrap();

        assert_eq!(
            &buf[..],
            b"{\"id\":\"abc\",\"type\":\"get_stream_qualities\",\"params\":{\"channel\":\"alice\"}}\n"
        );
    }

    #[test]
    fn response_split_across_chunks() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::from(r#"{"id":"x","#);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"success\":true}\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            InboundMessage::Response(Response::success("x", serde_json::Value::Null))
        );
    }

    #[test]
    fn malformed_line_between_good_lines() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::from(
            "{\"id\":\"a\",\"success\":true,\"data\":1}\n\
             {not json at all\n\
             \u{0}\u{1}garbage\n\
             {\"notification\":{\"type\":\"t\",\"data\":2}}\n",
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, InboundMessage::Response(Response::success("a", json!(1))));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            second,
            InboundMessage::Notification(Notification::new("t", json!(2)))
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn invalid_utf8_is_discarded() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\xff\xfe\n{\"id\":\"b\",\"success\":false}\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            InboundMessage::Response(Response::failure("b", "unknown error"))
        );
    }

    #[test]
    fn unknown_shapes_are_skipped() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::from("{\"status\":\"ok\"}\n42\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_decodes_unterminated_message() {
        let mut codec = WireCodec::default();
        let mut buf = BytesMut::from(r#"{"id":"z","success":true,"data":"bye"}"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let msg = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            InboundMessage::Response(Response::success("z", json!("bye")))
        );
    }
}
