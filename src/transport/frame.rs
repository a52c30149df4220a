//! Length-free JSON framing for the control protocol.
//!
//! Each record is one JSON object terminated by `\r\n\r\n`. Readers must
//! recover the exact object stream regardless of how the bytes were
//! chunked, and tolerate stray extra delimiters between records.

use serde_json::{Map, Value};
use thiserror::Error;

pub const DELIMITER: &[u8] = b"\r\n\r\n";

pub type FrameResult<T> = core::result::Result<T, FrameError>;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("record is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,
}

/// Serializes one JSON value as a framed record.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(value).expect("json values always serialize");
    bytes.extend_from_slice(DELIMITER);
    bytes
}

/// Incremental decoder: feed arbitrary chunks in, pull complete objects
/// out.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete record, skipping empty ones. `None` means
    /// more bytes are needed.
    pub fn next_frame(&mut self) -> FrameResult<Option<Map<String, Value>>> {
        loop {
            let Some(pos) = self
                .buf
                .windows(DELIMITER.len())
                .position(|window| window == DELIMITER)
            else {
                return Ok(None);
            };

            let record: Vec<u8> = self.buf.drain(..pos + DELIMITER.len()).collect();
            let record = &record[..pos];

            if record.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let value: Value = serde_json::from_slice(record)?;
            return match value {
                Value::Object(map) => Ok(Some(map)),
                _ => Err(FrameError::NotAnObject),
            };
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_stream_is_lossless() {
        let records = vec![
            json!({"command": "server-list"}),
            json!({"command": "server-message", "server": "local", "message": "a b c"}),
            json!({"command": "rule-list"}),
        ];

        let mut stream = Vec::new();
        for record in &records {
            stream.extend_from_slice(&encode(record));
        }

        // feed one byte at a time to exercise partial reads
        let mut buf = FrameBuffer::new();
        let mut decoded = Vec::new();
        for byte in stream {
            buf.extend(&[byte]);
            while let Some(frame) = buf.next_frame().unwrap() {
                decoded.push(Value::Object(frame));
            }
        }

        assert_eq!(decoded, records);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn extra_delimiters_are_tolerated() {
        let mut buf = FrameBuffer::new();
        buf.extend(b"\r\n\r\n\r\n\r\n{\"command\":\"auth\"}\r\n\r\n\r\n\r\n");

        let frame = buf.next_frame().unwrap().unwrap();
        assert_eq!(frame.get("command").unwrap(), "auth");
        assert!(buf.next_frame().unwrap().is_none());
    }

    #[test]
    fn incomplete_frame_waits_for_more() {
        let mut buf = FrameBuffer::new();
        buf.extend(b"{\"command\":\"auth\"}\r\n");
        assert!(buf.next_frame().unwrap().is_none());

        buf.extend(b"\r\n");
        assert!(buf.next_frame().unwrap().is_some());
    }

    #[test]
    fn non_object_record_is_an_error() {
        let mut buf = FrameBuffer::new();
        buf.extend(b"[1,2,3]\r\n\r\n");
        assert!(matches!(buf.next_frame(), Err(FrameError::NotAnObject)));

        let mut buf = FrameBuffer::new();
        buf.extend(b"not json at all\r\n\r\n");
        assert!(matches!(buf.next_frame(), Err(FrameError::Corrupt(_))));
    }
}
