//! Incremental STOMP 1.1 frame decoder.
//!
//! Frames are NUL-terminated; between frames, bare `\n` bytes are heartbeats
//! and are consumed silently. A frame split across reads is buffered until
//! the terminator arrives.

use std::collections::HashMap;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    /// First occurrence wins for repeated keys.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A malformed frame; the connection is not recoverable past this point.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed STOMP frame: {0}")]
pub struct FrameError(pub String);

/// Reassembles frames from arbitrary read chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    partial: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning every frame completed by it.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        while !chunk.is_empty() {
            // heartbeats only exist between frames
            while self.partial.is_empty() && chunk.first() == Some(&b'\n') {
                chunk = &chunk[1..];
            }
            if chunk.is_empty() {
                break;
            }

            match chunk.iter().position(|&b| b == 0) {
                None => {
                    self.partial.extend_from_slice(chunk);
                    break;
                }
                Some(nul) => {
                    self.partial.extend_from_slice(&chunk[..nul]);
                    let raw = std::mem::take(&mut self.partial);
                    frames.push(parse(&raw)?);
                    chunk = &chunk[nul + 1..];
                }
            }
        }
        Ok(frames)
    }
}

/// Parse one complete frame (without its NUL terminator).
fn parse(raw: &[u8]) -> Result<Frame, FrameError> {
    let command_end = raw
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| FrameError("missing command line".to_owned()))?;
    let command = String::from_utf8_lossy(&raw[..command_end]).into_owned();

    let mut headers = HashMap::new();
    let mut cursor = command_end + 1;
    loop {
        let line_end = raw[cursor..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| cursor + i)
            .ok_or_else(|| FrameError("headers not terminated".to_owned()))?;
        if line_end == cursor {
            // empty line: end of headers
            cursor = line_end + 1;
            break;
        }
        let line = String::from_utf8_lossy(&raw[cursor..line_end]);
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError(format!("header without ':': {line:?}")))?;
        if !headers.contains_key(key) {
            headers.insert(key.to_owned(), value.to_owned());
        }
        cursor = line_end + 1;
    }

    Ok(Frame { command, headers, body: raw[cursor..].to_vec() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_parses() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .feed(b"CONNECTED\nversion:1.1\nheart-beat:0,5000\n\n\0")
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, "CONNECTED");
        assert_eq!(frames[0].header("version"), Some("1.1"));
        assert_eq!(frames[0].header("heart-beat"), Some("0,5000"));
        assert!(frames[0].body.is_empty());
    }

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"RECEIPT\nreceipt").unwrap().is_empty());
        assert!(decoder.feed(b"-id:42\n").unwrap().is_empty());
        let frames = decoder.feed(b"\nbody bytes\0").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header("receipt-id"), Some("42"));
        assert_eq!(frames[0].body, b"body bytes");
    }

    #[test]
    fn heartbeats_between_frames_are_consumed() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .feed(b"\n\nRECEIPT\nreceipt-id:1\n\n\0\n\nRECEIPT\nreceipt-id:2\n\n\0\n")
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header("receipt-id"), Some("1"));
        assert_eq!(frames[1].header("receipt-id"), Some("2"));
    }

    #[test]
    fn newline_inside_a_frame_is_not_a_heartbeat() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"ERROR\nmessage:bad\n\n").unwrap().is_empty());
        // the body starts with '\n'; it must stay part of the frame
        let frames = decoder.feed(b"\nline two\0").unwrap();
        assert_eq!(frames[0].body, b"\nline two");
    }

    #[test]
    fn repeated_headers_keep_the_first_value() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder
            .feed(b"MESSAGE\nfoo:first\nfoo:second\n\n\0")
            .unwrap();
        assert_eq!(frames[0].header("foo"), Some("first"));
    }

    #[test]
    fn header_values_may_contain_colons() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"MESSAGE\ndest:/topic/a:b\n\n\0").unwrap();
        assert_eq!(frames[0].header("dest"), Some("/topic/a:b"));
    }

    #[test]
    fn missing_header_terminator_is_an_error() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"RECEIPT\nreceipt-id:1\0").is_err());
    }

    #[test]
    fn header_line_without_colon_is_an_error() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"RECEIPT\nnocolon\n\n\0").is_err());
    }

    #[test]
    fn command_only_frame_is_an_error() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"RECEIPT\0").is_err());
    }

    #[test]
    fn many_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let mut wire = Vec::new();
        for i in 0..5 {
            wire.extend_from_slice(format!("RECEIPT\nreceipt-id:{i}\n\n\0").as_bytes());
        }
        let frames = decoder.feed(&wire).unwrap();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.header("receipt-id"), Some(i.to_string().as_str()));
        }
    }
}
