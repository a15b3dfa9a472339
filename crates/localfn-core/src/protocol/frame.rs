//! Length-prefixed frames exchanged with the bootstrap shim
//!
//! ```text
//! LOCALFN-EVENT <len>\n<len bytes of JSON>                  (engine -> shim, stdin)
//! LOCALFN-RESPONSE <ok|error> <len>\n<len bytes of JSON>    (shim -> engine, stdout)
//! ```
//!
//! The response decoder is incremental: exec output arrives in arbitrary
//! chunks, and anything printed on stdout before the header is treated as
//! function log output rather than a protocol violation.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const EVENT_HEADER: &str = "LOCALFN-EVENT";
pub const RESPONSE_HEADER: &str = "LOCALFN-RESPONSE";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame header: {0}")]
    MalformedHeader(String),
    #[error("Invalid frame length: {0}")]
    InvalidLength(String),
    #[error("Frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
    #[error("Frame body is not valid JSON: {0}")]
    InvalidBody(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Ok,
    Error,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Ok => "ok",
            ResponseKind::Error => "error",
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "ok" => Some(ResponseKind::Ok),
            "error" => Some(ResponseKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub kind: ResponseKind,
    pub body: Vec<u8>,
}

impl ResponseFrame {
    /// Body parsed as JSON; an empty body is `null`.
    pub fn json(&self) -> Result<Value, FrameError> {
        if self.body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body).map_err(|e| FrameError::InvalidBody(e.to_string()))
    }
}

pub fn encode_event(payload: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(payload)?;
    let mut frame = format!("{} {}\n", EVENT_HEADER, body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_event(bytes: &[u8]) -> Result<Value, FrameError> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| FrameError::MalformedHeader("missing newline".to_string()))?;
    let header = String::from_utf8_lossy(&bytes[..newline]);
    let mut parts = header.trim_end_matches('\r').split_whitespace();
    if parts.next() != Some(EVENT_HEADER) {
        return Err(FrameError::MalformedHeader(header.to_string()));
    }
    let len = parse_length(parts.next())?;
    if parts.next().is_some() {
        return Err(FrameError::MalformedHeader(header.to_string()));
    }
    let body = &bytes[newline + 1..];
    if body.len() < len {
        return Err(FrameError::Truncated {
            expected: len,
            received: body.len(),
        });
    }
    serde_json::from_slice(&body[..len]).map_err(|e| FrameError::InvalidBody(e.to_string()))
}

pub fn encode_response(kind: ResponseKind, body: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(body)?;
    let mut frame = format!("{} {} {}\n", RESPONSE_HEADER, kind, body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn parse_length(token: Option<&str>) -> Result<usize, FrameError> {
    let token = token.ok_or_else(|| FrameError::InvalidLength("missing".to_string()))?;
    token
        .parse::<usize>()
        .map_err(|_| FrameError::InvalidLength(token.to_string()))
}

#[derive(Debug)]
enum DecoderState {
    SeekingHeader,
    Body { kind: ResponseKind, len: usize },
    Done,
}

/// Incremental decoder for the shim's stdout.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: DecoderState,
    buffer: Vec<u8>,
    passthrough: Vec<u8>,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::SeekingHeader,
            buffer: Vec::new(),
            passthrough: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        match self.state {
            // Output after the terminal frame is plain log text.
            DecoderState::Done => self.passthrough.extend_from_slice(chunk),
            _ => self.buffer.extend_from_slice(chunk),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, DecoderState::Done)
    }

    /// Return the response frame once it is complete.
    pub fn next_frame(&mut self) -> Result<Option<ResponseFrame>, FrameError> {
        loop {
            match self.state {
                DecoderState::Done => return Ok(None),
                DecoderState::SeekingHeader => {
                    let Some(start) = find(&self.buffer, RESPONSE_HEADER.as_bytes()) else {
                        self.flush_complete_lines();
                        return Ok(None);
                    };
                    let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n')
                    else {
                        // Keep the partial header line until the rest arrives.
                        self.passthrough.extend(self.buffer.drain(..start));
                        return Ok(None);
                    };
                    let end = start + offset;
                    let (kind, len) = parse_response_header(&self.buffer[start..end])?;
                    self.passthrough.extend_from_slice(&self.buffer[..start]);
                    self.buffer.drain(..=end);
                    self.state = DecoderState::Body { kind, len };
                }
                DecoderState::Body { kind, len } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..len).collect();
                    self.passthrough.append(&mut self.buffer);
                    self.state = DecoderState::Done;
                    return Ok(Some(ResponseFrame { kind, body }));
                }
            }
        }
    }

    /// Called once the output stream has ended. Whatever is still buffered is
    /// either a complete frame, a truncated one, or log text.
    pub fn finish(&mut self) -> Result<Option<ResponseFrame>, FrameError> {
        if let Some(frame) = self.next_frame()? {
            return Ok(Some(frame));
        }
        match self.state {
            DecoderState::Body { len, .. } => Err(FrameError::Truncated {
                expected: len,
                received: self.buffer.len(),
            }),
            DecoderState::SeekingHeader => {
                if self.buffer.starts_with(RESPONSE_HEADER.as_bytes()) {
                    return Err(FrameError::MalformedHeader(
                        String::from_utf8_lossy(&self.buffer).into_owned(),
                    ));
                }
                self.passthrough.append(&mut self.buffer);
                Ok(None)
            }
            DecoderState::Done => Ok(None),
        }
    }

    /// Log text seen on stdout so far, outside the frame.
    pub fn take_passthrough(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.passthrough)
    }

    fn flush_complete_lines(&mut self) {
        // A header may still be split across chunks, so only whole lines
        // without one are released.
        if let Some(last) = self.buffer.iter().rposition(|b| *b == b'\n') {
            self.passthrough.extend(self.buffer.drain(..=last));
        }
    }
}

fn parse_response_header(line: &[u8]) -> Result<(ResponseKind, usize), FrameError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches('\r');
    let mut parts = text.split_whitespace();
    if parts.next() != Some(RESPONSE_HEADER) {
        return Err(FrameError::MalformedHeader(text.to_string()));
    }
    let kind = parts
        .next()
        .and_then(ResponseKind::parse)
        .ok_or_else(|| FrameError::MalformedHeader(text.to_string()))?;
    let len = parse_length(parts.next())?;
    if parts.next().is_some() {
        return Err(FrameError::MalformedHeader(text.to_string()));
    }
    Ok((kind, len))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
