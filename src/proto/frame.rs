//! Stream framing.
//!
//! Inbound: `[u32 BE header_len][u32 BE payload_len][header][payload]`.
//! Outbound: `[u32 LE len][response record]`. The splitter owns the read
//! residue: bytes are fed in as they arrive and complete frames come out;
//! an over-declared frame is skipped in place so the reader resynchronises
//! at the next frame boundary.

use super::{codec, Header, Payload, Response};
use crate::config::Limits;

pub const LEN_PREFIX: usize = 4;

/// One raw inbound frame: verified-record bytes, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Encode a full inbound frame (used by the controller side and tests).
pub fn encode_inbound_frame(header: &Header, payload: &Payload) -> Vec<u8> {
    let header_bytes = codec::encode_header(header);
    let payload_bytes = codec::encode_payload(payload);
    let mut out = Vec::with_capacity(2 * LEN_PREFIX + header_bytes.len() + payload_bytes.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&(payload_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&payload_bytes);
    out
}

/// Encode a full outbound frame.
pub fn encode_outbound_frame(response: &Response) -> Vec<u8> {
    let body = codec::encode_response(response);
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Incremental splitter for the inbound stream.
pub struct FrameSplitter {
    buf: Vec<u8>,
    /// Bytes of an over-declared frame still to discard.
    skip: usize,
    max_frame_bytes: usize,
    oversize_dropped: u64,
}

impl FrameSplitter {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            skip: 0,
            max_frame_bytes,
            oversize_dropped: 0,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.discard_skipped();
    }

    /// Number of buffered residue bytes awaiting the rest of a frame.
    pub fn residue(&self) -> usize {
        self.buf.len()
    }

    pub fn oversize_dropped(&self) -> u64 {
        self.oversize_dropped
    }

    /// Pop the next complete frame, or `None` when fewer than a full frame
    /// remains buffered.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            self.discard_skipped();
            if self.buf.len() < 2 * LEN_PREFIX {
                return None;
            }

            let header_len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            let payload_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            let body_len = header_len + payload_len;

            if body_len > self.max_frame_bytes {
                // Lengths are trusted for resynchronisation even when the
                // frame itself is refused.
                self.oversize_dropped += 1;
                self.skip = 2 * LEN_PREFIX + body_len;
                continue;
            }

            let total = 2 * LEN_PREFIX + body_len;
            if self.buf.len() < total {
                return None;
            }

            let header = self.buf[2 * LEN_PREFIX..2 * LEN_PREFIX + header_len].to_vec();
            let payload = self.buf[2 * LEN_PREFIX + header_len..total].to_vec();
            self.buf.drain(..total);
            return Some(RawFrame { header, payload });
        }
    }

    fn discard_skipped(&mut self) {
        if self.skip == 0 {
            return;
        }
        let n = self.skip.min(self.buf.len());
        self.buf.drain(..n);
        self.skip -= n;
    }
}

/// Incremental splitter for the outbound stream (controller side, tests).
pub struct OutboundSplitter {
    buf: Vec<u8>,
}

impl OutboundSplitter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_body(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < LEN_PREFIX {
            return None;
        }
        let len =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < LEN_PREFIX + len {
            return None;
        }
        let body = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Some(body)
    }

    pub fn next_response(&mut self) -> Option<Result<Response, codec::DecodeError>> {
        // Controller-side helper; default limits match what the worker
        // will ever emit.
        self.next_body()
            .map(|body| codec::decode_response(&body, &Limits::default()))
    }
}

impl Default for OutboundSplitter {
    fn default() -> Self {
        Self::new()
    }
}
