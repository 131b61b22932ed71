//! Message framing: the strategy that turns a raw byte stream into discrete
//! `NetMessage`s and back. Each connection owns its own framing instance
//! because framing state is per-stream.

use crate::buffer::NetMessage;
use crate::error::Error;

/// Sentinel returned by `bytes_wanna_read` for stream-oriented framings that
/// accept any number of bytes per read.
pub const ANY_BYTES: usize = usize::MAX;

/// The four-capability framing contract.
///
/// The connection read loop drives `bytes_wanna_read`/`decode`: it reads
/// exactly the requested byte count (or a best-effort chunk for `ANY_BYTES`),
/// hands it to `decode`, and expects the full slice to be consumed. A return
/// of 0 from `bytes_wanna_read` stops the read loop for good.
///
/// The write path calls `bytes_wanna_write` to size the outbound buffer and
/// `encode` to serialize, in one pass per batch.
pub trait MessageFraming: Send {
    fn bytes_wanna_read(&mut self) -> usize;

    fn bytes_wanna_write(&self, messages: &[NetMessage]) -> usize;

    /// Consumes bytes from `buffer`, appending any completed messages to
    /// `received`. Returns the number of bytes consumed, which must equal
    /// `buffer.len()` for exact-size reads.
    fn decode(&mut self, buffer: &[u8], received: &mut Vec<NetMessage>) -> Result<usize, Error>;

    /// Serializes `messages` onto the end of `buffer`, returning the number
    /// of bytes appended.
    fn encode(&self, messages: &[NetMessage], buffer: &mut Vec<u8>) -> Result<usize, Error>;
}

/// Factory producing one framing instance per connection.
pub type FramingFactory = std::sync::Arc<dyn Fn() -> Box<dyn MessageFraming> + Send + Sync>;

pub const FRAME_HEADER_SIZE: usize = 2;

/// Largest payload a 2-byte length header can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

enum FrameState {
    AwaitingHeader,
    AwaitingBody(u16),
}

/// Default framing: a 2-byte big-endian length header followed by exactly
/// that many payload bytes. Oversized outbound payloads are rejected with
/// `Error::OversizedPayload` rather than truncated.
pub struct LengthPrefixFraming {
    state: FrameState,
}

impl Default for LengthPrefixFraming {
    fn default() -> Self {
        Self::new()
    }
}

impl LengthPrefixFraming {
    pub fn new() -> Self {
        Self {
            state: FrameState::AwaitingHeader,
        }
    }

    /// Factory for the default framing, convenient for server/client setup.
    pub fn factory() -> FramingFactory {
        std::sync::Arc::new(|| Box::new(LengthPrefixFraming::new()))
    }
}

impl MessageFraming for LengthPrefixFraming {
    fn bytes_wanna_read(&mut self) -> usize {
        match self.state {
            FrameState::AwaitingHeader => FRAME_HEADER_SIZE,
            FrameState::AwaitingBody(length) => length as usize,
        }
    }

    fn bytes_wanna_write(&self, messages: &[NetMessage]) -> usize {
        messages
            .iter()
            .map(|m| FRAME_HEADER_SIZE + m.readable())
            .sum()
    }

    fn decode(&mut self, buffer: &[u8], received: &mut Vec<NetMessage>) -> Result<usize, Error> {
        match self.state {
            FrameState::AwaitingHeader => {
                debug_assert!(buffer.len() >= FRAME_HEADER_SIZE);
                let length = u16::from_be_bytes([buffer[0], buffer[1]]);
                if length == 0 {
                    // empty frame; complete it here so the read loop never
                    // waits on a zero-byte body.
                    received.push(NetMessage::new());
                } else {
                    self.state = FrameState::AwaitingBody(length);
                }
                Ok(FRAME_HEADER_SIZE)
            }
            FrameState::AwaitingBody(length) => {
                let length = length as usize;
                debug_assert!(buffer.len() >= length);
                let mut message = NetMessage::with_capacity(length);
                message.write(&buffer[..length]);
                received.push(message);
                self.state = FrameState::AwaitingHeader;
                Ok(length)
            }
        }
    }

    fn encode(&self, messages: &[NetMessage], buffer: &mut Vec<u8>) -> Result<usize, Error> {
        let mut total = 0usize;
        for message in messages {
            let length = message.readable();
            if length > MAX_FRAME_PAYLOAD {
                return Err(Error::OversizedPayload {
                    size: length,
                    max: MAX_FRAME_PAYLOAD,
                });
            }
            buffer.extend_from_slice(&(length as u16).to_be_bytes());
            buffer.extend_from_slice(message.data());
            total += FRAME_HEADER_SIZE + length;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_stream(framing: &mut LengthPrefixFraming, mut wire: &[u8]) -> Vec<NetMessage> {
        let mut received = Vec::new();
        while !wire.is_empty() {
            let want = framing.bytes_wanna_read();
            assert!(want > 0 && want <= wire.len());
            let consumed = framing.decode(&wire[..want], &mut received).unwrap();
            assert_eq!(consumed, want);
            wire = &wire[want..];
        }
        received
    }

    #[test]
    pub fn test_roundtrip_law() {
        let inputs: Vec<&[u8]> = vec![b"ping", b"", b"a longer payload body", &[0xFFu8; 300]];
        let messages: Vec<NetMessage> = inputs.iter().map(|b| NetMessage::from_slice(b)).collect();

        let framing = LengthPrefixFraming::new();
        let mut wire = Vec::new();
        let written = framing.encode(&messages, &mut wire).unwrap();
        assert_eq!(written, wire.len());
        assert_eq!(written, framing.bytes_wanna_write(&messages));

        let mut decoder = LengthPrefixFraming::new();
        let received = decode_stream(&mut decoder, &wire);
        assert_eq!(received.len(), inputs.len());
        for (msg, expect) in received.iter().zip(inputs.iter()) {
            assert_eq!(msg.data(), *expect);
        }
    }

    #[test]
    pub fn test_known_wire_bytes() {
        // "ping" frames as 00 04 70 69 6e 67.
        let framing = LengthPrefixFraming::new();
        let mut wire = Vec::new();
        framing
            .encode(&[NetMessage::from_slice(b"ping")], &mut wire)
            .unwrap();
        assert_eq!(wire, vec![0x00, 0x04, 0x70, 0x69, 0x6e, 0x67]);
    }

    #[test]
    pub fn test_header_then_body_states() {
        let mut framing = LengthPrefixFraming::new();
        assert_eq!(framing.bytes_wanna_read(), FRAME_HEADER_SIZE);
        let mut received = Vec::new();
        framing.decode(&[0x00, 0x03], &mut received).unwrap();
        assert!(received.is_empty());
        assert_eq!(framing.bytes_wanna_read(), 3);
        framing.decode(b"abc", &mut received).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data(), b"abc");
        assert_eq!(framing.bytes_wanna_read(), FRAME_HEADER_SIZE);
    }

    #[test]
    pub fn test_zero_length_frame_completes_immediately() {
        let mut framing = LengthPrefixFraming::new();
        let mut received = Vec::new();
        framing.decode(&[0x00, 0x00], &mut received).unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].is_empty());
        // no body wait; straight back to the next header.
        assert_eq!(framing.bytes_wanna_read(), FRAME_HEADER_SIZE);
    }

    #[test]
    pub fn test_oversized_payload_rejected() {
        let framing = LengthPrefixFraming::new();
        let big = NetMessage::from_slice(&vec![0u8; MAX_FRAME_PAYLOAD + 1]);
        let mut wire = Vec::new();
        match framing.encode(&[big], &mut wire) {
            Err(Error::OversizedPayload { size, max }) => {
                assert_eq!(size, MAX_FRAME_PAYLOAD + 1);
                assert_eq!(max, MAX_FRAME_PAYLOAD);
            }
            other => panic!("expected OversizedPayload, got {:?}", other.map(|_| ())),
        }
        assert!(wire.len() <= FRAME_HEADER_SIZE + MAX_FRAME_PAYLOAD);
    }
}
