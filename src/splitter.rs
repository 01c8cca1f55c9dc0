//! Stream reassembly
//!
//! TCP delivers a byte stream with no message boundaries: a single read may
//! contain half a frame, several frames, or the tail of one frame and the
//! head of the next. The `Splitter` accumulates received bytes and extracts
//! complete payloads as they become available.
//!
//! Each connection owns exactly one splitter and drives it from its I/O
//! thread, so no internal locking is needed.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::{LENGTH_DELIMITER, MAX_PAYLOAD_LENGTH};

/// Longest acceptable length header. `MAX_PAYLOAD_LENGTH` has seven digits,
/// so anything beyond this cannot be the start of a valid frame.
const MAX_HEADER_DIGITS: usize = 20;

/// Reassembles length-prefixed frames from arbitrary byte chunks.
///
/// Feed received bytes with [`append`](Splitter::append); consume completed
/// payloads with [`next_payload`](Splitter::next_payload). After every
/// `append` the internal buffer holds at most one incomplete frame: either
/// an unfinished length header or a length-known but under-filled payload.
#[derive(Debug, Default)]
pub struct Splitter {
    recvd: BytesMut,
    payloads: VecDeque<String>,
}

impl Splitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a newly received chunk and extracts every complete payload.
    ///
    /// Returns a [`ProtocolError`] when the stream cannot be a valid frame
    /// sequence: a non-numeric length header, a header over the safety cap,
    /// or payload bytes that are not UTF-8. The caller is expected to close
    /// the connection; the splitter is not usable afterwards.
    pub fn append(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        self.recvd.extend_from_slice(chunk);
        while self.extract()? {}
        Ok(())
    }

    /// True if at least one complete payload is waiting to be consumed.
    pub fn has_next(&self) -> bool {
        !self.payloads.is_empty()
    }

    /// The next completed payload, in arrival order.
    pub fn next_payload(&mut self) -> Option<String> {
        self.payloads.pop_front()
    }

    /// Takes everything decoded so far, in arrival order.
    pub fn drain_payloads(&mut self) -> Vec<String> {
        self.payloads.drain(..).collect()
    }

    /// Splits the accumulator at the first `##`, parses the length header
    /// and, if enough bytes have arrived, moves one payload to the queue.
    /// Returns true when a payload was extracted and another attempt may
    /// succeed.
    fn extract(&mut self) -> Result<bool, ProtocolError> {
        let Some(at) = find(&self.recvd, LENGTH_DELIMITER.as_bytes()) else {
            // No delimiter yet. Whatever is buffered must be the start of a
            // length header; more digits than any valid header can have
            // means the stream is garbage.
            if self.recvd.len() > MAX_HEADER_DIGITS {
                return Err(ProtocolError::InvalidLengthHeader {
                    header: String::from_utf8_lossy(&self.recvd).into_owned(),
                });
            }
            return Ok(false);
        };

        let header = String::from_utf8_lossy(&self.recvd[..at]).into_owned();
        let length: usize = header
            .parse()
            .map_err(|_| ProtocolError::InvalidLengthHeader {
                header: header.clone(),
            })?;
        if length > MAX_PAYLOAD_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                length,
                max: MAX_PAYLOAD_LENGTH,
            });
        }

        let payload_start = at + LENGTH_DELIMITER.len();
        let frame_end = payload_start + length;
        if self.recvd.len() < frame_end {
            return Ok(false);
        }

        let payload = std::str::from_utf8(&self.recvd[payload_start..frame_end])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        self.payloads.push_back(payload);
        self.recvd.advance(frame_end);
        Ok(true)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn frames(bodies: &[&str]) -> String {
        bodies
            .iter()
            .map(|body| crate::protocol::prepend_length_header(body))
            .collect()
    }

    #[test]
    fn test_single_frame() {
        let mut splitter = Splitter::new();
        splitter.append(b"9##USER$$ann").unwrap();
        assert!(splitter.has_next());
        assert_eq!(splitter.next_payload().unwrap(), "USER$$ann");
        assert!(!splitter.has_next());
    }

    #[test]
    fn test_partial_frame_across_chunks() {
        let mut splitter = Splitter::new();
        splitter.append(b"9##USE").unwrap();
        assert!(!splitter.has_next());
        splitter.append(b"R$$eve").unwrap();
        assert_eq!(splitter.next_payload().unwrap(), "USER$$eve");
    }

    #[test]
    fn test_header_split_across_chunks() {
        let mut splitter = Splitter::new();
        splitter.append(b"1").unwrap();
        splitter.append(b"0#").unwrap();
        splitter.append(b"#DISCONNECT").unwrap();
        assert_eq!(splitter.next_payload().unwrap(), "DISCONNECT");
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut splitter = Splitter::new();
        splitter.append(b"9##USER$$ann9##ENTRY$$hi").unwrap();
        assert_eq!(splitter.next_payload().unwrap(), "USER$$ann");
        assert_eq!(splitter.next_payload().unwrap(), "ENTRY$$hi");
        assert_eq!(splitter.next_payload(), None);
    }

    #[test]
    fn test_at_most_one_incomplete_frame_buffered() {
        let mut splitter = Splitter::new();
        splitter.append(b"9##USER$$ann5##ENT").unwrap();
        // The completed frame left the buffer; only the partial one remains.
        assert_eq!(splitter.recvd.as_ref(), b"5##ENT");
        splitter.append(b"RY").unwrap();
        assert_eq!(splitter.next_payload().unwrap(), "USER$$ann");
        assert_eq!(splitter.next_payload().unwrap(), "ENTRY");
        assert!(splitter.recvd.is_empty());
    }

    #[test]
    fn test_zero_length_payload() {
        let mut splitter = Splitter::new();
        splitter.append(b"0##").unwrap();
        assert_eq!(splitter.next_payload().unwrap(), "");
    }

    #[test]
    fn test_payload_may_contain_length_delimiter() {
        // The header is found at the first `##`; the payload is then sliced
        // by length, so delimiters inside it are data.
        let wire = frames(&["ENTRY$$a##b"]);
        let mut splitter = Splitter::new();
        splitter.append(wire.as_bytes()).unwrap();
        assert_eq!(splitter.next_payload().unwrap(), "ENTRY$$a##b");
    }

    #[test]
    fn test_non_numeric_header_is_rejected() {
        let mut splitter = Splitter::new();
        let err = splitter.append(b"abc##USER$$x").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidLengthHeader {
                header: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_negative_header_is_rejected() {
        let mut splitter = Splitter::new();
        assert!(matches!(
            splitter.append(b"-3##USER$$x").unwrap_err(),
            ProtocolError::InvalidLengthHeader { .. }
        ));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let mut splitter = Splitter::new();
        let err = splitter.append(b"1048577##x").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::PayloadTooLarge {
                length: MAX_PAYLOAD_LENGTH + 1,
                max: MAX_PAYLOAD_LENGTH
            }
        );
    }

    #[test]
    fn test_endless_header_is_rejected() {
        let mut splitter = Splitter::new();
        let err = splitter
            .append(b"123456789012345678901234567890")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLengthHeader { .. }));
    }

    #[test]
    fn test_invalid_utf8_payload_is_rejected() {
        let mut splitter = Splitter::new();
        let err = splitter.append(b"2##\xff\xfe").unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8);
    }

    #[test]
    fn test_multibyte_payload_length_is_bytes() {
        // "ENTRY$$héj" is 11 bytes but 10 characters.
        let mut splitter = Splitter::new();
        splitter.append("11##ENTRY$$héj".as_bytes()).unwrap();
        assert_eq!(splitter.next_payload().unwrap(), "ENTRY$$héj");
    }

    #[test]
    fn test_every_chunk_size_yields_same_payloads() {
        let wire = frames(&["USER$$ann", "ENTRY$$hello world", "DISCONNECT"]);
        for size in 1..=wire.len() {
            let mut splitter = Splitter::new();
            for chunk in wire.as_bytes().chunks(size) {
                splitter.append(chunk).unwrap();
            }
            assert_eq!(
                splitter.drain_payloads(),
                vec!["USER$$ann", "ENTRY$$hello world", "DISCONNECT"],
                "chunk size {size}"
            );
        }
    }

    proptest! {
        /// Any partition of any frame sequence into chunks decodes to the
        /// original payloads in order.
        #[test]
        fn prop_chunking_is_invariant(
            bodies in prop::collection::vec("[a-zA-Z0-9 .!?]{0,40}", 1..8),
            chunk_size in 1usize..32,
        ) {
            let payloads: Vec<String> =
                bodies.iter().map(|b| format!("ENTRY$${b}")).collect();
            let wire: String = payloads
                .iter()
                .map(|p| crate::protocol::prepend_length_header(p))
                .collect();

            let mut splitter = Splitter::new();
            for chunk in wire.as_bytes().chunks(chunk_size) {
                splitter.append(chunk).unwrap();
            }
            prop_assert_eq!(splitter.drain_payloads(), payloads);
        }
    }
}
