//! Message protocol definitions
//!
//! The wire format is a length-prefixed text frame:
//!
//! ```text
//! <length>##<kind>$$<body>
//! ```
//!
//! where `<length>` is the decimal UTF-8 byte count of the payload
//! `<kind>$$<body>`, `##` separates the header from the payload and `$$`
//! separates the kind token from the optional body. A message without a
//! body carries the kind token alone, with no `$$`.
//!
//! These are pure string functions; all I/O lives elsewhere.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Separates the decimal length header from the payload.
pub const LENGTH_DELIMITER: &str = "##";

/// Separates the kind token from the body inside a payload.
pub const TYPE_DELIMITER: &str = "$$";

/// Safety cap on a single payload. A length header claiming more than this
/// is treated as a protocol violation rather than an allocation request.
pub const MAX_PAYLOAD_LENGTH: usize = 1024 * 1024;

/// Message kind
///
/// `User`, `Entry` and `Disconnect` travel client to server;
/// `Broadcast` travels server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Sets the sender's username
    User,
    /// A chat line to be broadcast
    Entry,
    /// Orderly goodbye before the client closes
    Disconnect,
    /// A conversation entry fanned out by the server
    Broadcast,
}

impl MsgKind {
    /// The uppercase wire token for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::User => "USER",
            MsgKind::Entry => "ENTRY",
            MsgKind::Disconnect => "DISCONNECT",
            MsgKind::Broadcast => "BROADCAST",
        }
    }
}

impl FromStr for MsgKind {
    type Err = ProtocolError;

    /// Parses a kind token, case-insensitively.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.to_ascii_uppercase().as_str() {
            "USER" => Ok(MsgKind::User),
            "ENTRY" => Ok(MsgKind::Entry),
            "DISCONNECT" => Ok(MsgKind::Disconnect),
            "BROADCAST" => Ok(MsgKind::Broadcast),
            _ => Err(ProtocolError::UnknownKind {
                kind: token.to_string(),
            }),
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prepends the decimal length header to a payload.
///
/// The length counts UTF-8 bytes of the payload, so multi-byte characters
/// contribute more than one unit.
pub fn prepend_length_header(payload: &str) -> String {
    format!("{}{}{}", payload.len(), LENGTH_DELIMITER, payload)
}

/// Builds a complete frame from a kind and an optional body.
pub fn encode_message(kind: MsgKind, body: Option<&str>) -> String {
    let payload = match body {
        Some(body) => format!("{}{}{}", kind.as_str(), TYPE_DELIMITER, body),
        None => kind.as_str().to_string(),
    };
    prepend_length_header(&payload)
}

/// Returns the kind of a decoded payload.
pub fn kind_of(payload: &str) -> Result<MsgKind, ProtocolError> {
    let token = payload
        .split_once(TYPE_DELIMITER)
        .map(|(kind, _)| kind)
        .unwrap_or(payload);
    token.parse()
}

/// Returns the body of a decoded payload, trimmed of surrounding
/// whitespace, or the empty string when the payload has no body.
///
/// The payload is split at the first `$$`, so a body may itself contain
/// the delimiter.
pub fn body_of(payload: &str) -> &str {
    payload
        .split_once(TYPE_DELIMITER)
        .map(|(_, body)| body.trim())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_with_body() {
        assert_eq!(encode_message(MsgKind::User, Some("ann")), "9##USER$$ann");
        assert_eq!(encode_message(MsgKind::Entry, Some("hi")), "9##ENTRY$$hi");
    }

    #[test]
    fn test_encode_without_body() {
        assert_eq!(encode_message(MsgKind::Disconnect, None), "10##DISCONNECT");
    }

    #[test]
    fn test_length_counts_utf8_bytes() {
        // 'é' is two bytes in UTF-8
        let frame = prepend_length_header("ENTRY$$héj");
        assert_eq!(frame, "11##ENTRY$$héj");
    }

    #[test]
    fn test_kind_of_with_and_without_body() {
        assert_eq!(kind_of("USER$$ann").unwrap(), MsgKind::User);
        assert_eq!(kind_of("DISCONNECT").unwrap(), MsgKind::Disconnect);
    }

    #[test]
    fn test_kind_of_is_case_insensitive() {
        assert_eq!(kind_of("user$$ann").unwrap(), MsgKind::User);
        assert_eq!(kind_of("Broadcast$$x").unwrap(), MsgKind::Broadcast);
    }

    #[test]
    fn test_kind_of_rejects_unknown_token() {
        let err = kind_of("PING$$x").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnknownKind {
                kind: "PING".to_string()
            }
        );
    }

    #[test]
    fn test_body_of_trims_whitespace() {
        assert_eq!(body_of("ENTRY$$  hi there  "), "hi there");
    }

    #[test]
    fn test_body_of_missing_body_is_empty() {
        assert_eq!(body_of("DISCONNECT"), "");
        assert_eq!(body_of("ENTRY$$"), "");
    }

    #[test]
    fn test_body_may_contain_type_delimiter() {
        assert_eq!(body_of("ENTRY$$a$$b"), "a$$b");
        assert_eq!(kind_of("ENTRY$$a$$b").unwrap(), MsgKind::Entry);
    }

    #[test]
    fn test_kind_display_matches_wire_token() {
        assert_eq!(MsgKind::Broadcast.to_string(), "BROADCAST");
    }
}
