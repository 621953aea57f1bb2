//! Wire-level glue for document connections.
//!
//! The document endpoint is one logical address per document:
//! ```text
//! ws://host:port/doc/<document-id>[?token=...]
//!                └─┬─┘└─────┬─────┘
//!              prefix   opaque token (no path separators)
//! ```
//!
//! Frames on an established connection are binary only and opaque to the
//! router and relay. The first frame the server sends is the full-state
//! encoding of the document; every later frame (in either direction) is an
//! incremental delta. Both are interpreted solely by the merge engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default path prefix identifying document connections.
pub const DEFAULT_DOCUMENT_PREFIX: &str = "/doc/";

/// Longest accepted document id token.
pub const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Close code sent when the document id token is malformed (RFC 6455 1008).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code sent when the server fails to open the session (RFC 6455 1011).
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close code sent to peers evicted for falling behind the relay (RFC 6455 1013).
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Application close code: the document was restored, reconnect to resync.
pub const CLOSE_DOCUMENT_RESET: u16 = 4001;

/// Validated document id token.
///
/// Accepts ASCII alphanumerics, `-` and `_` only, so UUIDs and slugs such as
/// `doc-1` pass while anything containing separators, dots or escapes is
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Parse and validate a raw token.
    pub fn parse(token: &str) -> Result<Self, ProtocolError> {
        if token.is_empty() {
            return Err(ProtocolError::EmptyDocumentId);
        }
        if token.len() > MAX_DOCUMENT_ID_LEN {
            return Err(ProtocolError::InvalidDocumentId(truncate(token)));
        }
        let valid = token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(ProtocolError::InvalidDocumentId(truncate(token)));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DocumentId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

fn truncate(token: &str) -> String {
    token.chars().take(32).collect()
}

/// Match a request path against the document endpoint pattern.
///
/// Returns the raw (unvalidated) token when `path` is `<prefix><token>` and
/// the token contains no further path separator. Anything else is not a
/// document connection and must be left for other handlers.
pub fn match_document_path<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let token = path.strip_prefix(prefix)?;
    if token.contains('/') {
        return None;
    }
    Some(token)
}

/// Look up a single query parameter value (no percent-decoding).
pub fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("document id is empty")]
    EmptyDocumentId,
    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_accepts_uuid_and_slug() {
        assert!(DocumentId::parse("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(DocumentId::parse("doc-1").is_ok());
        assert!(DocumentId::parse("meeting_notes").is_ok());
    }

    #[test]
    fn test_document_id_rejects_malformed() {
        assert!(matches!(
            DocumentId::parse(""),
            Err(ProtocolError::EmptyDocumentId)
        ));
        for bad in ["a/b", "..", "doc 1", "doc%2F1", "doc.1", "dóc"] {
            assert!(
                matches!(DocumentId::parse(bad), Err(ProtocolError::InvalidDocumentId(_))),
                "{bad:?} should be rejected"
            );
        }
        let long = "x".repeat(MAX_DOCUMENT_ID_LEN + 1);
        assert!(DocumentId::parse(&long).is_err());
    }

    #[test]
    fn test_match_document_path() {
        assert_eq!(match_document_path("/doc/", "/doc/abc"), Some("abc"));
        assert_eq!(match_document_path("/doc/", "/doc/"), Some(""));
        assert_eq!(match_document_path("/doc/", "/doc/a/b"), None);
        assert_eq!(match_document_path("/doc/", "/chat/room"), None);
        assert_eq!(match_document_path("/doc/", "/"), None);
    }

    #[test]
    fn test_query_param() {
        let query = "token=secret&x=1";
        assert_eq!(query_param(query, "token"), Some("secret"));
        assert_eq!(query_param(query, "x"), Some("1"));
        assert_eq!(query_param(query, "missing"), None);
    }

    #[test]
    fn test_document_id_serde_validates() {
        let id = DocumentId::parse("doc-1").unwrap();
        let bytes = bincode::serde::encode_to_vec(&id, bincode::config::standard()).unwrap();
        let (decoded, _): (DocumentId, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, id);

        let bad = bincode::serde::encode_to_vec("a/b", bincode::config::standard()).unwrap();
        let result: Result<(DocumentId, usize), _> =
            bincode::serde::decode_from_slice(&bad, bincode::config::standard());
        assert!(result.is_err());
    }
}
