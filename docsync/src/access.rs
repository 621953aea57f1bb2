//! Authorization checked during the connection handshake.
//!
//! A denied request is answered with HTTP 403 before the upgrade completes,
//! so it never reaches the registry or the merge engine.

use crate::protocol::DocumentId;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Reason an access check failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessDenied {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("credentials not valid for document {0}")]
    Forbidden(DocumentId),
}

/// Decides whether a caller may join a document.
pub trait AccessPolicy: Send + Sync + 'static {
    /// `credentials` is the bearer token or `token` query parameter, if any.
    fn authorize(&self, document: &DocumentId, credentials: Option<&str>) -> Result<(), AccessDenied>;
}

/// Lets everyone in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _document: &DocumentId, _credentials: Option<&str>) -> Result<(), AccessDenied> {
        Ok(())
    }
}

/// Static token → documents grants.
///
/// A token granted the wildcard has access to every document.
#[derive(Debug, Default)]
pub struct TokenPolicy {
    grants: RwLock<HashMap<String, Grant>>,
}

#[derive(Debug, Default)]
struct Grant {
    all: bool,
    documents: HashSet<DocumentId>,
}

impl TokenPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, token: impl Into<String>, document: DocumentId) {
        if let Ok(mut grants) = self.grants.write() {
            grants.entry(token.into()).or_default().documents.insert(document);
        }
    }

    pub fn grant_all(&self, token: impl Into<String>) {
        if let Ok(mut grants) = self.grants.write() {
            grants.entry(token.into()).or_default().all = true;
        }
    }

    pub fn revoke(&self, token: &str) {
        if let Ok(mut grants) = self.grants.write() {
            grants.remove(token);
        }
    }
}

impl AccessPolicy for TokenPolicy {
    fn authorize(&self, document: &DocumentId, credentials: Option<&str>) -> Result<(), AccessDenied> {
        let token = credentials.ok_or(AccessDenied::MissingCredentials)?;
        let grants = self
            .grants
            .read()
            .map_err(|_| AccessDenied::Forbidden(document.clone()))?;
        match grants.get(token) {
            Some(grant) if grant.all || grant.documents.contains(document) => Ok(()),
            _ => Err(AccessDenied::Forbidden(document.clone())),
        }
    }
}
