//! Upgrade routing over a shared listener.
//!
//! Every incoming upgrade is offered to an ordered chain of routes. Each
//! route declares through a pure [`UpgradeRoute::claims`] predicate whether
//! the request path is its own; the first claimant completes the handshake
//! and owns the connection. A route never sees, let alone consumes, a
//! request it did not claim. With no claimant the handshake is refused
//! with 404.

use crate::access::AccessPolicy;
use crate::merge::CrdtDocument;
use crate::protocol::{
    match_document_path, query_param, DocumentId, ProtocolError, CLOSE_DOCUMENT_RESET,
    CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION, CLOSE_TRY_AGAIN_LATER,
};
use crate::registry::SessionRegistry;
use crate::relay::{ClientId, RelayEvent};
use crate::server::ServerStats;
use crate::session::{Attachment, DocumentSession};
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

/// An upgraded server-side connection.
pub type ServerSocket = WebSocketStream<TcpStream>;

/// What a route learns about the request it claimed.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub path: String,
    /// Bearer token from the `Authorization` header, else the `token`
    /// query parameter.
    pub credentials: Option<String>,
    pub peer: SocketAddr,
}

impl RouteRequest {
    fn from_request(request: &Request, peer: SocketAddr) -> Self {
        Self {
            path: request.uri().path().to_string(),
            credentials: request_credentials(request),
            peer,
        }
    }
}

/// Credentials presented with an upgrade request.
pub fn request_credentials(request: &Request) -> Option<String> {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    bearer.or_else(|| {
        request
            .uri()
            .query()
            .and_then(|query| query_param(query, "token"))
            .map(str::to_string)
    })
}

/// Build a handshake rejection.
pub fn error_response(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// One handler sharing the listener.
pub trait UpgradeRoute: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether this route owns `path`. Must not have side effects.
    fn claims(&self, path: &str) -> bool;

    /// Last chance to refuse a claimed request before the upgrade completes.
    fn accept(&self, _request: &Request) -> Result<(), ErrorResponse> {
        Ok(())
    }

    /// Drive the upgraded connection until it ends.
    fn serve(self: Arc<Self>, socket: ServerSocket, request: RouteRequest) -> BoxFuture<'static, ()>;
}

/// Ordered chain of routes over one listener.
pub struct UpgradeRouter {
    routes: Vec<Arc<dyn UpgradeRoute>>,
    handshake_timeout: Duration,
    stats: Arc<ServerStats>,
}

impl UpgradeRouter {
    pub fn new(handshake_timeout: Duration, stats: Arc<ServerStats>) -> Self {
        Self {
            routes: Vec::new(),
            handshake_timeout,
            stats,
        }
    }

    /// Append a route; earlier routes win when several claim a path.
    pub fn with_route(mut self, route: Arc<dyn UpgradeRoute>) -> Self {
        self.routes.push(route);
        self
    }

    pub fn route_names(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.name()).collect()
    }

    /// Complete the handshake for `stream` and hand it to its route.
    pub async fn dispatch(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ProtocolError> {
        let mut selected: Option<(Arc<dyn UpgradeRoute>, RouteRequest)> = None;
        let routes = &self.routes;

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let path = request.uri().path();
            let Some(route) = routes.iter().find(|route| route.claims(path)) else {
                log::debug!("no route claims {path} (from {peer})");
                return Err(error_response(StatusCode::NOT_FOUND, "no handler for path"));
            };
            route.accept(request)?;
            selected = Some((Arc::clone(route), RouteRequest::from_request(request, peer)));
            Ok(response)
        };

        let handshake = tokio_tungstenite::accept_hdr_async(stream, callback);
        let socket = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.stats.handshake_rejected();
                return Err(e.into());
            }
            Err(_) => {
                self.stats.handshake_rejected();
                log::debug!("handshake from {peer} timed out");
                return Err(ProtocolError::HandshakeTimeout);
            }
        };

        let Some((route, request)) = selected.take() else {
            return Err(ProtocolError::ConnectionClosed);
        };

        log::debug!("{peer} upgraded on {} via {}", request.path, route.name());
        self.stats.connection_opened();
        route.serve(socket, request).await;
        self.stats.connection_closed();
        Ok(())
    }
}

/// Send a close frame, ignoring failures on an already broken transport.
pub async fn close_with<S>(sink: &mut S, code: u16, reason: &str)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

/// Route for document connections: `<prefix><document-id>`.
pub struct DocumentRoute<D: CrdtDocument = crate::merge::YrsDocument> {
    prefix: String,
    registry: Arc<SessionRegistry<D>>,
    policy: Arc<dyn AccessPolicy>,
    stats: Arc<ServerStats>,
}

impl<D: CrdtDocument> DocumentRoute<D> {
    pub fn new(
        prefix: impl Into<String>,
        registry: Arc<SessionRegistry<D>>,
        policy: Arc<dyn AccessPolicy>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            registry,
            policy,
            stats,
        }
    }

    async fn run(self: Arc<Self>, mut socket: ServerSocket, request: RouteRequest) {
        let token = match_document_path(&self.prefix, &request.path).unwrap_or_default();
        let id = match DocumentId::parse(token) {
            Ok(id) => id,
            Err(e) => {
                log::warn!("rejecting {} from {}: {e}", request.path, request.peer);
                close_with(&mut socket, CLOSE_POLICY_VIOLATION, "invalid document id").await;
                return;
            }
        };

        let client = Uuid::new_v4();
        let (session, attachment) = match self.registry.join(&id, client).await {
            Ok(joined) => joined,
            Err(e) => {
                log::error!("could not open session {id} for {}: {e}", request.peer);
                close_with(&mut socket, CLOSE_INTERNAL_ERROR, "session unavailable").await;
                return;
            }
        };

        if let Err(e) = self.drive(&session, client, socket, attachment).await {
            log::debug!("client {client} on {id} dropped: {e}");
        }
        self.registry.leave(&session, client).await;
    }

    async fn drive(
        &self,
        session: &Arc<DocumentSession<D>>,
        client: ClientId,
        socket: ServerSocket,
        attachment: Attachment,
    ) -> Result<(), ProtocolError> {
        let (mut sink, mut stream) = socket.split();
        let Attachment {
            initial_state,
            mut subscription,
        } = attachment;

        sink.send(Message::Binary(initial_state.into())).await?;

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        self.stats.frame_received(bytes.len());
                        if session.apply_remote_delta(client, bytes).await.is_err() {
                            self.stats.frame_rejected();
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        log::debug!("client {client} sent a text frame, ignored");
                        self.stats.frame_rejected();
                    }
                    // tungstenite answers pings on its own.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                },
                event = subscription.recv() => match event {
                    RelayEvent::Deliver(payload) => {
                        sink.send(Message::Binary(payload.to_vec().into())).await?;
                    }
                    RelayEvent::Reset => {
                        close_with(&mut sink, CLOSE_DOCUMENT_RESET, "document restored").await;
                        return Ok(());
                    }
                    RelayEvent::Lagged(missed) => {
                        log::warn!("evicting client {client} from {}: {missed} frames behind", session.id());
                        self.stats.peer_evicted();
                        close_with(&mut sink, CLOSE_TRY_AGAIN_LATER, "too slow").await;
                        return Ok(());
                    }
                    RelayEvent::Closed => return Ok(()),
                },
            }
        }
    }
}

impl<D: CrdtDocument> UpgradeRoute for DocumentRoute<D> {
    fn name(&self) -> &str {
        "documents"
    }

    fn claims(&self, path: &str) -> bool {
        match_document_path(&self.prefix, path).is_some()
    }

    fn accept(&self, request: &Request) -> Result<(), ErrorResponse> {
        let token = match_document_path(&self.prefix, request.uri().path()).unwrap_or_default();
        // Malformed ids are upgraded and then closed with a policy violation.
        let Ok(id) = DocumentId::parse(token) else {
            return Ok(());
        };
        let credentials = request_credentials(request);
        self.policy
            .authorize(&id, credentials.as_deref())
            .map_err(|denied| {
                log::warn!("denied access to {id}: {denied}");
                error_response(StatusCode::FORBIDDEN, &denied.to_string())
            })
    }

    fn serve(self: Arc<Self>, socket: ServerSocket, request: RouteRequest) -> BoxFuture<'static, ()> {
        Box::pin(self.run(socket, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AllowAll, TokenPolicy};
    use crate::persistence::PersistenceManager;
    use crate::session::SessionConfig;
    use crate::storage::MemoryStore;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    fn document_route(policy: Arc<dyn AccessPolicy>) -> DocumentRoute {
        let pm = Arc::new(PersistenceManager::new(Arc::new(MemoryStore::new())));
        let registry = Arc::new(SessionRegistry::new(pm, SessionConfig::default()));
        DocumentRoute::new("/doc/", registry, policy, Arc::new(ServerStats::default()))
    }

    #[test]
    fn test_document_route_claims() {
        let route = document_route(Arc::new(AllowAll));
        assert!(route.claims("/doc/550e8400-e29b-41d4-a716-446655440000"));
        assert!(route.claims("/doc/doc-1"));
        // Claimed so the client gets a policy-violation close, not a 404.
        assert!(route.claims("/doc/"));
        assert!(!route.claims("/doc/a/b"));
        assert!(!route.claims("/chat/room-1"));
        assert!(!route.claims("/"));
    }

    #[test]
    fn test_routes_keep_registration_order() {
        let router = UpgradeRouter::new(Duration::from_secs(1), Arc::new(ServerStats::default()))
            .with_route(Arc::new(document_route(Arc::new(AllowAll))));
        assert_eq!(router.route_names(), vec!["documents"]);
    }

    #[test]
    fn test_credentials_from_header_or_query() {
        let with_header = Request::builder()
            .uri("/doc/doc-1?token=query-token")
            .header("Authorization", "Bearer header-token")
            .body(())
            .unwrap();
        assert_eq!(request_credentials(&with_header).as_deref(), Some("header-token"));

        let with_query = request("/doc/doc-1?token=query-token");
        assert_eq!(request_credentials(&with_query).as_deref(), Some("query-token"));

        assert_eq!(request_credentials(&request("/doc/doc-1")), None);
    }

    #[test]
    fn test_accept_consults_policy() {
        let policy = Arc::new(TokenPolicy::new());
        policy.grant("secret", DocumentId::parse("doc-1").unwrap());
        let route = document_route(policy);

        assert!(route.accept(&request("/doc/doc-1?token=secret")).is_ok());

        let denied = route.accept(&request("/doc/doc-1")).unwrap_err();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let wrong_doc = route.accept(&request("/doc/doc-2?token=secret")).unwrap_err();
        assert_eq!(wrong_doc.status(), StatusCode::FORBIDDEN);

        // Malformed ids pass the handshake and are closed afterwards.
        assert!(route.accept(&request("/doc/bad.id")).is_ok());
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::NOT_FOUND, "nope");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_deref(), Some("nope"));
    }
}
