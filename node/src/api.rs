//! # HTTP Surface
//!
//! Builds the axum router that exposes the node to peers, trackers and
//! viewers. All endpoints share application state through axum's `State`
//! extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                     | Description                              |
//! |--------|--------------------------|------------------------------------------|
//! | GET    | `/health`                | Liveness check                           |
//! | GET    | `/status`                | Node status summary                      |
//! | GET    | `/catalog`               | Summaries of hosted links                |
//! | GET    | `/peers`                 | Signed claims of known peers             |
//! | POST   | `/gossip`                | Ingest a peer's gossip payload           |
//! | POST   | `/announce`              | Tracker announcement from a node         |
//! | POST   | `/votes`                 | Signed up/down vote on a catalog entry   |
//! | GET    | `/manifest/:id`          | Manifest by link id or media id          |
//! | GET    | `/content/:id`           | Encrypted blob, `Range` aware            |
//! | GET    | `/assets/:name`          | Poster and backdrop images               |
//! | POST   | `/stream/:id/authorize`  | Ask to watch a link                      |
//! | POST   | `/stream/:id/proof`      | Submit a signed proof-of-view            |
//! | GET    | `/stream/:id?token=`     | Decrypted delivery under a session       |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use driftcast_protocol::catalog::{CatalogError, CatalogStore, RegisteredLink, VoteOutcome};
use driftcast_protocol::config::{CIPHER_CHUNK_SIZE, PROTOCOL_VERSION};
use driftcast_protocol::crypto::cipher;
use driftcast_protocol::crypto::keys::RecoverableSignature;
use driftcast_protocol::identity::NodeIdentity;
use driftcast_protocol::network::{Announcement, GossipPayload, PeerDirectory};
use driftcast_protocol::streaming::{
    AdmissionDecision, AdmissionError, AuthorizeRequest, ClaimError, DenyReason, ProofSubmission,
    StreamAdmission,
};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone: everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    pub identity: Arc<NodeIdentity>,
    pub directory: Arc<PeerDirectory>,
    pub catalog: Arc<CatalogStore>,
    pub admission: Arc<StreamAdmission>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([header::CONTENT_RANGE, header::ACCEPT_RANGES]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/catalog", get(catalog_handler))
        .route("/peers", get(peers_handler))
        .route("/gossip", post(gossip_handler))
        .route("/announce", post(announce_handler))
        .route("/votes", post(vote_handler))
        .route("/manifest/:id", get(manifest_handler))
        .route("/content/:id", get(content_handler))
        .route("/assets/:name", get(asset_handler))
        .route("/stream/:id/authorize", post(authorize_handler))
        .route("/stream/:id/proof", post(proof_handler))
        .route("/stream/:id", get(stream_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Wire Types
// ---------------------------------------------------------------------------

/// Error body for every non-2xx response that is not an admission decision.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub name: String,
    pub endpoint: String,
    pub region: String,
    pub address: String,
    pub version: String,
    pub protocol: String,
    pub known_peers: usize,
    pub trusted_peers: usize,
    pub hosted_links: usize,
    pub replicas: usize,
    pub catalog_entries: usize,
    pub active_streams: u32,
    pub syncing: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthorizeBody {
    pub wallet: Option<String>,
    /// Owner proof over `VIEW:<link>:owner:<clientKey>`.
    pub signature: Option<RecoverableSignature>,
}

#[derive(Debug, Deserialize)]
pub struct ProofBody {
    pub campaign_id: String,
    pub wallet: Option<String>,
    pub signature: RecoverableSignature,
}

#[derive(Debug, Deserialize)]
pub struct VoteBody {
    pub media_id: String,
    pub uploader: String,
    pub upvote: bool,
    pub signature: RecoverableSignature,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The viewer's address: first `X-Forwarded-For` hop when a proxy sets
/// one, else the socket peer.
fn client_ip(headers: &HeaderMap, connect: Option<ConnectInfo<SocketAddr>>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match (forwarded, connect) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(ConnectInfo(addr))) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Links are addressed by link id, or by media id when a replicator
/// follows a campaign's content id.
fn resolve_link(state: &AppState, id: &str) -> Option<RegisteredLink> {
    let links = state.catalog.links();
    links.get(id).or_else(|| links.find_by_media(id))
}

/// A single satisfiable byte range, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parses a `Range` header against a body of `len` bytes. Malformed or
/// multi-range headers fall back to the full body.
fn parse_range(header: Option<&str>, len: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    let (start, end) = if first.is_empty() {
        // Suffix form: the last N bytes.
        let Ok(n) = last.parse::<u64>() else {
            return ByteRange::Full;
        };
        if n == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        (len.saturating_sub(n), len - 1)
    } else {
        let Ok(start) = first.parse::<u64>() else {
            return ByteRange::Full;
        };
        let end = if last.is_empty() {
            len.saturating_sub(1)
        } else {
            match last.parse::<u64>() {
                Ok(e) if e >= start => e.min(len.saturating_sub(1)),
                _ => return ByteRange::Full,
            }
        };
        (start, end)
    };

    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial { start, end }
}

fn decision_status(decision: &AdmissionDecision) -> StatusCode {
    match decision {
        AdmissionDecision::Granted { .. } => StatusCode::OK,
        AdmissionDecision::RequireProof { .. } => StatusCode::PAYMENT_REQUIRED,
        AdmissionDecision::Denied { reason } => match reason {
            DenyReason::NotFound => StatusCode::NOT_FOUND,
            DenyReason::AtCapacity => StatusCode::TOO_MANY_REQUESTS,
            DenyReason::Overloaded | DenyReason::NoAdAvailable => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

fn admission_response(result: Result<AdmissionDecision, AdmissionError>) -> Response {
    match result {
        Ok(decision) => (decision_status(&decision), Json(decision)).into_response(),
        Err(e) => {
            let status = match &e {
                AdmissionError::Registry(_) => StatusCode::BAD_GATEWAY,
                AdmissionError::BadProof => StatusCode::UNAUTHORIZED,
                AdmissionError::NotPremium(_) => StatusCode::FORBIDDEN,
                AdmissionError::CampaignUnavailable(_) => StatusCode::GONE,
            };
            error(status, e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Node Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let links = state.catalog.links();
    Json(StatusResponse {
        name: state.identity.name().to_string(),
        endpoint: state.identity.endpoint().to_string(),
        region: state.identity.region().to_string(),
        address: state.identity.address(),
        version: state.version.clone(),
        protocol: PROTOCOL_VERSION.to_string(),
        known_peers: state.directory.len(),
        trusted_peers: state.directory.trusted_count(),
        hosted_links: links.len(),
        replicas: links.replicas().len(),
        catalog_entries: state.catalog.db().entry_count(),
        active_streams: links.total_active_streams(),
        syncing: state.catalog.is_syncing(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /catalog`
async fn catalog_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.catalog.links().summaries())
}

/// `GET /peers`: only signed records, since unsigned ones would be
/// dropped by every receiver anyway.
async fn peers_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(GossipPayload {
        peers: state.directory.signed_entries(),
    })
}

/// `POST /gossip`
async fn gossip_handler(
    State(state): State<AppState>,
    Json(payload): Json<GossipPayload>,
) -> impl IntoResponse {
    let offered = payload.peers.len();
    let accepted = state.directory.ingest(payload.peers).await;
    debug!(offered, accepted, "gossip received");
    Json(AcceptedResponse { accepted })
}

/// `POST /announce`: this node acting as a tracker. The announcing node
/// is admitted through the same verification as gossip; its content is
/// picked up by the next catalog reconciliation.
async fn announce_handler(
    State(state): State<AppState>,
    Json(announcement): Json<Announcement>,
) -> impl IntoResponse {
    let accepted = state.directory.ingest(vec![announcement.as_entry()]).await;
    debug!(
        node = %announcement.node_id,
        items = announcement.content.len(),
        streams = announcement.stats.active_streams,
        accepted,
        "announcement received"
    );
    Json(AcceptedResponse { accepted })
}

/// `POST /votes`
async fn vote_handler(State(state): State<AppState>, Json(vote): Json<VoteBody>) -> Response {
    match state
        .catalog
        .record_vote(&vote.media_id, &vote.uploader, vote.upvote, &vote.signature)
    {
        Ok(VoteOutcome::Applied(entry)) => (StatusCode::OK, Json(entry)).into_response(),
        Ok(VoteOutcome::Duplicate) => error(StatusCode::CONFLICT, "vote already counted"),
        Ok(VoteOutcome::UnknownEntry) => error(StatusCode::NOT_FOUND, "catalog entry not found"),
        Err(CatalogError::BadVote) => error(StatusCode::UNAUTHORIZED, "vote signature does not verify"),
        Err(e) => {
            warn!(error = %e, "vote not recorded");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Content Handlers
// ---------------------------------------------------------------------------

/// `GET /manifest/:id`
async fn manifest_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match resolve_link(&state, &id) {
        Some(link) => Json(link.manifest).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no manifest for {}", id)),
    }
}

/// `GET /content/:id`: the stored ciphertext, byte for byte. This is what
/// replicators download and what range-seeking players read.
async fn content_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(link) = resolve_link(&state, &id) else {
        return error(StatusCode::NOT_FOUND, format!("no content for {}", id));
    };
    let mut file = match tokio::fs::File::open(&link.file_path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(link = %link.id, error = %e, "content blob unreadable");
            return error(StatusCode::NOT_FOUND, format!("no content for {}", id));
        }
    };
    let len = match file.metadata().await {
        Ok(m) => m.len(),
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let range = parse_range(
        headers.get(header::RANGE).and_then(|v| v.to_str().ok()),
        len,
    );
    let mut response = match range {
        ByteRange::Full => {
            let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            response
        }
        ByteRange::Partial { start, end } => {
            if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
                return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
            let count = end - start + 1;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(file.take(count))));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(count));
            if let Ok(v) = HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, len)) {
                headers.insert(header::CONTENT_RANGE, v);
            }
            response
        }
        ByteRange::Unsatisfiable => {
            let mut response = error(StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable");
            if let Ok(v) = HeaderValue::from_str(&format!("bytes */{}", len)) {
                response.headers_mut().insert(header::CONTENT_RANGE, v);
            }
            return response;
        }
    };
    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

/// `GET /assets/:name`
async fn asset_handler(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    let Some(path) = state.catalog.asset_path(&name) else {
        return error(StatusCode::NOT_FOUND, "no such asset");
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(_) => error(StatusCode::NOT_FOUND, "no such asset"),
    }
}

// ---------------------------------------------------------------------------
// Stream Handlers
// ---------------------------------------------------------------------------

/// `POST /stream/:id/authorize`
async fn authorize_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Option<Json<AuthorizeBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    let request = AuthorizeRequest {
        client_ip: client_ip(&headers, connect),
        wallet: body.wallet,
        signature: body.signature,
    };
    admission_response(state.admission.authorize(&id, &request).await)
}

/// `POST /stream/:id/proof`
async fn proof_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<ProofBody>,
) -> Response {
    let proof = ProofSubmission {
        client_ip: client_ip(&headers, connect),
        campaign_id: body.campaign_id,
        wallet: body.wallet,
        signature: body.signature,
    };
    admission_response(state.admission.accept_proof(&id, &proof).await)
}

/// `GET /stream/:id?token=`: decrypts the whole item under a live
/// session. The session ends when the body finishes or the viewer goes
/// away, whichever comes first.
async fn stream_handler(
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return error(StatusCode::UNAUTHORIZED, "missing session token");
    };
    let Some(link) = state.catalog.links().get(&id) else {
        return error(StatusCode::NOT_FOUND, format!("no link {}", id));
    };
    let Some(key) = link.key.clone() else {
        return error(StatusCode::CONFLICT, "replica is served encrypted only");
    };
    let (session, guard) = match state.admission.begin_stream(&token, &id) {
        Ok(claimed) => claimed,
        Err(ClaimError::Invalid) => return error(StatusCode::UNAUTHORIZED, "session expired or unknown"),
        Err(ClaimError::InUse) => return error(StatusCode::CONFLICT, "session is already streaming"),
    };
    let file = match tokio::fs::File::open(&link.file_path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(link = %id, error = %e, "content blob unreadable");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "content unavailable");
        }
    };

    let (reader, mut writer) = tokio::io::duplex(CIPHER_CHUNK_SIZE);
    tokio::spawn(async move {
        let result = cipher::decrypt_stream(&key, file, &mut writer).await;
        // The slot is released before the viewer sees end-of-body.
        drop(guard);
        drop(writer);
        match result {
            Ok(bytes) => debug!(link = %session.link_id, client = %session.client_key, bytes, "stream delivered"),
            Err(e) => warn!(link = %session.link_id, client = %session.client_key, error = %e, "stream aborted"),
        }
    });

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(link.manifest.size));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    use driftcast_protocol::catalog::{CatalogDb, IngestRequest, LinkRegistry, MediaType};
    use driftcast_protocol::config::{AdmissionConfig, SyncConfig};
    use driftcast_protocol::crypto::keys::NodeKeypair;
    use driftcast_protocol::crypto::signatures::{sign_node_claim, view_proof_message, vote_message};
    use driftcast_protocol::network::{MemoryPeerClient, PeerEntry};
    use driftcast_protocol::registry::{Campaign, InMemoryRegistry, Registry};
    use driftcast_protocol::streaming::{client_key, FixedLoad};

    const VIEWER_IP: &str = "203.0.113.9";
    const BODY: &[u8] = b"the quick brown fox jumps over the lazy dog";

    struct Fixture {
        router: Router,
        state: AppState,
        registry: Arc<InMemoryRegistry>,
        uploader: NodeKeypair,
        link_id: String,
        tmp: tempfile::TempDir,
    }

    /// A node named `alpha` hosting one ingested item with media id `m1`.
    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let identity = Arc::new(
            NodeIdentity::new(
                NodeKeypair::from_seed(&[1u8; 32]),
                "alpha",
                "http://127.0.0.1:7440",
                "global",
            )
            .with_local_addrs(Vec::new()),
        );
        let registry = Arc::new(InMemoryRegistry::new());
        let directory = Arc::new(PeerDirectory::new(identity.clone(), registry.clone(), 4));
        let links = Arc::new(LinkRegistry::new(tmp.path().join("content")));
        let catalog = Arc::new(CatalogStore::new(
            CatalogDb::open_temporary().unwrap(),
            links.clone(),
            directory.clone(),
            Arc::new(MemoryPeerClient::new()),
            tmp.path().join("assets"),
            SyncConfig::default(),
            Duration::from_secs(1),
        ));
        let admission = Arc::new(StreamAdmission::new(
            links,
            registry.clone(),
            Arc::new(FixedLoad::idle()),
            AdmissionConfig::default(),
            None,
        ));

        let uploader = NodeKeypair::from_seed(&[2u8; 32]);
        let source = tmp.path().join("feature.bin");
        std::fs::write(&source, BODY).unwrap();
        let link = catalog
            .ingest(
                &source,
                IngestRequest {
                    media_id: Some("m1".into()),
                    media_type: MediaType::Movie,
                    ..IngestRequest::new("Feature", &uploader.address())
                },
            )
            .await
            .unwrap();

        let state = AppState {
            version: "0.1.0-test".into(),
            identity,
            directory,
            catalog,
            admission,
        };
        Fixture {
            router: create_router(state.clone()),
            state,
            registry,
            uploader,
            link_id: link.id,
            tmp,
        }
    }

    fn campaign(id: &str, views: u64) -> Campaign {
        Campaign {
            id: id.into(),
            content_id: format!("ad-{}", id),
            source: "origin".into(),
            title: "Spot".into(),
            active: true,
            views_remaining: views,
            region: "global".into(),
            block: 1,
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, headers, body)
    }

    /// Sends a GET request and returns the (status, body_bytes).
    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let (status, _, body) = send(router, req).await;
        (status, body)
    }

    /// Sends a POST request with JSON body from the test viewer's address.
    async fn post_json(router: &Router, path: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header("x-forwarded-for", VIEWER_IP)
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let (status, _, body) = send(router, req).await;
        (status, body)
    }

    fn json(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    // -- Range parsing -------------------------------------------------------

    #[test]
    fn range_forms() {
        assert_eq!(parse_range(None, 100), ByteRange::Full);
        assert_eq!(
            parse_range(Some("bytes=0-9"), 100),
            ByteRange::Partial { start: 0, end: 9 }
        );
        assert_eq!(
            parse_range(Some("bytes=90-"), 100),
            ByteRange::Partial { start: 90, end: 99 }
        );
        assert_eq!(
            parse_range(Some("bytes=-10"), 100),
            ByteRange::Partial { start: 90, end: 99 }
        );
        assert_eq!(
            parse_range(Some("bytes=50-500"), 100),
            ByteRange::Partial { start: 50, end: 99 }
        );
        assert_eq!(parse_range(Some("bytes=100-"), 100), ByteRange::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-1,5-6"), 100), ByteRange::Full);
        assert_eq!(parse_range(Some("items=0-1"), 100), ByteRange::Full);
        assert_eq!(parse_range(Some("bytes=9-3"), 100), ByteRange::Full);
    }

    #[test]
    fn forwarded_for_wins_over_socket() {
        let mut headers = HeaderMap::new();
        let socket = Some(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 5000))));
        assert_eq!(client_ip(&headers, socket), "10.0.0.1");
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.4, 10.0.0.1"));
        assert_eq!(client_ip(&headers, socket), "198.51.100.4");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }

    // -- Node endpoints ------------------------------------------------------

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let f = fixture().await;
        let (status, body) = get(&f.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_identity_and_counts() {
        let f = fixture().await;
        let (status, body) = get(&f.router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.name, "alpha");
        assert_eq!(resp.hosted_links, 1);
        assert_eq!(resp.replicas, 0);
        assert_eq!(resp.catalog_entries, 1);
        assert_eq!(resp.address, f.state.identity.address());
    }

    #[tokio::test]
    async fn catalog_lists_hosted_content() {
        let f = fixture().await;
        let (status, body) = get(&f.router, "/catalog").await;
        assert_eq!(status, StatusCode::OK);
        let items = json(&body);
        assert_eq!(items.as_array().unwrap().len(), 1);
        assert_eq!(items[0]["id"], f.link_id.as_str());
    }

    #[tokio::test]
    async fn gossip_admits_only_verified_entries() {
        let f = fixture().await;
        let peer = NodeKeypair::generate();
        let good = PeerEntry {
            name: "beta".into(),
            endpoint: "http://10.0.0.2:7440".into(),
            signature: Some(sign_node_claim(&peer, "beta", "http://10.0.0.2:7440")),
            wallet_address: Some(peer.address()),
        };
        let forged = PeerEntry {
            name: "gamma".into(),
            ..good.clone()
        };
        let payload = serde_json::to_value(GossipPayload {
            peers: vec![good, forged],
        })
        .unwrap();

        let (status, body) = post_json(&f.router, "/gossip", payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["accepted"], 1);
        assert!(f.state.directory.contains("beta"));
        assert!(!f.state.directory.contains("gamma"));

        let (_, body) = get(&f.router, "/peers").await;
        let listed: GossipPayload = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed.peers.len(), 1);
        assert_eq!(listed.peers[0].name, "beta");
    }

    #[tokio::test]
    async fn votes_are_counted_once() {
        let f = fixture().await;
        let voter = NodeKeypair::generate();
        let uploader = f.uploader.address();
        let vote = serde_json::json!({
            "media_id": "m1",
            "uploader": uploader,
            "upvote": true,
            "signature": voter.sign(vote_message("m1", &uploader, true).as_bytes()).to_hex(),
        });

        let (status, body) = post_json(&f.router, "/votes", vote.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["upvotes"], 1);

        let (status, _) = post_json(&f.router, "/votes", vote).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    // -- Content endpoints ---------------------------------------------------

    #[tokio::test]
    async fn manifest_by_link_or_media_id() {
        let f = fixture().await;
        let (status, body) = get(&f.router, &format!("/manifest/{}", f.link_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["media_id"], "m1");

        let (status, body) = get(&f.router, "/manifest/m1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["id"], f.link_id.as_str());

        let (status, _) = get(&f.router, "/manifest/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn content_is_ciphertext_with_ranges() {
        let f = fixture().await;
        let total = cipher::ciphertext_len(BODY.len() as u64);

        let (status, body) = get(&f.router, &format!("/content/{}", f.link_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.len() as u64, total);
        assert_ne!(&body[..BODY.len().min(body.len())], BODY);

        let req = Request::builder()
            .uri(format!("/content/{}", f.link_id))
            .header("range", "bytes=0-9")
            .body(Body::empty())
            .unwrap();
        let (status, headers, part) = send(&f.router, req).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(part, body[..10].to_vec());
        assert_eq!(
            headers.get(header::CONTENT_RANGE).unwrap(),
            format!("bytes 0-9/{}", total).as_str()
        );

        let req = Request::builder()
            .uri(format!("/content/{}", f.link_id))
            .header("range", format!("bytes={}-", total))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&f.router, req).await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn assets_reject_path_components() {
        let f = fixture().await;
        let assets = f.tmp.path().join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("poster.jpg"), b"jpeg").unwrap();

        let (status, body) = get(&f.router, "/assets/poster.jpg").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"jpeg");

        let (status, _) = get(&f.router, "/assets/..%2Fcontent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- Stream endpoints ----------------------------------------------------

    #[tokio::test]
    async fn unknown_link_is_denied() {
        let f = fixture().await;
        let (status, body) = post_json(&f.router, "/stream/nope/authorize", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["status"], "denied");
        assert_eq!(json(&body)["reason"], "not_found");
    }

    #[tokio::test]
    async fn no_campaign_means_no_stream() {
        let f = fixture().await;
        let path = format!("/stream/{}/authorize", f.link_id);
        let (status, body) = post_json(&f.router, &path, serde_json::json!({})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(&body)["reason"], "no_ad_available");
    }

    #[tokio::test]
    async fn ad_view_unlocks_decrypted_stream() {
        let f = fixture().await;
        f.registry.put_campaign(campaign("c1", 2));
        let link = f.link_id.clone();

        let (status, body) =
            post_json(&f.router, &format!("/stream/{}/authorize", link), serde_json::json!({})).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let challenge = json(&body);
        assert_eq!(challenge["status"], "require_proof");
        assert_eq!(challenge["campaign_id"], "c1");
        let message = view_proof_message(&link, "c1", &client_key(VIEWER_IP, &link));
        assert_eq!(challenge["message"], message.as_str());

        let viewer = NodeKeypair::generate();
        let proof = serde_json::json!({
            "campaign_id": "c1",
            "wallet": viewer.address(),
            "signature": viewer.sign(message.as_bytes()).to_hex(),
        });
        let (status, body) = post_json(&f.router, &format!("/stream/{}/proof", link), proof).await;
        assert_eq!(status, StatusCode::OK);
        let token = json(&body)["token"].as_str().unwrap().to_string();
        assert_eq!(f.state.catalog.links().active_streams(&link), Some(1));
        assert_eq!(
            f.registry.campaign("c1").await.unwrap().unwrap().views_remaining,
            1
        );

        let (status, plain) = get(&f.router, &format!("/stream/{}?token={}", link, token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plain, BODY);

        // Delivery ended the session and freed the slot.
        assert_eq!(f.state.catalog.links().active_streams(&link), Some(0));
        let (status, _) = get(&f.router, &format!("/stream/{}?token={}", link, token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn forged_proof_is_unauthorized() {
        let f = fixture().await;
        f.registry.put_campaign(campaign("c1", 2));
        let link = f.link_id.clone();
        let viewer = NodeKeypair::generate();
        let other = NodeKeypair::generate();
        let message = view_proof_message(&link, "c1", &client_key(VIEWER_IP, &link));
        let proof = serde_json::json!({
            "campaign_id": "c1",
            "wallet": viewer.address(),
            "signature": other.sign(message.as_bytes()).to_hex(),
        });
        let (status, _) = post_json(&f.router, &format!("/stream/{}/proof", link), proof).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(f.state.catalog.links().active_streams(&link), Some(0));
    }

    #[tokio::test]
    async fn owner_streams_without_ad() {
        let f = fixture().await;
        let link = f.link_id.clone();
        let message = view_proof_message(&link, "owner", &client_key(VIEWER_IP, &link));
        let body = serde_json::json!({
            "wallet": f.uploader.address(),
            "signature": f.uploader.sign(message.as_bytes()).to_hex(),
        });
        let (status, body) = post_json(&f.router, &format!("/stream/{}/authorize", link), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "granted");
    }

    #[tokio::test]
    async fn token_streams_one_delivery_at_a_time() {
        let f = fixture().await;
        let link = f.link_id.clone();
        let message = view_proof_message(&link, "owner", &client_key(VIEWER_IP, &link));
        let body = serde_json::json!({
            "wallet": f.uploader.address(),
            "signature": f.uploader.sign(message.as_bytes()).to_hex(),
        });
        let (_, body) = post_json(&f.router, &format!("/stream/{}/authorize", link), body).await;
        let token = json(&body)["token"].as_str().unwrap().to_string();

        let (_, live) = f.state.admission.begin_stream(&token, &link).unwrap();
        let (status, _) = get(&f.router, &format!("/stream/{}?token={}", link, token)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(f.state.catalog.links().active_streams(&link), Some(1));

        drop(live);
        assert_eq!(f.state.catalog.links().active_streams(&link), Some(0));
    }

    #[tokio::test]
    async fn stream_requires_token() {
        let f = fixture().await;
        let (status, _) = get(&f.router, &format!("/stream/{}", f.link_id)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = get(&f.router, &format!("/stream/{}?token=bogus", f.link_id)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
