//! Server-to-server federation routes.
//!
//! These endpoints are called by *remote Hearth servers*. Everything under
//! `/_hearth/federation/v1` except `version` requires a valid
//! `Authorization: HearthFederation ...` header (see [`federation_auth`]).
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET    | `/_hearth/key/v2/server` | This server's self-signed key document |
//! | GET    | `/.well-known/hearth/server` | Delegation target |
//! | GET    | `/_hearth/federation/v1/version` | Server name and version, also the liveness probe |
//! | PUT    | `/_hearth/federation/v1/send/{txnId}` | Receive a transaction |
//! | GET    | `/_hearth/federation/v1/event/{eventId}` | A single event |
//! | GET    | `/_hearth/federation/v1/state/{roomId}` | Room state, optionally after `event_id` |
//! | POST   | `/_hearth/federation/v1/get_missing_events/{roomId}` | Walk the DAG backwards for backfill |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    middleware,
    routing::{get, post, put},
};
use hearth_common::{
    Event,
    error::{HearthError, HearthResult},
};
use hearth_federation::{
    Transaction, TransactionResponse,
    types::{MissingEventsRequest, MissingEventsResponse, ServerKeyDocument, StateResponse, VersionResponse, WellKnownServer},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    AppState,
    middleware::{FederationOrigin, federation_auth},
};

/// Most events returned by one `get_missing_events` call.
const MAX_MISSING_EVENTS: usize = 100;

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let authenticated = Router::new()
        .route("/_hearth/federation/v1/send/{txn_id}", put(receive_transaction))
        .route("/_hearth/federation/v1/event/{event_id}", get(get_event))
        .route("/_hearth/federation/v1/state/{room_id}", get(get_room_state))
        .route("/_hearth/federation/v1/get_missing_events/{room_id}", post(get_missing_events))
        .route_layer(middleware::from_fn_with_state(state, federation_auth));

    Router::new()
        .route("/_hearth/key/v2/server", get(server_key_document))
        .route("/.well-known/hearth/server", get(well_known_server))
        .route("/_hearth/federation/v1/version", get(version))
        .merge(authenticated)
}

// ─── Unauthenticated ─────────────────────────────────────────────────────────

async fn server_key_document(State(state): State<Arc<AppState>>) -> HearthResult<Json<ServerKeyDocument>> {
    Ok(Json(state.keys.to_key_document(&state.server_name)?))
}

async fn well_known_server(State(state): State<Arc<AppState>>) -> Json<WellKnownServer> {
    Json(WellKnownServer { server: state.delegated_server.clone() })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse::current())
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// `PUT /_hearth/federation/v1/send/{txnId}`
///
/// The per-PDU outcome is in the body; the request itself only fails when the
/// transaction is refused whole (wrong origin, over the PDU limit).
async fn receive_transaction(
    State(state): State<Arc<AppState>>,
    Extension(FederationOrigin(origin)): Extension<FederationOrigin>,
    Path(txn_id): Path<String>,
    Json(txn): Json<Transaction>,
) -> HearthResult<Json<TransactionResponse>> {
    if txn.origin != origin {
        warn!(signed_by = %origin, claimed = %txn.origin, txn_id = %txn_id, "Transaction origin does not match signer");
        return Err(HearthError::Forbidden);
    }
    debug!(origin = %origin, txn_id = %txn_id, pdus = txn.pdus.len(), "Received federation transaction");
    Ok(Json(state.ingress.receive_transaction(&txn_id, txn).await?))
}

// ─── Reads ───────────────────────────────────────────────────────────────────

/// `GET /_hearth/federation/v1/event/{eventId}`
async fn get_event(
    State(state): State<Arc<AppState>>,
    Extension(FederationOrigin(origin)): Extension<FederationOrigin>,
    Path(event_id): Path<String>,
) -> HearthResult<Json<Value>> {
    let event = state.dag.event(&event_id).await?;
    debug!(origin = %origin, event_id = %event_id, "Serving event");
    Ok(Json(to_pdu(&event)?))
}

#[derive(Debug, Deserialize)]
struct StateQuery {
    event_id: Option<String>,
}

/// `GET /_hearth/federation/v1/state/{roomId}?event_id=`
///
/// Without `event_id` this is the room's current resolved state.
async fn get_room_state(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<StateQuery>,
) -> HearthResult<Json<StateResponse>> {
    let ids = match &query.event_id {
        Some(event_id) => {
            let event = state.dag.event(event_id).await?;
            if event.room_id != room_id {
                return Err(HearthError::NotFound { resource: format!("event {event_id} in {room_id}") });
            }
            state.dag.state_at(event_id).await?
        }
        None => state.dag.current_state(&room_id).await?,
    };

    let mut pdus = Vec::with_capacity(ids.len());
    for event_id in ids.values() {
        let event = state.dag.event(event_id).await?;
        pdus.push(to_pdu(&event)?);
    }
    Ok(Json(StateResponse { pdus }))
}

/// `POST /_hearth/federation/v1/get_missing_events/{roomId}`
async fn get_missing_events(
    State(state): State<Arc<AppState>>,
    Extension(FederationOrigin(origin)): Extension<FederationOrigin>,
    Path(room_id): Path<String>,
    Json(request): Json<MissingEventsRequest>,
) -> HearthResult<Json<MissingEventsResponse>> {
    // Unknown rooms are a 404, not an empty answer.
    state.dag.room_version(&room_id).await?;

    let limit = request.limit.clamp(1, MAX_MISSING_EVENTS);
    let found = state
        .dag
        .missing_events(&room_id, &request.earliest_events, &request.latest_events, limit)
        .await?;
    debug!(origin = %origin, room_id = %room_id, count = found.len(), "Serving missing events");

    let events = found.iter().map(|ev| to_pdu(ev)).collect::<HearthResult<_>>()?;
    Ok(Json(MissingEventsResponse { events }))
}

fn to_pdu(event: &Event) -> HearthResult<Value> {
    serde_json::to_value(event).map_err(|e| HearthError::Internal(e.into()))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use hearth_common::ids;
    use hearth_db::Stores;
    use hearth_federation::{
        FederationIngress, IngressConfig, KeyRing, ServerKeyPair, ServerSigner, keys::verify_key_document,
        signatures::sign_request,
    };
    use hearth_rooms::{DagConfig, EventTemplate, RoomDag};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::build_router;

    const BOB: &str = "@bob:b.test";

    struct Harness {
        app: Router,
        dag: Arc<RoomDag>,
        remote: RoomDag,
        remote_keys: Arc<ServerKeyPair>,
    }

    fn harness() -> Harness {
        let own = Arc::new(ServerKeyPair::generate());
        let remote_keys = Arc::new(ServerKeyPair::generate());
        let ring = KeyRing::new("a.test", own.clone());
        ring.pin("b.test", &remote_keys.key_id, remote_keys.public_key_base64());

        let dag = Arc::new(RoomDag::new(Stores::memory(), DagConfig { server_name: "a.test".into(), ..DagConfig::default() }));
        let ingress = Arc::new(FederationIngress::new(
            dag.clone(),
            Arc::new(ring),
            IngressConfig { server_name: "a.test".into(), ..IngressConfig::default() },
        ));
        let state = AppState::new("a.test", dag.clone(), ingress, own).with_delegation("a.test:8448");

        let remote = RoomDag::new(Stores::memory(), DagConfig { server_name: "b.test".into(), ..DagConfig::default() })
            .with_signer(Arc::new(ServerSigner::new("b.test", remote_keys.clone())));

        Harness { app: build_router(state), dag, remote, remote_keys }
    }

    /// A room created on the remote server, as PDUs oldest first.
    async fn remote_room(h: &Harness) -> (String, Vec<Value>) {
        let room_id = ids::new_room_id("b.test");
        let templates = [
            ("m.room.create", Some(""), json!({ "creator": BOB, "room_version": "2" })),
            ("m.room.member", Some(BOB), json!({ "membership": "join" })),
            ("m.room.message", None, json!({ "body": "hi" })),
        ];
        let mut pdus = Vec::new();
        for (event_type, state_key, content) in templates {
            let id = h
                .remote
                .submit_local(EventTemplate {
                    room_id: room_id.clone(),
                    sender: BOB.into(),
                    event_type: event_type.into(),
                    state_key: state_key.map(str::to_owned),
                    content,
                })
                .await
                .unwrap();
            pdus.push(serde_json::to_value(h.remote.event(&id).await.unwrap().as_ref()).unwrap());
        }
        (room_id, pdus)
    }

    fn signed(keys: &ServerKeyPair, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let auth = sign_request(keys, "b.test", "a.test", method, uri, body.as_ref());
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, auth.to_header());
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(h: &Harness, txn_id: &str, pdus: Vec<Value>) -> Response {
        let body = serde_json::to_value(Transaction::new("b.test", pdus)).unwrap();
        call(&h.app, signed(&h.remote_keys, "PUT", &format!("/_hearth/federation/v1/send/{txn_id}"), Some(body))).await
    }

    #[tokio::test]
    async fn discovery_endpoints_need_no_signature() {
        let h = harness();

        let response = call(&h.app, Request::get("/_hearth/key/v2/server").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let doc: ServerKeyDocument = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(doc.server_name, "a.test");
        verify_key_document(&doc).unwrap();

        let response = call(&h.app, Request::get("/.well-known/hearth/server").body(Body::empty()).unwrap()).await;
        assert_eq!(json_body(response).await, json!({ "h.server": "a.test:8448" }));

        let response = call(&h.app, Request::get("/_hearth/federation/v1/version").body(Body::empty()).unwrap()).await;
        assert_eq!(json_body(response).await["server"]["name"], "Hearth");

        let response = call(&h.app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn unsigned_transactions_are_refused() {
        let h = harness();
        let body = serde_json::to_value(Transaction::new("b.test", vec![])).unwrap();
        let request = Request::put("/_hearth/federation/v1/send/t1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = call(&h.app, request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["errcode"], "H_BAD_SIGNATURE");
    }

    #[tokio::test]
    async fn signed_transaction_lands_in_the_dag() {
        let h = harness();
        let (room_id, pdus) = remote_room(&h).await;

        let response = send(&h, "t1", pdus.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: TransactionResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(body.pdus.len(), 3);
        assert_eq!(body.failures().count(), 0);

        let last = pdus[2]["event_id"].as_str().unwrap();
        assert_eq!(h.dag.forward_extremities(&room_id).await.unwrap().into_iter().collect::<Vec<_>>(), vec![last]);
    }

    #[tokio::test]
    async fn transaction_origin_must_match_signer() {
        let h = harness();
        let body = serde_json::to_value(Transaction::new("c.test", vec![])).unwrap();
        let response = call(&h.app, signed(&h.remote_keys, "PUT", "/_hearth/federation/v1/send/t1", Some(body))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn oversized_transaction_is_refused_whole() {
        let h = harness();
        let pdus = vec![json!({}); IngressConfig::default().max_pdus_per_transaction + 1];
        let response = send(&h, "big", pdus).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await["errcode"], "H_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn events_state_and_history_are_served_to_signed_peers() {
        let h = harness();
        let (room_id, pdus) = remote_room(&h).await;
        send(&h, "t1", pdus.clone()).await;
        let join_id = pdus[1]["event_id"].as_str().unwrap().to_owned();
        let message_id = pdus[2]["event_id"].as_str().unwrap().to_owned();

        let uri = format!("/_hearth/federation/v1/event/{message_id}");
        let response = call(&h.app, signed(&h.remote_keys, "GET", &uri, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, pdus[2]);

        let uri = format!("/_hearth/federation/v1/state/{room_id}?event_id={join_id}");
        let response = call(&h.app, signed(&h.remote_keys, "GET", &uri, None)).await;
        let state: StateResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(state.pdus.len(), 2);

        let uri = format!("/_hearth/federation/v1/get_missing_events/{room_id}");
        let request = json!({ "earliest_events": [], "latest_events": [message_id], "limit": 2 });
        let response = call(&h.app, signed(&h.remote_keys, "POST", &uri, Some(request))).await;
        let missing: MissingEventsResponse = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(missing.events, pdus[1..].to_vec());

        let uri = "/_hearth/federation/v1/event/$nope";
        let response = call(&h.app, signed(&h.remote_keys, "GET", uri, None)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reads_also_require_a_signature() {
        let h = harness();
        let response =
            call(&h.app, Request::get("/_hearth/federation/v1/event/$x").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
