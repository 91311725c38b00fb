//! Federation Ingress: inbound transactions.
//!
//! Each PDU is checked on its own and gets its own result: parse, content
//! hash against the declared id, the origin server's signature, then the room
//! DAG. One bad PDU never fails the rest of its transaction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use hearth_common::{
    Event, HearthError,
    config::AppConfig,
    event::EventFormatError,
    ids,
};
use hearth_rooms::{Origin, Outcome, RoomDag};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    error::FederationError,
    keyring::{KeyLookup, verify_event},
    sender::FederationSender,
    signatures::{FedAuth, verify_request},
    types::{PduResult, Transaction, TransactionResponse, pdu_key},
};

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub server_name: String,
    pub max_pdus_per_transaction: usize,
    pub txn_cache_size: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".into(),
            max_pdus_per_transaction: 50,
            txn_cache_size: 1024,
        }
    }
}

impl From<&AppConfig> for IngressConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            server_name: cfg.server.name.clone(),
            max_pdus_per_transaction: cfg.federation.max_pdus_per_transaction,
            txn_cache_size: cfg.federation.txn_cache_size,
        }
    }
}

/// Parse a PDU and check its hash and origin signature.
pub async fn check_pdu(keys: &dyn KeyLookup, pdu: Value) -> Result<Event, FederationError> {
    let event = Event::from_pdu(pdu).map_err(|e| match e {
        EventFormatError::HashMismatch { declared, computed } => FederationError::HashMismatch { declared, computed },
        EventFormatError::Shape(e) => FederationError::MalformedPdu(e.to_string()),
    })?;
    verify_event(keys, &event).await?;
    Ok(event)
}

/// Responses already sent, by `(origin, txn_id)`, oldest evicted first.
struct TxnCache {
    entries: HashMap<(String, String), TransactionResponse>,
    order: VecDeque<(String, String)>,
    capacity: usize,
}

impl TxnCache {
    fn get(&self, key: &(String, String)) -> Option<TransactionResponse> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: (String, String), response: TransactionResponse) {
        if self.entries.insert(key.clone(), response).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

pub struct FederationIngress {
    dag: Arc<RoomDag>,
    keys: Arc<dyn KeyLookup>,
    sender: Option<FederationSender>,
    txns: Mutex<TxnCache>,
    config: IngressConfig,
}

impl FederationIngress {
    pub fn new(dag: Arc<RoomDag>, keys: Arc<dyn KeyLookup>, config: IngressConfig) -> Self {
        Self {
            dag,
            keys,
            sender: None,
            txns: Mutex::new(TxnCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: config.txn_cache_size.max(1),
            }),
            config,
        }
    }

    /// Mark origins reachable in `sender` when their transactions arrive.
    pub fn with_sender(mut self, sender: FederationSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    pub fn keys(&self) -> &Arc<dyn KeyLookup> {
        &self.keys
    }

    /// Check a request's `Authorization` header and return the origin server.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
        method: &str,
        uri: &str,
        content: Option<&Value>,
    ) -> Result<String, FederationError> {
        let auth = FedAuth::parse(authorization.ok_or(FederationError::MissingAuthHeader)?)?;
        let key = self.keys.get_signing_key(&auth.origin, &auth.key_id, Utc::now().timestamp_millis()).await?;
        verify_request(&auth, &self.config.server_name, method, uri, content, &key).map_err(|e| {
            warn!(origin = %auth.origin, "Federation request signature invalid");
            e
        })?;
        Ok(auth.origin)
    }

    /// Process one inbound transaction.
    pub async fn receive_transaction(
        &self,
        txn_id: &str,
        txn: Transaction,
    ) -> Result<TransactionResponse, FederationError> {
        if !ids::is_valid_server_name(&txn.origin) {
            return Err(FederationError::MalformedPdu(format!("invalid origin '{}'", txn.origin)));
        }
        if txn.pdus.len() > self.config.max_pdus_per_transaction {
            warn!(origin = %txn.origin, count = txn.pdus.len(), "Transaction over PDU limit");
            return Err(FederationError::TooManyPdus {
                count: txn.pdus.len(),
                limit: self.config.max_pdus_per_transaction,
            });
        }

        let cache_key = (txn.origin.clone(), txn_id.to_owned());
        if let Some(cached) = self.cached(&cache_key) {
            debug!(origin = %txn.origin, txn_id = %txn_id, "Replayed transaction");
            return Ok(cached);
        }

        // Shares the room DAG's submission pool with local clients.
        let _permit = self.dag.submission_permit().await.map_err(|e| FederationError::Other(anyhow::anyhow!(e)))?;

        let origin = txn.origin;
        let mut response = TransactionResponse::default();
        for pdu in txn.pdus {
            let key = pdu_key(&pdu);
            let result = self.process_pdu(&origin, pdu).await;
            response.pdus.insert(key, result);
        }

        let failed = response.failures().count();
        info!(origin = %origin, txn_id = %txn_id, pdus = response.pdus.len(), failed, "Processed transaction");

        self.txns.lock().unwrap_or_else(PoisonError::into_inner).insert(cache_key, response.clone());
        if let Some(sender) = &self.sender {
            sender.mark_reachable(&origin).await;
        }
        Ok(response)
    }

    fn cached(&self, key: &(String, String)) -> Option<TransactionResponse> {
        self.txns.lock().unwrap_or_else(PoisonError::into_inner).get(key)
    }

    async fn process_pdu(&self, via: &str, pdu: Value) -> PduResult {
        let event = match check_pdu(self.keys.as_ref(), pdu).await {
            Ok(event) => event,
            Err(e) => {
                match &e {
                    FederationError::MalformedPdu(_) => warn!(via = %via, error = %e, "Malformed PDU"),
                    _ => error!(via = %via, error = %e, "PDU failed hash or signature check"),
                }
                return PduResult::from(&HearthError::from(e));
            }
        };

        let event_id = event.event_id.clone();
        match self.dag.submit_event(event, Origin::Federation { via: via.to_owned() }).await {
            Ok(submission) => match submission.outcome {
                Outcome::Accepted => PduResult::ok(),
                Outcome::Rejected(reason) => {
                    warn!(event_id = %event_id, via = %via, reason = %reason, "Rejected remote event");
                    PduResult::from(&HearthError::Unauthorized { reason })
                }
            },
            Err(e) => {
                let e = HearthError::from(e);
                warn!(event_id = %event_id, via = %via, error = %e, "Remote event not accepted");
                PduResult::from(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use hearth_db::Stores;
    use hearth_rooms::{DagConfig, EventTemplate};
    use serde_json::json;

    use super::*;
    use crate::{
        keyring::KeyRing,
        keys::ServerKeyPair,
        signatures::{ServerSigner, sign_request},
    };

    struct Remote {
        dag: RoomDag,
        keys: Arc<ServerKeyPair>,
    }

    fn remote() -> Remote {
        let keys = Arc::new(ServerKeyPair::generate());
        let dag = RoomDag::new(Stores::memory(), DagConfig { server_name: "b.test".into(), ..DagConfig::default() })
            .with_signer(Arc::new(ServerSigner::new("b.test", keys.clone())));
        Remote { dag, keys }
    }

    fn local(remote: &Remote, max_pdus: usize) -> FederationIngress {
        let own = Arc::new(ServerKeyPair::generate());
        let ring = KeyRing::new("a.test", own);
        ring.pin("b.test", &remote.keys.key_id, remote.keys.public_key_base64());
        let dag = Arc::new(RoomDag::new(Stores::memory(), DagConfig { server_name: "a.test".into(), ..DagConfig::default() }));
        let config = IngressConfig { server_name: "a.test".into(), max_pdus_per_transaction: max_pdus, ..IngressConfig::default() };
        FederationIngress::new(dag, Arc::new(ring), config)
    }

    /// A room on `remote` with its create and join events as PDUs.
    async fn remote_room(remote: &Remote) -> (String, Vec<Value>) {
        let room_id = ids::new_room_id("b.test");
        let bob = "@bob:b.test";
        let templates = [
            EventTemplate {
                room_id: room_id.clone(),
                sender: bob.into(),
                event_type: "m.room.create".into(),
                state_key: Some(String::new()),
                content: json!({ "creator": bob, "room_version": "2" }),
            },
            EventTemplate {
                room_id: room_id.clone(),
                sender: bob.into(),
                event_type: "m.room.member".into(),
                state_key: Some(bob.into()),
                content: json!({ "membership": "join" }),
            },
        ];
        let mut pdus = Vec::new();
        for template in templates {
            let id = remote.dag.submit_local(template).await.unwrap();
            let ev = remote.dag.event(&id).await.unwrap();
            pdus.push(serde_json::to_value(ev.as_ref()).unwrap());
        }
        (room_id, pdus)
    }

    #[tokio::test]
    async fn signed_pdus_are_accepted_and_replays_answered_from_cache() {
        let remote = remote();
        let ingress = local(&remote, 50);
        let (room_id, pdus) = remote_room(&remote).await;

        let response = ingress.receive_transaction("t1", Transaction::new("b.test", pdus.clone())).await.unwrap();
        assert_eq!(response.pdus.len(), 2);
        assert!(response.pdus.values().all(PduResult::is_ok));
        assert_eq!(ingress.dag.current_state(&room_id).await.unwrap().len(), 2);

        let replay = ingress.receive_transaction("t1", Transaction::new("b.test", vec![])).await.unwrap();
        assert_eq!(replay, response);
    }

    #[tokio::test]
    async fn oversized_transactions_are_refused_whole() {
        let remote = remote();
        let ingress = local(&remote, 1);
        let (room_id, pdus) = remote_room(&remote).await;

        let err = ingress.receive_transaction("t1", Transaction::new("b.test", pdus)).await.unwrap_err();
        assert!(matches!(err, FederationError::TooManyPdus { count: 2, limit: 1 }));
        assert!(ingress.dag.current_state(&room_id).await.is_err());
    }

    #[tokio::test]
    async fn unsigned_and_unparseable_pdus_fail_individually() {
        let remote = remote();
        let ingress = local(&remote, 50);
        let (_, mut pdus) = remote_room(&remote).await;
        pdus[0]["signatures"] = json!({});
        pdus.push(json!({ "type": "m.room.message" }));

        let response = ingress.receive_transaction("t2", Transaction::new("b.test", pdus.clone())).await.unwrap();
        let code = |pdu: &Value| response.pdus[&pdu_key(pdu)].errcode.clone();
        assert_eq!(code(&pdus[0]).as_deref(), Some("H_BAD_SIGNATURE"));
        // Its create event was refused, so the join has no known prev event.
        assert_eq!(code(&pdus[1]).as_deref(), Some("H_UNKNOWN_PREVIOUS"));
        assert_eq!(code(&pdus[2]).as_deref(), Some("H_MALFORMED"));
    }

    #[tokio::test]
    async fn request_signatures_identify_the_origin() {
        let remote = remote();
        let ingress = local(&remote, 50);
        let body = json!({ "origin": "b.test", "origin_server_ts": 0, "pdus": [] });
        let uri = "/_hearth/federation/v1/send/t9";
        let auth = sign_request(&remote.keys, "b.test", "a.test", "PUT", uri, Some(&body));

        let origin = ingress.authenticate(Some(&auth.to_header()), "PUT", uri, Some(&body)).await.unwrap();
        assert_eq!(origin, "b.test");

        assert!(matches!(
            ingress.authenticate(None, "PUT", uri, Some(&body)).await,
            Err(FederationError::MissingAuthHeader)
        ));
        let other = json!({ "origin": "b.test", "origin_server_ts": 1, "pdus": [] });
        assert!(ingress.authenticate(Some(&auth.to_header()), "PUT", uri, Some(&other)).await.is_err());
    }
}
