//! Multi-server scenarios over an in-process network.
//!
//! Every server gets the real stack (DAG, ingress, sender, key ring,
//! backfill); only the transport is replaced by [`Loopback`], which calls the
//! destination's ingress directly and can simulate a destination being down.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hearth_common::{Event, event::kinds, ids};
use hearth_db::Stores;
use hearth_federation::{
    FederationBackfill, FederationError, FederationIngress, FederationSender, IngressConfig, KeyRing, LinkState,
    SenderConfig, ServerKeyPair, ServerSigner, Transaction, TransactionResponse, Transport,
    signatures::sign_event,
    types::{MissingEventsRequest, MissingEventsResponse, ServerKeyDocument},
};
use hearth_rooms::{DagConfig, EventTemplate, Origin, RoomDag};
use serde_json::{Value, json};

const ALICE: &str = "@alice:a.test";
const CAROL: &str = "@carol:b.test";
const DAVE: &str = "@dave:c.test";

struct Node {
    dag: Arc<RoomDag>,
    ingress: Arc<FederationIngress>,
    sender: FederationSender,
    keys: Arc<ServerKeyPair>,
}

#[derive(Default)]
struct Net {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    down: Mutex<BTreeSet<String>>,
    probes: AtomicUsize,
    /// `(destination, event ids)` of every delivered transaction.
    delivered: Mutex<Vec<(String, Vec<String>)>>,
}

impl Net {
    fn node(&self, name: &str) -> Result<Arc<Node>, FederationError> {
        if self.down.lock().unwrap().contains(name) {
            return Err(FederationError::RemoteUnreachable(name.into()));
        }
        self.nodes
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| FederationError::RemoteUnreachable(name.into()))
    }

    fn set_down(&self, name: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(name.into());
        } else {
            set.remove(name);
        }
    }

    fn delivered_to(&self, destination: &str) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == destination)
            .flat_map(|(_, ids)| ids.clone())
            .collect()
    }
}

struct Loopback {
    net: Arc<Net>,
}

#[async_trait]
impl Transport for Loopback {
    async fn send_transaction(
        &self,
        destination: &str,
        txn_id: &str,
        txn: &Transaction,
    ) -> Result<TransactionResponse, FederationError> {
        let node = self.net.node(destination)?;
        let response = node.ingress.receive_transaction(txn_id, txn.clone()).await?;
        let ids = txn.pdus.iter().map(|p| p["event_id"].as_str().unwrap_or_default().to_owned()).collect();
        self.net.delivered.lock().unwrap().push((destination.to_owned(), ids));
        Ok(response)
    }

    async fn probe(&self, destination: &str) -> Result<(), FederationError> {
        self.net.probes.fetch_add(1, Ordering::SeqCst);
        self.net.node(destination).map(|_| ())
    }

    async fn fetch_server_keys(&self, destination: &str) -> Result<ServerKeyDocument, FederationError> {
        self.net.node(destination)?.keys.to_key_document(destination)
    }

    async fn get_missing_events(
        &self,
        destination: &str,
        room_id: &str,
        request: &MissingEventsRequest,
    ) -> Result<MissingEventsResponse, FederationError> {
        let node = self.net.node(destination)?;
        let events = node
            .dag
            .missing_events(room_id, &request.earliest_events, &request.latest_events, request.limit)
            .await
            .map_err(|e| FederationError::RemoteProtocol(destination.into(), e.to_string()))?;
        let events = events.iter().map(|ev| serde_json::to_value(ev.as_ref())).collect::<Result<_, _>>()?;
        Ok(MissingEventsResponse { events })
    }
}

fn spawn_node(net: &Arc<Net>, name: &str) -> Arc<Node> {
    let keys = Arc::new(ServerKeyPair::generate());
    let transport: Arc<dyn Transport> = Arc::new(Loopback { net: net.clone() });
    let ring = Arc::new(KeyRing::new(name, keys.clone()).with_transport(transport.clone()));
    let sender = FederationSender::new(
        transport.clone(),
        SenderConfig {
            server_name: name.into(),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            unreachable_threshold: 3,
            probe_interval: Duration::from_secs(60),
            ..SenderConfig::default()
        },
    );
    let dag = Arc::new(
        RoomDag::new(Stores::memory(), DagConfig { server_name: name.into(), ..DagConfig::default() })
            .with_sink(Arc::new(sender.clone()))
            .with_backfill(Arc::new(FederationBackfill::new(transport, ring.clone(), 100)))
            .with_signer(Arc::new(ServerSigner::new(name, keys.clone()))),
    );
    let ingress = Arc::new(
        FederationIngress::new(dag.clone(), ring, IngressConfig { server_name: name.into(), ..IngressConfig::default() })
            .with_sender(sender.clone()),
    );
    let node = Arc::new(Node { dag, ingress, sender, keys });
    net.nodes.write().unwrap().insert(name.into(), node.clone());
    node
}

fn template(room_id: &str, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> EventTemplate {
    EventTemplate {
        room_id: room_id.into(),
        sender: sender.into(),
        event_type: event_type.into(),
        state_key: state_key.map(str::to_owned),
        content,
    }
}

fn message(room_id: &str, sender: &str, body: &str) -> EventTemplate {
    template(room_id, sender, kinds::MESSAGE, None, json!({ "body": body }))
}

/// Let workers run; the paused clock jumps over backoff sleeps.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Alice creates a public room on `a` in which Carol may set state.
async fn create_room(a: &Node) -> String {
    let room_id = ids::new_room_id("a.test");
    let setup = [
        template(&room_id, ALICE, kinds::CREATE, Some(""), json!({ "creator": ALICE, "room_version": "2" })),
        template(&room_id, ALICE, kinds::MEMBER, Some(ALICE), json!({ "membership": "join" })),
        template(&room_id, ALICE, kinds::JOIN_RULES, Some(""), json!({ "join_rule": "public" })),
        template(&room_id, ALICE, kinds::POWER_LEVELS, Some(""), json!({ "users": { ALICE: 100, CAROL: 50 } })),
    ];
    for t in setup {
        a.dag.submit_local(t).await.unwrap();
    }
    room_id
}

/// `to` learns the room's history from `from` the way a joining server would.
async fn copy_history(from: &Node, to: &Node, room_id: &str) {
    let latest: Vec<String> = from.dag.forward_extremities(room_id).await.unwrap().into_iter().collect();
    for ev in from.dag.missing_events(room_id, &[], &latest, 100).await.unwrap() {
        to.dag.submit_event(ev.as_ref().clone(), Origin::Backfill).await.unwrap();
    }
}

/// `user` joins on `node`, which must already hold the room's history.
async fn join(node: &Node, user: &str, room_id: &str) -> String {
    let id = node
        .dag
        .submit_local(template(room_id, user, kinds::MEMBER, Some(user), json!({ "membership": "join" })))
        .await
        .unwrap();
    settle(10).await;
    id
}

/// A room on `a` that Carol has joined from `b`.
async fn shared_room(a: &Node, b: &Node) -> String {
    let room_id = create_room(a).await;
    copy_history(a, b, &room_id).await;
    join(b, CAROL, &room_id).await;
    room_id
}

#[tokio::test(start_paused = true)]
async fn join_from_remote_server_reaches_room_owner() {
    let net = Arc::new(Net::default());
    let a = spawn_node(&net, "a.test");
    let b = spawn_node(&net, "b.test");
    let room_id = shared_room(&a, &b).await;

    assert_eq!(
        a.dag.joined_servers(&room_id).await.unwrap(),
        BTreeSet::from(["a.test".to_owned(), "b.test".to_owned()])
    );
    assert_eq!(a.dag.current_state(&room_id).await.unwrap(), b.dag.current_state(&room_id).await.unwrap());

    let hello = a.dag.submit_local(message(&room_id, ALICE, "hello")).await.unwrap();
    settle(10).await;
    assert!(b.dag.event(&hello).await.is_ok());
    assert_eq!(b.dag.forward_extremities(&room_id).await.unwrap(), BTreeSet::from([hello]));
}

#[tokio::test(start_paused = true)]
async fn concurrent_renames_converge_on_both_servers() {
    let net = Arc::new(Net::default());
    let a = spawn_node(&net, "a.test");
    let b = spawn_node(&net, "b.test");
    let room_id = shared_room(&a, &b).await;

    // Partition, rename on both sides, heal before the first retry.
    net.set_down("a.test", true);
    net.set_down("b.test", true);
    let name = |sender: &str, name: &str| {
        template(&room_id, sender, kinds::NAME, Some(""), json!({ "name": name }))
    };
    let from_a = a.dag.submit_local(name(ALICE, "alice's room")).await.unwrap();
    let from_b = b.dag.submit_local(name(CAROL, "carol's room")).await.unwrap();
    settle(10).await;
    net.set_down("a.test", false);
    net.set_down("b.test", false);
    settle(500).await;

    let forks = BTreeSet::from([from_a.clone(), from_b.clone()]);
    assert_eq!(a.dag.forward_extremities(&room_id).await.unwrap(), forks);
    assert_eq!(b.dag.forward_extremities(&room_id).await.unwrap(), forks);

    let state_a = a.dag.current_state(&room_id).await.unwrap();
    let state_b = b.dag.current_state(&room_id).await.unwrap();
    assert_eq!(state_a, state_b);
    let winner = state_a.get(&hearth_common::StateKey::new(kinds::NAME, "")).unwrap();
    assert!(forks.contains(winner));

    // The next event merges the forks everywhere.
    let merge = a.dag.submit_local(message(&room_id, ALICE, "merged")).await.unwrap();
    settle(10).await;
    assert_eq!(b.dag.forward_extremities(&room_id).await.unwrap(), BTreeSet::from([merge.clone()]));
    assert_eq!(b.dag.state_before(&merge).await.unwrap(), state_b);
}

#[tokio::test(start_paused = true)]
async fn mixed_signature_transaction_reports_each_pdu() {
    let net = Arc::new(Net::default());
    let a = spawn_node(&net, "a.test");
    let b = spawn_node(&net, "b.test");
    let room_id = shared_room(&a, &b).await;

    let good = b.dag.build_local_event(message(&room_id, CAROL, "good")).await.unwrap();

    let mut forged = b.dag.build_local_event(message(&room_id, CAROL, "forged")).await.unwrap();
    forged.signatures.clear();
    sign_event(&ServerKeyPair::generate(), "b.test", &mut forged).unwrap();

    let mut tampered: Event = b.dag.build_local_event(message(&room_id, CAROL, "honest")).await.unwrap();
    tampered.content = json!({ "body": "tampered" });

    let pdus: Vec<Value> = [&good, &forged, &tampered].iter().map(|ev| serde_json::to_value(ev).unwrap()).collect();
    let response = a.ingress.receive_transaction("mixed-1", Transaction::new("b.test", pdus)).await.unwrap();

    assert!(response.pdus[&good.event_id].is_ok());
    assert_eq!(response.pdus[&forged.event_id].errcode.as_deref(), Some("H_BAD_SIGNATURE"));
    assert_eq!(response.pdus[&tampered.event_id].errcode.as_deref(), Some("H_BAD_SIGNATURE"));

    assert!(a.dag.event(&forged.event_id).await.is_err());
    assert!(a.dag.event(&tampered.event_id).await.is_err());
    assert_eq!(a.dag.forward_extremities(&room_id).await.unwrap(), BTreeSet::from([good.event_id.clone()]));
}

#[tokio::test(start_paused = true)]
async fn unreachable_destination_is_probed_and_caught_up_in_order() {
    let net = Arc::new(Net::default());
    let a = spawn_node(&net, "a.test");
    let b = spawn_node(&net, "b.test");
    let room_id = shared_room(&a, &b).await;

    net.set_down("b.test", true);
    let mut sent = Vec::new();
    for n in 0..5 {
        sent.push(a.dag.submit_local(message(&room_id, ALICE, &format!("m{n}"))).await.unwrap());
        settle(1).await;
    }
    // Failures at roughly t=0, 100ms and 300ms.
    settle(500).await;
    let status = a.sender.status("b.test").await.unwrap();
    assert_eq!(status.link, LinkState::Unreachable);
    assert_eq!(status.queued, 5);

    net.set_down("b.test", false);
    settle(30_000).await;
    assert_eq!(a.sender.status("b.test").await.unwrap().link, LinkState::Unreachable);

    settle(31_000).await;
    assert_eq!(net.probes.load(Ordering::SeqCst), 1);
    let status = a.sender.status("b.test").await.unwrap();
    assert_eq!((status.link, status.queued), (LinkState::Healthy, 0));

    let delivered: Vec<String> = net.delivered_to("b.test").into_iter().filter(|id| sent.contains(id)).collect();
    assert_eq!(delivered, sent);
    assert_eq!(b.dag.forward_extremities(&room_id).await.unwrap(), BTreeSet::from([sent[4].clone()]));
}

#[tokio::test(start_paused = true)]
async fn inbound_transaction_marks_origin_reachable() {
    let net = Arc::new(Net::default());
    let a = spawn_node(&net, "a.test");
    let b = spawn_node(&net, "b.test");
    let room_id = shared_room(&a, &b).await;

    net.set_down("b.test", true);
    let pending = a.dag.submit_local(message(&room_id, ALICE, "while down")).await.unwrap();
    settle(500).await;
    assert_eq!(a.sender.status("b.test").await.unwrap().link, LinkState::Unreachable);

    net.set_down("b.test", false);
    b.dag.submit_local(message(&room_id, CAROL, "i'm back")).await.unwrap();
    settle(10).await;

    assert_eq!(net.probes.load(Ordering::SeqCst), 0);
    assert_eq!(a.sender.status("b.test").await.unwrap().link, LinkState::Healthy);
    assert!(b.dag.event(&pending).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn each_server_receives_every_event_exactly_once() {
    let net = Arc::new(Net::default());
    let a = spawn_node(&net, "a.test");
    let b = spawn_node(&net, "b.test");
    let c = spawn_node(&net, "c.test");

    // c.test copies the room before Carol joins from b.test, so Dave's join
    // names only a.test and c.test and has to be relayed to b.test.
    let room_id = create_room(&a).await;
    copy_history(&a, &c, &room_id).await;
    copy_history(&a, &b, &room_id).await;
    join(&b, CAROL, &room_id).await;
    let dave_join = join(&c, DAVE, &room_id).await;

    let hello = a.dag.submit_local(message(&room_id, ALICE, "hello")).await.unwrap();
    settle(10).await;
    let hi = b.dag.submit_local(message(&room_id, CAROL, "hi")).await.unwrap();
    settle(10).await;
    let hey = c.dag.submit_local(message(&room_id, DAVE, "hey")).await.unwrap();
    settle(10).await;

    let servers = ["a.test", "b.test", "c.test"];
    for server in servers {
        let received = net.delivered_to(server);
        let unique: BTreeSet<&String> = received.iter().collect();
        assert_eq!(unique.len(), received.len(), "{server} received an event twice");
    }

    let times = |destination: &str, id: &str| net.delivered_to(destination).iter().filter(|d| *d == id).count();
    assert_eq!(times("b.test", &dave_join), 1);
    for (id, origin) in [(&hello, "a.test"), (&hi, "b.test"), (&hey, "c.test")] {
        for server in servers.iter().filter(|s| **s != origin) {
            assert_eq!(times(server, id), 1, "{id} reached {server} {} times", times(server, id));
        }
    }

    let state = a.dag.current_state(&room_id).await.unwrap();
    assert_eq!(b.dag.current_state(&room_id).await.unwrap(), state);
    assert_eq!(c.dag.current_state(&room_id).await.unwrap(), state);
}
