//! Hand-built rooms for unit tests. Events are sealed but unsigned.

use std::collections::BTreeMap;
use std::sync::Arc;

use hearth_common::{
    StateEvents, StateKey,
    event::{Event, kinds},
};
use serde_json::{Value, json};

use crate::auth::select_auth_events;

pub const ROOM_ID: &str = "!room:a.test";

pub struct RoomFixture {
    pub alice: String,
    pub bob: String,
    pub create: Arc<Event>,
    pub state: StateEvents,
    pub events: BTreeMap<String, Arc<Event>>,
    last: String,
    depth: u64,
}

impl RoomFixture {
    pub fn new() -> Self {
        Self::with_content(json!({ "creator": "@alice:a.test", "room_version": "2" }))
    }

    pub fn with_content(content: Value) -> Self {
        let mut create = Event {
            event_id: String::new(),
            room_id: ROOM_ID.into(),
            sender: "@alice:a.test".into(),
            event_type: kinds::CREATE.into(),
            state_key: Some(String::new()),
            content,
            prev_events: vec![],
            auth_events: vec![],
            depth: 1,
            origin_server_ts: 1_000,
            signatures: BTreeMap::new(),
        };
        create.seal().unwrap();
        let create = Arc::new(create);

        let mut state = StateEvents::new();
        state.insert(StateKey::new(kinds::CREATE, ""), create.clone());
        let events = BTreeMap::from([(create.event_id.clone(), create.clone())]);

        Self {
            alice: "@alice:a.test".into(),
            bob: "@bob:a.test".into(),
            last: create.event_id.clone(),
            create,
            state,
            events,
            depth: 1,
        }
    }

    pub fn with_alice_joined() -> Self {
        let mut room = Self::new();
        room.join_alice();
        room
    }

    /// Alice creates, invites Bob, Bob joins.
    pub fn with_bob_joined() -> Self {
        let mut room = Self::with_alice_joined();
        let (alice, bob) = (room.alice.clone(), room.bob.clone());
        room.apply(room.member(&alice, &bob, "invite"));
        room.apply(room.member(&bob, &bob, "join"));
        room
    }

    pub fn join_alice(&mut self) {
        let alice = self.alice.clone();
        self.apply(self.member(&alice, &alice, "join"));
    }

    /// An event on top of the latest applied one, citing the auth events the
    /// current state selects.
    pub fn event(&self, sender: &str, event_type: &str, state_key: Option<&str>, content: Value) -> Event {
        let mut ev = Event {
            event_id: String::new(),
            room_id: ROOM_ID.into(),
            sender: sender.into(),
            event_type: event_type.into(),
            state_key: state_key.map(str::to_owned),
            content,
            prev_events: vec![self.last.clone()],
            auth_events: vec![],
            depth: self.depth + 1,
            origin_server_ts: 1_000 + self.depth as i64 + 1,
            signatures: BTreeMap::new(),
        };
        ev.auth_events = select_auth_events(&ev, &self.state).into_iter().collect();
        ev.seal().unwrap();
        ev
    }

    pub fn state_event(&self, sender: &str, event_type: &str, state_key: &str, content: Value) -> Event {
        self.event(sender, event_type, Some(state_key), content)
    }

    pub fn member(&self, sender: &str, target: &str, membership: &str) -> Event {
        self.state_event(sender, kinds::MEMBER, target, json!({ "membership": membership }))
    }

    /// Accept `ev` into the fixture's linear history.
    pub fn apply(&mut self, ev: Event) -> Arc<Event> {
        let ev = Arc::new(ev);
        if let Some(slot) = ev.state_slot() {
            self.state.insert(slot, ev.clone());
        }
        self.events.insert(ev.event_id.clone(), ev.clone());
        self.last = ev.event_id.clone();
        self.depth = ev.depth;
        ev
    }

    pub fn event_id_of(&self, event_type: &str, state_key: &str) -> Option<String> {
        self.state.get(&StateKey::new(event_type, state_key)).map(|ev| ev.event_id.clone())
    }

    /// Current state as ids.
    pub fn state_map(&self) -> hearth_common::StateMap {
        self.state.iter().map(|(k, ev)| (k.clone(), ev.event_id.clone())).collect()
    }
}
