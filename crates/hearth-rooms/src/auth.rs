//! Auth rules.
//!
//! [`check_auth`] decides whether an event is allowed given the room state
//! before it. Rules run in a fixed order so every server reports the same
//! reason for the same event:
//!
//! 0. shape
//! 1. create event
//! 2. membership transitions
//! 3. power levels for everything else
//! 4. declared auth events are exactly the ones selected by [`auth_types_for`]
//!
//! The state resolver re-checks events against partial state, where rule 4
//! cannot hold, so it calls [`check_rules`] (rules 0 to 3).

use std::collections::BTreeSet;

use hearth_common::{
    StateEvents, StateKey, ids,
    event::{Event, Membership, kinds},
};
use serde_json::Value;

use crate::{
    power_levels::{PowerLevels, THRESHOLDS, creator_of},
    room_version::RoomVersion,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("room has no create event")]
    MissingCreate,

    #[error("create event is invalid: {0}")]
    InvalidCreate(String),

    #[error("room does not allow senders from other servers")]
    NotFederated,

    #[error("membership change not allowed: {0}")]
    Membership(String),

    #[error("sender is not joined to the room")]
    SenderNotJoined,

    #[error("sender power {actual} is below required {required}")]
    InsufficientPower { required: i64, actual: i64 },

    #[error("state key '{0}' belongs to another user")]
    StateKeyNotOwned(String),

    #[error("power levels change not allowed: {0}")]
    PowerEscalation(String),

    #[error("auth events do not match room state")]
    AuthEventsMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    Allowed,
    Rejected(RejectReason),
}

impl AuthVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

impl From<Result<(), RejectReason>> for AuthVerdict {
    fn from(r: Result<(), RejectReason>) -> Self {
        match r {
            Ok(()) => Self::Allowed,
            Err(reason) => Self::Rejected(reason),
        }
    }
}

type Rule = Result<(), RejectReason>;

/// All auth rules.
pub fn check_auth(event: &Event, auth_state: &StateEvents, version: &RoomVersion) -> AuthVerdict {
    run(event, auth_state, version)
        .and_then(|()| check_auth_events(event, auth_state))
        .into()
}

/// Rules 0 to 3: everything except the exact auth-event set.
pub fn check_rules(event: &Event, auth_state: &StateEvents, version: &RoomVersion) -> AuthVerdict {
    run(event, auth_state, version).into()
}

fn run(event: &Event, state: &StateEvents, version: &RoomVersion) -> Rule {
    check_shape(event)?;

    if event.is_type(kinds::CREATE) {
        return check_create(event, version);
    }
    let create = state
        .get(&StateKey::new(kinds::CREATE, ""))
        .filter(|c| c.room_id == event.room_id)
        .ok_or(RejectReason::MissingCreate)?;
    if create.content.get("m.federate").and_then(Value::as_bool) == Some(false)
        && event.origin() != create.origin()
    {
        return Err(RejectReason::NotFederated);
    }

    let levels = PowerLevels::from_state(state);
    if event.is_type(kinds::MEMBER) {
        return check_membership(event, create, state, &levels);
    }
    check_power(event, state, &levels)
}

/// Rule 0. Also used by the DAG manager to refuse malformed events before
/// they touch storage.
pub fn check_shape(event: &Event) -> Rule {
    let malformed = |m: &str| Err(RejectReason::Malformed(m.to_owned()));

    if !ids::is_valid_event_id(&event.event_id) {
        return malformed("invalid event id");
    }
    if !ids::is_valid_room_id(&event.room_id) {
        return malformed("invalid room id");
    }
    if !ids::is_valid_user_id(&event.sender) {
        return malformed("invalid sender");
    }
    if event.event_type.is_empty() {
        return malformed("empty event type");
    }
    if !event.content.is_object() {
        return malformed("content is not an object");
    }
    if event.depth == 0 {
        return malformed("depth must be positive");
    }
    if event.prev_events.iter().chain(&event.auth_events).any(|id| !ids::is_valid_event_id(id)) {
        return malformed("invalid referenced event id");
    }
    if !event.is_type(kinds::CREATE) && event.prev_events.is_empty() {
        return malformed("only the create event may have no prev events");
    }
    if event.is_type(kinds::MEMBER) {
        match event.state_key.as_deref() {
            Some(target) if ids::is_valid_user_id(target) => {}
            _ => return malformed("member state key is not a user id"),
        }
        if event.membership().is_none() {
            return malformed("unknown membership");
        }
    }
    Ok(())
}

/// Rule 1 for the create event itself.
fn check_create(event: &Event, version: &RoomVersion) -> Rule {
    let invalid = |m: &str| Err(RejectReason::InvalidCreate(m.to_owned()));

    if !event.is_create() {
        return invalid("state key must be empty");
    }
    if !event.prev_events.is_empty() || !event.auth_events.is_empty() {
        return invalid("must not reference other events");
    }
    if event.origin() != ids::server_name_of(&event.room_id) {
        return invalid("sender server does not own the room id");
    }
    match event.content.get("room_version") {
        None => Ok(()),
        Some(Value::String(v)) if v == version.id => Ok(()),
        Some(_) => invalid("room_version does not match"),
    }
}

fn membership_of(state: &StateEvents, user_id: &str) -> Option<Membership> {
    state.get(&StateKey::new(kinds::MEMBER, user_id)).and_then(|ev| ev.membership())
}

fn join_rule(state: &StateEvents) -> &str {
    state
        .get(&StateKey::new(kinds::JOIN_RULES, ""))
        .and_then(|ev| ev.content.get("join_rule"))
        .and_then(Value::as_str)
        .unwrap_or("invite")
}

/// Rule 2.
fn check_membership(event: &Event, create: &Event, state: &StateEvents, levels: &PowerLevels) -> Rule {
    let denied = |m: &str| Err(RejectReason::Membership(m.to_owned()));

    // Shape has already guaranteed both of these.
    let (Some(target), Some(membership)) = (event.state_key.as_deref(), event.membership()) else {
        return denied("missing target or membership");
    };
    let sender = event.sender.as_str();
    let sender_joined = membership_of(state, sender) == Some(Membership::Join);
    let current = membership_of(state, target);
    let sender_level = levels.user_level(sender);
    let target_level = levels.user_level(target);

    match membership {
        Membership::Join => {
            if sender != target {
                return denied("cannot join on behalf of another user");
            }
            if current == Some(Membership::Ban) {
                return denied("target is banned");
            }
            if event.prev_events.len() == 1
                && event.prev_events[0] == create.event_id
                && sender == creator_of(create)
            {
                return Ok(());
            }
            match join_rule(state) {
                "public" => Ok(()),
                "invite" if matches!(current, Some(Membership::Invite | Membership::Join)) => Ok(()),
                _ => denied("join rules do not allow joining"),
            }
        }
        Membership::Invite => {
            if !sender_joined {
                return Err(RejectReason::SenderNotJoined);
            }
            if matches!(current, Some(Membership::Join | Membership::Ban)) {
                return denied("target is already joined or banned");
            }
            require(levels.invite, sender_level)
        }
        Membership::Leave if sender == target => {
            if matches!(current, Some(Membership::Invite | Membership::Join)) {
                Ok(())
            } else {
                denied("not invited or joined")
            }
        }
        Membership::Leave => {
            if !sender_joined {
                return Err(RejectReason::SenderNotJoined);
            }
            let needed = if current == Some(Membership::Ban) { levels.ban } else { levels.kick };
            require(needed, sender_level)?;
            if sender_level <= target_level {
                return denied("target has equal or greater power");
            }
            Ok(())
        }
        Membership::Ban => {
            if !sender_joined {
                return Err(RejectReason::SenderNotJoined);
            }
            require(levels.ban, sender_level)?;
            if sender_level <= target_level {
                return denied("target has equal or greater power");
            }
            Ok(())
        }
    }
}

fn require(required: i64, actual: i64) -> Rule {
    if actual < required {
        Err(RejectReason::InsufficientPower { required, actual })
    } else {
        Ok(())
    }
}

/// Rule 3.
fn check_power(event: &Event, state: &StateEvents, levels: &PowerLevels) -> Rule {
    if membership_of(state, &event.sender) != Some(Membership::Join) {
        return Err(RejectReason::SenderNotJoined);
    }
    let sender_level = levels.user_level(&event.sender);
    require(levels.event_level(&event.event_type, event.is_state()), sender_level)?;

    if let Some(sk) = event.state_key.as_deref() {
        if sk.starts_with('@') && sk != event.sender {
            return Err(RejectReason::StateKeyNotOwned(sk.to_owned()));
        }
    }

    if event.is_type(kinds::POWER_LEVELS) {
        let proposed = PowerLevels::from_content(&event.content).map_err(RejectReason::Malformed)?;
        if state.contains_key(&StateKey::new(kinds::POWER_LEVELS, "")) {
            check_escalation(&event.sender, sender_level, levels, &proposed)?;
        }
    }
    Ok(())
}

/// A power-levels change may not touch any level above the sender's own, nor
/// any user at or above the sender other than the sender itself.
fn check_escalation(sender: &str, own: i64, current: &PowerLevels, proposed: &PowerLevels) -> Rule {
    let escalation = |m: String| Err(RejectReason::PowerEscalation(m));

    for key in THRESHOLDS {
        let (old, new) = (current.threshold(key), proposed.threshold(key));
        if old != new && (old > Some(own) || new > Some(own)) {
            return escalation(format!("'{key}' is above sender level"));
        }
    }

    let event_types: BTreeSet<&String> = current.events.keys().chain(proposed.events.keys()).collect();
    for ty in event_types {
        let (old, new) = (current.events.get(ty), proposed.events.get(ty));
        if old != new && (old > Some(&own) || new > Some(&own)) {
            return escalation(format!("level of '{ty}' is above sender level"));
        }
    }

    let users: BTreeSet<&String> = current.users.keys().chain(proposed.users.keys()).collect();
    for user in users {
        let (old, new) = (current.users.get(user), proposed.users.get(user));
        if old == new {
            continue;
        }
        if user != sender && old >= Some(&own) {
            return escalation(format!("'{user}' has equal or greater power"));
        }
        if new > Some(&own) {
            return escalation(format!("cannot raise '{user}' above sender level"));
        }
    }
    Ok(())
}

/// State slots an event must cite as its auth events.
pub fn auth_types_for(event: &Event) -> BTreeSet<StateKey> {
    let mut keys = BTreeSet::new();
    if event.is_type(kinds::CREATE) {
        return keys;
    }
    keys.insert(StateKey::new(kinds::CREATE, ""));
    keys.insert(StateKey::new(kinds::POWER_LEVELS, ""));
    keys.insert(StateKey::new(kinds::MEMBER, event.sender.clone()));

    if event.is_type(kinds::MEMBER) {
        if let Some(target) = &event.state_key {
            keys.insert(StateKey::new(kinds::MEMBER, target.clone()));
        }
        if matches!(event.membership(), Some(Membership::Join | Membership::Invite)) {
            keys.insert(StateKey::new(kinds::JOIN_RULES, ""));
        }
    }
    keys
}

/// The auth event ids `state` selects for `event`.
pub fn select_auth_events(event: &Event, state: &StateEvents) -> BTreeSet<String> {
    auth_types_for(event).iter().filter_map(|k| state.get(k)).map(|ev| ev.event_id.clone()).collect()
}

/// Rule 4.
fn check_auth_events(event: &Event, state: &StateEvents) -> Rule {
    let declared: BTreeSet<&String> = event.auth_events.iter().collect();
    let expected = select_auth_events(event, state);
    if declared.len() != event.auth_events.len() || declared.len() != expected.len() {
        return Err(RejectReason::AuthEventsMismatch);
    }
    if declared.iter().all(|id| expected.contains(*id)) {
        Ok(())
    } else {
        Err(RejectReason::AuthEventsMismatch)
    }
}
