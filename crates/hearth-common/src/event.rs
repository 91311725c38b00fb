//! Room events (PDUs): the signed, content-addressed units of room history.
//!
//! An event's identifier is the reference hash of its canonical JSON with the
//! envelope fields (`event_id`, `signatures`, `unsigned`) removed. The origin
//! server's signature covers exactly the same bytes, so a valid signature also
//! vouches for the identifier.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    canonical::{canonical_json, sha256_b64, strip_unhashed},
    ids,
    state::StateKey,
};

/// Well-known event types.
pub mod kinds {
    pub const CREATE: &str = "m.room.create";
    pub const MEMBER: &str = "m.room.member";
    pub const POWER_LEVELS: &str = "m.room.power_levels";
    pub const JOIN_RULES: &str = "m.room.join_rules";
    pub const NAME: &str = "m.room.name";
    pub const TOPIC: &str = "m.room.topic";
    pub const MESSAGE: &str = "m.room.message";
}

/// Membership values carried in `m.room.member` content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
}

impl Membership {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invite" => Some(Self::Invite),
            "join" => Some(Self::Join),
            "leave" => Some(Self::Leave),
            "ban" => Some(Self::Ban),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Ban => "ban",
        }
    }
}

/// A persistent room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// `$<reference hash>`. May be absent on the wire; [`Event::from_pdu`] fills it.
    #[serde(default)]
    pub event_id: String,
    pub room_id: String,
    /// `@user:server`: the server part names the origin server.
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Present iff this is a state event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: Value,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
    pub depth: u64,
    /// Unix millisecond timestamp on the origin server.
    pub origin_server_ts: i64,
    /// `server name → key id → base64url signature`.
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

/// Why a PDU could not be turned into an [`Event`].
#[derive(Debug, thiserror::Error)]
pub enum EventFormatError {
    #[error("PDU is not a valid event: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("declared event ID '{declared}' does not match content hash '{computed}'")]
    HashMismatch { declared: String, computed: String },
}

impl Event {
    /// Parse a wire PDU. A missing `event_id` is derived from the content
    /// hash; a present one must match it.
    pub fn from_pdu(pdu: Value) -> Result<Self, EventFormatError> {
        let mut event: Event = serde_json::from_value(pdu)?;
        let computed = event.compute_event_id()?;
        if event.event_id.is_empty() {
            event.event_id = computed;
        } else if event.event_id != computed {
            return Err(EventFormatError::HashMismatch { declared: event.event_id, computed });
        }
        Ok(event)
    }

    /// The canonical JSON that is hashed and signed.
    pub fn signing_json(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        strip_unhashed(&mut value);
        Ok(canonical_json(&value))
    }

    /// Canonical JSON of the whole event, signatures included. Two copies of
    /// an event are byte-identical iff these strings are equal.
    pub fn canonical_bytes(&self) -> Result<String, serde_json::Error> {
        Ok(canonical_json(&serde_json::to_value(self)?))
    }

    pub fn compute_event_id(&self) -> Result<String, serde_json::Error> {
        Ok(format!("${}", sha256_b64(self.signing_json()?.as_bytes())))
    }

    /// Set `event_id` from the content hash. Call after every field that
    /// takes part in the hash is final.
    pub fn seal(&mut self) -> Result<(), serde_json::Error> {
        self.event_id = self.compute_event_id()?;
        Ok(())
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn state_slot(&self) -> Option<StateKey> {
        self.state_key.as_ref().map(|sk| StateKey::new(self.event_type.clone(), sk.clone()))
    }

    pub fn is_type(&self, kind: &str) -> bool {
        self.event_type == kind
    }

    /// Server that created (and must have signed) this event.
    pub fn origin(&self) -> Option<&str> {
        ids::server_name_of(&self.sender)
    }

    /// `content.membership` for member events.
    pub fn membership(&self) -> Option<Membership> {
        if !self.is_type(kinds::MEMBER) {
            return None;
        }
        self.content.get("membership").and_then(Value::as_str).and_then(Membership::parse)
    }

    pub fn is_create(&self) -> bool {
        self.is_type(kinds::CREATE) && self.state_key.as_deref() == Some("")
    }
}
