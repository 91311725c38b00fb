//! Room versions.
//!
//! A room version pins the rule set every server applies to a room. The only
//! knob that differs between versions today is how conflicted events are
//! weighted during state resolution, so that knob lives in a table here rather
//! than in the resolver.

use hearth_common::event::{Event, Membership, kinds};

/// How much "auth power" a conflicted event carries during state resolution.
///
/// `power = sender_level * sender_weight + control_bonus` where the bonus only
/// applies to control events (power levels, join rules, create, bans and kicks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPowerPolicy {
    pub sender_weight: i64,
    pub control_bonus: i64,
}

impl AuthPowerPolicy {
    pub fn power(&self, event: &Event, sender_level: i64) -> i64 {
        let bonus = if is_control_event(event) { self.control_bonus } else { 0 };
        sender_level.saturating_mul(self.sender_weight).saturating_add(bonus)
    }
}

/// Events that change who may do what in a room.
pub fn is_control_event(event: &Event) -> bool {
    if event.is_type(kinds::POWER_LEVELS) || event.is_type(kinds::JOIN_RULES) || event.is_create() {
        return true;
    }
    match event.membership() {
        Some(Membership::Ban) => true,
        Some(Membership::Leave) => event.state_key.as_deref() != Some(event.sender.as_str()),
        _ => false,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct RoomVersion {
    pub id: &'static str,
    pub auth_power: AuthPowerPolicy,
}

static V1: RoomVersion = RoomVersion {
    id: "1",
    auth_power: AuthPowerPolicy { sender_weight: 1, control_bonus: 0 },
};

static V2: RoomVersion = RoomVersion {
    id: "2",
    auth_power: AuthPowerPolicy { sender_weight: 1, control_bonus: 1000 },
};

static KNOWN: [&RoomVersion; 2] = [&V1, &V2];

impl RoomVersion {
    pub fn from_id(id: &str) -> Option<&'static RoomVersion> {
        KNOWN.iter().copied().find(|v| v.id == id)
    }

    pub fn latest() -> &'static RoomVersion {
        &V2
    }
}
