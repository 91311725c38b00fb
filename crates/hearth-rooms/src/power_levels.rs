//! `m.room.power_levels` content and the fallback used before one exists.

use std::collections::BTreeMap;

use hearth_common::{
    StateEvents, StateKey,
    event::{Event, kinds},
};
use serde_json::Value;

pub const CREATOR_LEVEL: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerLevels {
    pub users: BTreeMap<String, i64>,
    pub users_default: i64,
    pub events: BTreeMap<String, i64>,
    pub events_default: i64,
    pub state_default: i64,
    pub invite: i64,
    pub kick: i64,
    pub ban: i64,
    pub redact: i64,
}

/// Top-level thresholds, by content key. Used by the escalation rules.
pub const THRESHOLDS: [&str; 7] =
    ["users_default", "events_default", "state_default", "invite", "kick", "ban", "redact"];

impl PowerLevels {
    /// Levels in effect while a room has no power-levels event: the creator
    /// holds 100, everyone else 0.
    pub fn fallback(creator: Option<&str>) -> Self {
        let users = creator.map(|c| (c.to_owned(), CREATOR_LEVEL)).into_iter().collect();
        Self {
            users,
            users_default: 0,
            events: BTreeMap::new(),
            events_default: 0,
            state_default: 50,
            invite: 0,
            kick: 50,
            ban: 50,
            redact: 50,
        }
    }

    /// Parse event content. Missing fields take their fallback value; fields
    /// that are present but not integers make the whole content invalid.
    pub fn from_content(content: &Value) -> Result<Self, String> {
        let obj = content.as_object().ok_or("power levels content is not an object")?;
        let base = Self::fallback(None);

        let level = |key: &str, default: i64| -> Result<i64, String> {
            match obj.get(key) {
                None => Ok(default),
                Some(v) => v.as_i64().ok_or_else(|| format!("'{key}' is not an integer")),
            }
        };
        let map = |key: &str| -> Result<BTreeMap<String, i64>, String> {
            match obj.get(key) {
                None => Ok(BTreeMap::new()),
                Some(Value::Object(m)) => m
                    .iter()
                    .map(|(k, v)| {
                        v.as_i64()
                            .map(|l| (k.clone(), l))
                            .ok_or_else(|| format!("'{key}.{k}' is not an integer"))
                    })
                    .collect(),
                Some(_) => Err(format!("'{key}' is not an object")),
            }
        };

        Ok(Self {
            users: map("users")?,
            users_default: level("users_default", base.users_default)?,
            events: map("events")?,
            events_default: level("events_default", base.events_default)?,
            state_default: level("state_default", base.state_default)?,
            invite: level("invite", base.invite)?,
            kick: level("kick", base.kick)?,
            ban: level("ban", base.ban)?,
            redact: level("redact", base.redact)?,
        })
    }

    /// Levels in effect for `state`. Unparseable content is treated like a
    /// missing event.
    pub fn from_state(state: &StateEvents) -> Self {
        let pl = state.get(&StateKey::new(kinds::POWER_LEVELS, ""));
        match pl.map(|ev| Self::from_content(&ev.content)) {
            Some(Ok(levels)) => levels,
            _ => Self::fallback(state.get(&StateKey::new(kinds::CREATE, "")).map(|c| creator_of(c))),
        }
    }

    pub fn user_level(&self, user_id: &str) -> i64 {
        self.users.get(user_id).copied().unwrap_or(self.users_default)
    }

    /// Level needed to send an event of `event_type`.
    pub fn event_level(&self, event_type: &str, is_state: bool) -> i64 {
        self.events.get(event_type).copied().unwrap_or(if is_state {
            self.state_default
        } else {
            self.events_default
        })
    }

    pub fn threshold(&self, key: &str) -> Option<i64> {
        Some(match key {
            "users_default" => self.users_default,
            "events_default" => self.events_default,
            "state_default" => self.state_default,
            "invite" => self.invite,
            "kick" => self.kick,
            "ban" => self.ban,
            "redact" => self.redact,
            _ => return None,
        })
    }
}

/// `content.creator` of a create event, else its sender.
pub fn creator_of(create: &Event) -> &str {
    create.content.get("creator").and_then(Value::as_str).unwrap_or(&create.sender)
}
