//! Identifier helpers.
//!
//! - users:  `@local:server.name`
//! - rooms:  `!opaque:server.name`
//! - events: `$<43 chars of unpadded base64url SHA-256>` (content-derived, no server part)

use base64::Engine as _;
use uuid::Uuid;

/// Length of an unpadded base64url SHA-256 digest.
const HASH_LEN: usize = 43;

/// Build a user ID from a localpart and server.
///
/// Example: `@alice:hearth.example.com`
pub fn user_id(local_part: &str, server_name: &str) -> String {
    format!("@{}:{}", local_part, server_name)
}

/// Generate a fresh room ID owned by `server_name`.
pub fn new_room_id(server_name: &str) -> String {
    let id = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes());
    format!("!{}:{}", id, server_name)
}

/// Server part of a sigil-prefixed identifier (`@a:srv` → `srv`).
pub fn server_name_of(id: &str) -> Option<&str> {
    let (_, rest) = id.split_at_checked(1)?;
    let (local, server) = rest.split_once(':')?;
    if local.is_empty() || !is_valid_server_name(server) {
        return None;
    }
    Some(server)
}

pub fn is_valid_user_id(id: &str) -> bool {
    id.starts_with('@') && server_name_of(id).is_some()
}

pub fn is_valid_room_id(id: &str) -> bool {
    id.starts_with('!') && server_name_of(id).is_some()
}

pub fn is_valid_event_id(id: &str) -> bool {
    match id.strip_prefix('$') {
        Some(hash) => {
            hash.len() == HASH_LEN
                && hash.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        }
        None => false,
    }
}

/// Hostname with an optional port. Deliberately loose: only rejects what can
/// never be routed.
pub fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':' | b'[' | b']'))
}
