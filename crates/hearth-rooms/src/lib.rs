//! # hearth-rooms
//!
//! The room event graph: auth rules, state resolution and the DAG manager
//! that accepts events into rooms.

pub mod auth;
pub mod dag;
pub mod locks;
pub mod outliers;
pub mod power_levels;
pub mod room_version;
pub mod snapshots;
pub mod state_res;

#[cfg(test)]
mod fixtures;

pub use auth::{AuthVerdict, RejectReason, check_auth, check_rules};
pub use dag::{
    BackfillHook, DagConfig, DagError, EventSigner, EventTemplate, Origin, OutboundSink, Outcome,
    RoomDag, Submission,
};
pub use room_version::{AuthPowerPolicy, RoomVersion};
pub use state_res::{EventMap, ResolveError, StateResolver};
