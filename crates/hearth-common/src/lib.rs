//! # hearth-common
//!
//! Shared types, configuration, error handling, and utilities used across all Hearth crates.
//! This is the foundation layer: no room logic, just the event model and contracts.

pub mod canonical;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod state;

pub use error::{HearthError, HearthResult};
pub use event::Event;
pub use state::{StateEvents, StateKey, StateMap};
