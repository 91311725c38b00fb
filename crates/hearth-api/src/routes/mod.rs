//! Route modules.

pub mod federation;
pub mod health;
