//! Protocol layer for the chat server
//!
//! This module provides:
//! - The closed event-kind set and per-boundary whitelists
//! - The wire-stable JSON event type
//! - Body sanitisation helpers

pub mod event;

// Re-export commonly used types
pub use event::{ChatEvent, EventKind, escape_body};
