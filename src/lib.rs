//! swiftlet — an XMPP client core.
//!
//! This crate turns a byte transport (optionally wrapped in TLS) into
//! semantic XMPP events and keeps the client-side view of the world up to
//! date: the roster with per-contact resources and presence, entity
//! capabilities, pending subscription requests, and message carbons state.
//!
//! The terminal UI, command parser, history store and module loader are
//! external consumers; they observe the core through [`hooks`] and drive it
//! through [`xmpp::client::Client`] commands.

pub mod backoff;
pub mod caps;
pub mod config;
pub mod events;
pub mod hooks;
pub mod jid;
pub mod roster;
pub mod xmpp;

pub use config::Config;
pub use jid::Jid;
pub use roster::Roster;
