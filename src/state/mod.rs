//! Entity types for the per-network state store.
//!
//! Servers, users, and channels reference each other by ID string only
//! (SIDs, UIDs, case-folded channel names); the maps that own them live
//! on the [`Network`](crate::net::Network). ID-only references keep
//! deletion atomic: removing an entity can never dangle a pointer, only
//! leave an ID that fails lookup.
//!
//! All three types serialize so hook payloads can carry by-value
//! snapshots of pre-change state.

mod channel;
mod server;
mod user;

pub use channel::Channel;
pub use server::Server;
pub use user::User;

/// A `(mode char, optional argument)` pair as stored on users/channels.
///
/// Stored without a direction sign: presence in the set means the mode
/// is set. List modes (`+b`) appear once per argument.
pub type StoredMode = (char, Option<String>);
