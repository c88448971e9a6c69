//! Cross-shard registry.
//!
//! The registry is the only way code outside a shard reaches another shard's
//! state. Every read returns copied, lock-free snapshots built while holding
//! the source lock and released before returning; every write takes explicit
//! target identifiers, never pointers, so the in-process implementation can
//! later be swapped for a distributed backend. Snapshot staleness is
//! acceptable: they feed search and display, never mutation.

pub mod local;
pub mod snapshot;

pub use local::LocalRegistry;
pub use snapshot::{SessionSnapshot, StageSnapshot};

use channel_protocol::PacketBuild;

/// An abstraction over "all shards in the world".
pub trait ChannelRegistry: Send + Sync {
    /// Fans `packet` out to every shard except `except`, identified by shard
    /// name.
    fn worldcast(&self, packet: &dyn PacketBuild, except: Option<&str>);

    /// Linear scan across shards for `char_id`, short-circuiting on the
    /// first match. Shut-down shards are invisible.
    fn find_session_by_char_id(&self, char_id: u32) -> Option<SessionSnapshot>;

    /// Closes the connection of the session bound to `char_id`, wherever it
    /// lives. Returns whether a session was found.
    fn disconnect_user(&self, char_id: u32) -> bool;

    /// Suffix-matches a stage id across all shards' stage tables and returns
    /// the owning shard's public address, or `None`.
    fn find_channel_for_stage(&self, stage_suffix: &str) -> Option<String>;

    /// Predicate-filtered scan over sessions, capped at `max` results.
    fn search_sessions(
        &self,
        filter: &dyn Fn(&SessionSnapshot) -> bool,
        max: usize,
    ) -> Vec<SessionSnapshot>;

    /// Prefix-filtered scan over stages, capped at `max` results.
    fn search_stages(&self, prefix: &str, max: usize) -> Vec<StageSnapshot>;

    /// Tells the session bound to `char_id` that mail is waiting. Returns
    /// whether the notice was enqueued.
    fn notify_mail(&self, char_id: u32) -> bool;
}
