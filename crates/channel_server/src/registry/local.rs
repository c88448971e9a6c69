//! In-process registry over a slice of shard instances.

use crate::registry::{ChannelRegistry, SessionSnapshot, StageSnapshot};
use crate::server::Server;
use channel_protocol::PacketBuild;
use std::sync::Arc;
use tracing::debug;

/// Registry implementation that iterates in-process shards directly.
///
/// A shard that has been shut down is skipped by every operation, so its
/// sessions and stages are invisible the moment `shutdown()` runs.
pub struct LocalRegistry {
    shards: Vec<Arc<Server>>,
}

impl LocalRegistry {
    /// Wraps the given shard set.
    pub fn new(shards: Vec<Arc<Server>>) -> Self {
        Self { shards }
    }

    fn live_shards(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.shards.iter().filter(|shard| !shard.is_shut_down())
    }
}

impl ChannelRegistry for LocalRegistry {
    fn worldcast(&self, packet: &dyn PacketBuild, except: Option<&str>) {
        for shard in self.live_shards() {
            if Some(shard.config().name.as_str()) == except {
                continue;
            }
            shard.broadcast(packet, None);
        }
    }

    fn find_session_by_char_id(&self, char_id: u32) -> Option<SessionSnapshot> {
        for shard in self.live_shards() {
            if let Some(session) = shard.find_session_by_char_id(char_id) {
                return SessionSnapshot::capture(shard, &session);
            }
        }
        None
    }

    fn disconnect_user(&self, char_id: u32) -> bool {
        for shard in self.live_shards() {
            if let Some(session) = shard.find_session_by_char_id(char_id) {
                debug!("Disconnecting char {} on shard {}", char_id, shard.config().name);
                session.close();
                return true;
            }
        }
        false
    }

    fn find_channel_for_stage(&self, stage_suffix: &str) -> Option<String> {
        for shard in self.live_shards() {
            let matched = shard
                .stages()
                .ids()
                .into_iter()
                .any(|id| id.0.ends_with(stage_suffix));
            if matched {
                return Some(shard.config().public_addr.clone());
            }
        }
        None
    }

    fn search_sessions(
        &self,
        filter: &dyn Fn(&SessionSnapshot) -> bool,
        max: usize,
    ) -> Vec<SessionSnapshot> {
        let mut results = Vec::new();
        for shard in self.live_shards() {
            for session in shard.sessions_snapshot() {
                if results.len() >= max {
                    return results;
                }
                if let Some(snapshot) = SessionSnapshot::capture(shard, &session) {
                    if filter(&snapshot) {
                        results.push(snapshot);
                    }
                }
            }
        }
        results
    }

    fn search_stages(&self, prefix: &str, max: usize) -> Vec<StageSnapshot> {
        let mut results = Vec::new();
        for shard in self.live_shards() {
            let mut ids = shard.stages().ids();
            ids.sort();
            for id in ids {
                if results.len() >= max {
                    return results;
                }
                if !id.0.starts_with(prefix) {
                    continue;
                }
                if let Some(stage) = shard.stages().get(&id) {
                    results.push(StageSnapshot::capture(shard, &stage));
                }
            }
        }
        results
    }

    fn notify_mail(&self, char_id: u32) -> bool {
        use crate::server::packets::MailNotice;
        for shard in self.live_shards() {
            if let Some(session) = shard.find_session_by_char_id(char_id) {
                return session.queue_send_nonblock(&MailNotice);
            }
        }
        false
    }
}
