//! Semaphores: named coordination groups for world events.
//!
//! A semaphore is both a mutual-exclusion gate (first acquirer becomes host,
//! membership tracks participants) and, for the raid/siege event, the access
//! path to a shard-level shared-counter block whose deltas auto-scale with
//! the participating population.
//!
//! The semaphore-set lock is the lowest-ranked lock in the shard: routines
//! holding it never acquire server or stage locks.

use crate::session::SessionId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Number of slots in each shared counter array.
pub const COUNTER_SLOTS: usize = 30;

/// Register slot holding the population-scaling base for the raid multiplier.
pub const SCALE_BASE_SLOT: usize = 0;

/// State slots that carry status-effect-style values and must never be
/// scaled by the raid multiplier.
pub const UNSCALED_STATE_SLOTS: [usize; 2] = [28, 29];

/// Which of the three shared counter arrays a write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Register,
    State,
    Support,
}

/// Write semantics for a counter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOp {
    /// Overwrite the slot; never scaled
    Set,
    /// Add to the slot; scaled by the raid multiplier on the state array
    Increment,
}

#[derive(Debug, Default)]
struct SemaphoreInner {
    host_session: Option<SessionId>,
    members: HashSet<SessionId>,
}

/// A named coordination group with a host session and a member set.
///
/// Created on first acquire; destroyed by the owning [`SemaphoreSet`] when
/// its member set empties.
pub struct Semaphore {
    /// Numeric id assigned by the owning set
    pub id: u32,
    /// Lookup/locking key; event type is encoded by prefix/suffix convention
    pub key: String,
    inner: Mutex<SemaphoreInner>,
}

impl Semaphore {
    fn new(id: u32, key: String) -> Self {
        Self { id, key, inner: Mutex::new(SemaphoreInner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `session` to the member set. The first acquirer becomes host.
    /// Returns `true` if this call made the session the host.
    pub fn acquire(&self, session: SessionId) -> bool {
        let mut inner = self.lock();
        inner.members.insert(session);
        if inner.host_session.is_none() {
            inner.host_session = Some(session);
            true
        } else {
            false
        }
    }

    /// Removes `session` from the member set, reassigning the host slot to an
    /// arbitrary remaining member. Returns `true` once the set is empty.
    pub fn release(&self, session: SessionId) -> bool {
        let mut inner = self.lock();
        inner.members.remove(&session);
        if inner.host_session == Some(session) {
            inner.host_session = inner.members.iter().next().copied();
        }
        inner.members.is_empty()
    }

    /// The current host session, if any.
    pub fn host(&self) -> Option<SessionId> {
        self.lock().host_session
    }

    /// Whether `session` currently participates in this semaphore.
    pub fn contains(&self, session: SessionId) -> bool {
        self.lock().members.contains(&session)
    }

    /// Number of participating sessions.
    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }
}

/// Shard-level shared raid counters.
///
/// Outlives the individual semaphores that gate access to it; the generation
/// id lets late broadcasts distinguish stale data from the current event.
#[derive(Debug)]
pub struct RaidState {
    register: [u32; COUNTER_SLOTS],
    state: [u32; COUNTER_SLOTS],
    support: [u32; COUNTER_SLOTS],
    generation: u32,
}

impl Default for RaidState {
    fn default() -> Self {
        Self {
            register: [0; COUNTER_SLOTS],
            state: [0; COUNTER_SLOTS],
            support: [0; COUNTER_SLOTS],
            generation: 0,
        }
    }
}

impl RaidState {
    fn array(&mut self, kind: CounterKind) -> &mut [u32; COUNTER_SLOTS] {
        match kind {
            CounterKind::Register => &mut self.register,
            CounterKind::State => &mut self.state,
            CounterKind::Support => &mut self.support,
        }
    }

    /// Applies a write to one slot. `multiplier` scales increments to the
    /// state array, except for the exempt status-effect slots.
    fn apply(&mut self, kind: CounterKind, slot: usize, op: CounterOp, value: u32, multiplier: u32) {
        if slot >= COUNTER_SLOTS {
            return;
        }
        let scaled = match (kind, op) {
            (CounterKind::State, CounterOp::Increment) if !UNSCALED_STATE_SLOTS.contains(&slot) => {
                value.saturating_mul(multiplier)
            }
            _ => value,
        };
        let cell = &mut self.array(kind)[slot];
        *cell = match op {
            CounterOp::Set => scaled,
            CounterOp::Increment => cell.saturating_add(scaled),
        };
    }

    fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.register = [0; COUNTER_SLOTS];
        self.state = [0; COUNTER_SLOTS];
        self.support = [0; COUNTER_SLOTS];
    }
}

#[derive(Default)]
struct SemaphoreSetInner {
    semaphores: HashMap<String, Arc<Semaphore>>,
    next_id: u32,
}

/// The shard's semaphore collection plus the shared raid counters.
#[derive(Default)]
pub struct SemaphoreSet {
    inner: Mutex<SemaphoreSetInner>,
    raid: Mutex<RaidState>,
}

impl SemaphoreSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreSetInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn raid_lock(&self) -> MutexGuard<'_, RaidState> {
        self.raid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires the semaphore named `key` for `session`, creating it on first
    /// acquire. The first acquirer becomes host.
    pub fn acquire(&self, key: &str, session: SessionId) -> Arc<Semaphore> {
        let semaphore = {
            let mut inner = self.lock();
            if let Some(existing) = inner.semaphores.get(key) {
                existing.clone()
            } else {
                inner.next_id += 1;
                let created = Arc::new(Semaphore::new(inner.next_id, key.to_string()));
                inner.semaphores.insert(key.to_string(), created.clone());
                debug!("Created semaphore {} ({})", key, created.id);
                created
            }
        };
        semaphore.acquire(session);
        semaphore
    }

    /// Releases `session` from the semaphore named `key`, destroying the
    /// semaphore once its member set empties. Returns `true` if it was
    /// destroyed.
    pub fn release(&self, key: &str, session: SessionId) -> bool {
        let mut inner = self.lock();
        let destroyed = match inner.semaphores.get(key) {
            Some(semaphore) => semaphore.release(session),
            None => return false,
        };
        if destroyed {
            inner.semaphores.remove(key);
            debug!("Destroyed semaphore {}", key);
        }
        destroyed
    }

    /// The semaphore stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<Semaphore>> {
        self.lock().semaphores.get(key).cloned()
    }

    /// Whether `session` participates in any semaphore in the set.
    pub fn has_session(&self, session: SessionId) -> bool {
        self.lock().semaphores.values().any(|s| s.contains(session))
    }

    /// Membership-scaled delta applied through the semaphore gating the raid.
    ///
    /// The multiplier is `members / scale_base` (at least 1), with the scale
    /// base read from the designated register slot; `Set` writes and the
    /// exempt state slots bypass it.
    pub fn apply_raid_delta(
        &self,
        semaphore: &Semaphore,
        kind: CounterKind,
        slot: usize,
        op: CounterOp,
        value: u32,
    ) {
        let mut raid = self.raid_lock();
        let scale_base = raid.register[SCALE_BASE_SLOT];
        let multiplier = if scale_base == 0 {
            1
        } else {
            ((semaphore.member_count() as u32) / scale_base).max(1)
        };
        raid.apply(kind, slot, op, value, multiplier);
    }

    /// Copy of one counter array plus the current generation id.
    pub fn raid_counters(&self, kind: CounterKind) -> ([u32; COUNTER_SLOTS], u32) {
        let mut raid = self.raid_lock();
        let generation = raid.generation;
        (*raid.array(kind), generation)
    }

    /// Resets the raid counters, but only when no semaphore whose key starts
    /// with `prefix` remains. Bumps the generation id so late broadcasts can
    /// recognize stale data. Returns `true` if the reset happened.
    pub fn reset_raid_if_clear(&self, prefix: &str) -> bool {
        let inner = self.lock();
        if inner.semaphores.keys().any(|k| k.starts_with(prefix)) {
            return false;
        }
        self.raid_lock().reset();
        info!("Raid counters reset (no '{}' semaphores remain)", prefix);
        true
    }

    /// Number of live semaphores.
    pub fn len(&self) -> usize {
        self.lock().semaphores.len()
    }

    /// Whether the set holds no semaphores.
    pub fn is_empty(&self) -> bool {
        self.lock().semaphores.is_empty()
    }
}
