//! Stage: a shared room/zone, the unit of client grouping and object ownership.
//!
//! A stage owns its client set, spawned-object table, reservation table,
//! lock/password gate, and the raw keyed binary blobs clients exchange through
//! it. All of that lives behind a single read-write lock that is never held
//! across an await point: mutating operations return the data the caller needs
//! for cross-session notifications, and the caller broadcasts only after the
//! lock is released.

use crate::error::ServerError;
use crate::session::SessionId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Stable string identifier of a stage.
///
/// Character positions 3-4 encode the room type consumed by cleanup and
/// enumeration logic. Handlers outside the core rely on this convention, so
/// it is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub String);

/// Room type extracted from a stage id's discriminator characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomType {
    /// Quest room, garbage-collected when empty
    Quest,
    /// My-series (house) room, garbage-collected when empty
    MySeries,
    /// Guild room, garbage-collected when empty
    Guild,
    /// Lobby room, garbage-collected when empty
    Lobby,
    /// Persistent world room, never auto-destroyed
    World,
}

impl StageId {
    /// Room-type discriminator at character positions 3-4 of the id.
    pub fn room_type(&self) -> RoomType {
        match self.0.get(3..5) {
            Some("Qs") => RoomType::Quest,
            Some("Ms") => RoomType::MySeries,
            Some("Gs") => RoomType::Guild,
            Some("Ls") => RoomType::Lobby,
            _ => RoomType::World,
        }
    }

    /// Whether this stage may be garbage-collected once empty.
    pub fn is_transient(&self) -> bool {
        self.room_type() != RoomType::World
    }

    /// String view of the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A spawned object owned by exactly one stage.
///
/// Deleted when its owning character leaves that stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Object {
    /// Object id, unique within the owning stage
    pub id: u32,
    /// Character that spawned the object
    pub owner_char_id: u32,
    /// Spatial coordinates
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Result of removing a client from a stage, returned so the caller can issue
/// deletion notifications after the stage lock is released.
#[derive(Debug, Default)]
pub struct ClientRemoval {
    /// Character id the removed session was registered under, if any
    pub char_id: Option<u32>,
    /// Objects deleted because their owner left
    pub deleted_objects: Vec<Object>,
    /// Sessions still in the stage that should be told about the deletions
    pub remaining: Vec<SessionId>,
}

#[derive(Debug, Default)]
struct StageInner {
    host_session: Option<SessionId>,
    max_players: u16,
    clients: HashMap<SessionId, u32>,
    objects: HashMap<u32, Object>,
    /// Reserved slots: character id -> ready flag
    reserved: HashMap<u32, bool>,
    locked: bool,
    password: Option<String>,
    binaries: HashMap<(u8, u8), Vec<u8>>,
    next_object_id: u32,
}

/// A shared room guarded by a read-write lock.
pub struct Stage {
    /// Stable identifier; the room-type discriminator lives in here
    pub id: StageId,
    inner: RwLock<StageInner>,
}

impl Stage {
    /// Creates an empty stage with the given capacity.
    pub fn new(id: StageId, max_players: u16) -> Self {
        Self {
            id,
            inner: RwLock::new(StageInner {
                max_players,
                next_object_id: 1,
                ..StageInner::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StageInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StageInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `session` as a client, enforcing capacity atomically.
    ///
    /// The capacity check counts reserved slots as occupied, except that a
    /// session entering on its own reservation consumes the reservation
    /// instead of being counted against it. A session already in the client
    /// set is re-admitted without a capacity check; it must not count its own
    /// slot against itself.
    pub fn try_add_client(&self, session: SessionId, char_id: u32) -> Result<(), ServerError> {
        let mut inner = self.write();
        if inner.reserved.contains_key(&char_id) {
            inner.reserved.remove(&char_id);
        } else if !inner.clients.contains_key(&session)
            && inner.max_players > 0
            && inner.clients.len() + inner.reserved.len() >= inner.max_players as usize
        {
            return Err(ServerError::StageFull(self.id.0.clone()));
        }
        inner.clients.insert(session, char_id);
        Ok(())
    }

    /// Removes `session` from the client set, deleting the objects its
    /// character owned. The returned [`ClientRemoval`] carries everything the
    /// caller needs to notify the remaining clients after the lock drops.
    pub fn remove_client(&self, session: SessionId) -> ClientRemoval {
        let mut inner = self.write();
        let char_id = inner.clients.remove(&session);
        let mut removal = ClientRemoval { char_id, ..ClientRemoval::default() };
        if let Some(char_id) = char_id {
            inner.objects.retain(|_, obj| {
                if obj.owner_char_id == char_id {
                    removal.deleted_objects.push(*obj);
                    false
                } else {
                    true
                }
            });
        }
        if inner.host_session == Some(session) {
            inner.host_session = None;
        }
        removal.remaining = inner.clients.keys().copied().collect();
        removal
    }

    /// Takes a soft claim on a slot for `char_id`.
    ///
    /// Denied if the stage is locked, the password does not match, or the
    /// stage is at capacity. Re-reserving an already-held slot only toggles
    /// the ready flag. Returns `true` for a new reservation, `false` for a
    /// ready-flag toggle.
    pub fn reserve(&self, char_id: u32, password: Option<&str>) -> Result<bool, ServerError> {
        let mut inner = self.write();
        if let Some(ready) = inner.reserved.get_mut(&char_id) {
            *ready = !*ready;
            return Ok(false);
        }
        if inner.locked {
            return Err(ServerError::StageLocked(self.id.0.clone()));
        }
        if let Some(expected) = &inner.password {
            if password != Some(expected.as_str()) {
                return Err(ServerError::BadPassword(self.id.0.clone()));
            }
        }
        if inner.max_players > 0
            && inner.clients.len() + inner.reserved.len() >= inner.max_players as usize
        {
            return Err(ServerError::StageFull(self.id.0.clone()));
        }
        inner.reserved.insert(char_id, false);
        Ok(true)
    }

    /// Drops `char_id`'s reservation if one exists.
    pub fn cancel_reservation(&self, char_id: u32) -> bool {
        self.write().reserved.remove(&char_id).is_some()
    }

    /// Flips the lock gate checked by future reservations.
    pub fn set_locked(&self, locked: bool) {
        self.write().locked = locked;
    }

    /// Sets or clears the reservation password.
    pub fn set_password(&self, password: Option<String>) {
        self.write().password = password;
    }

    /// Clears every reserved slot, returning the evicted character ids so the
    /// caller can tell each one to destruct its local stage view.
    pub fn take_reservations(&self) -> Vec<u32> {
        self.write().reserved.drain().map(|(char_id, _)| char_id).collect()
    }

    /// Spawns an object owned by `owner_char_id` and returns a copy of it.
    pub fn spawn_object(&self, owner_char_id: u32, x: f32, y: f32, z: f32) -> Object {
        let mut inner = self.write();
        let id = inner.next_object_id;
        inner.next_object_id += 1;
        let obj = Object { id, owner_char_id, x, y, z };
        inner.objects.insert(id, obj);
        obj
    }

    /// Copy of the object owned by `char_id`, if any.
    pub fn object_by_char(&self, char_id: u32) -> Option<Object> {
        self.read().objects.values().find(|o| o.owner_char_id == char_id).copied()
    }

    /// Stores a raw binary blob under a `(category, subtype)` key.
    pub fn set_binary(&self, key: (u8, u8), data: Vec<u8>) {
        self.write().binaries.insert(key, data);
    }

    /// Copy of the blob stored under `key`, if any.
    pub fn get_binary(&self, key: (u8, u8)) -> Option<Vec<u8>> {
        self.read().binaries.get(&key).cloned()
    }

    /// Bounded poll for a blob another client is expected to produce.
    ///
    /// Retries up to `retries` times, sleeping `interval` between attempts,
    /// and returns an empty buffer if the blob never appears.
    pub async fn wait_binary(&self, key: (u8, u8), retries: u32, interval: Duration) -> Vec<u8> {
        for _ in 0..retries {
            if let Some(data) = self.get_binary(key) {
                return data;
            }
            tokio::time::sleep(interval).await;
        }
        self.get_binary(key).unwrap_or_default()
    }

    /// Records the hosting session, set by the stage's creator.
    pub fn set_host(&self, session: Option<SessionId>) {
        self.write().host_session = session;
    }

    /// The hosting session, if one is set.
    pub fn host(&self) -> Option<SessionId> {
        self.read().host_session
    }

    /// Whether both the client set and the reserved-slot set are empty.
    pub fn is_empty(&self) -> bool {
        let inner = self.read();
        inner.clients.is_empty() && inner.reserved.is_empty()
    }

    /// Whether clients plus reserved slots have reached capacity. A capacity
    /// of 0 means unlimited.
    pub fn is_full(&self) -> bool {
        let inner = self.read();
        inner.max_players > 0
            && inner.clients.len() + inner.reserved.len() >= inner.max_players as usize
    }

    /// Whether the lock gate is currently closed.
    pub fn is_locked(&self) -> bool {
        self.read().locked
    }

    /// Configured capacity.
    pub fn max_players(&self) -> u16 {
        self.read().max_players
    }

    /// Snapshot of the current client set as `(session, char_id)` pairs.
    pub fn clients(&self) -> Vec<(SessionId, u32)> {
        let inner = self.read();
        inner.clients.iter().map(|(s, c)| (*s, *c)).collect()
    }

    /// Number of connected clients (reservations not included).
    pub fn client_count(&self) -> usize {
        self.read().clients.len()
    }

    /// Number of reserved slots.
    pub fn reservation_count(&self) -> usize {
        self.read().reserved.len()
    }

    /// Copies of all stored binary blobs; used to build stage snapshots.
    pub fn binaries(&self) -> HashMap<(u8, u8), Vec<u8>> {
        self.read().binaries.clone()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("clients", &inner.clients.len())
            .field("reserved", &inner.reserved.len())
            .field("locked", &inner.locked)
            .finish()
    }
}
