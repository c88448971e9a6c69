//! Concurrent stage-id to stage storage.
//!
//! Backed by a sharded concurrent map so get-or-create and store-if-absent
//! are atomic: concurrent create attempts for one id yield exactly one winner
//! and every loser observes the winner's stage. The map manages its own
//! internal locking and may be touched at any point in the lock order.

use crate::stage::{Stage, StageId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrent associative storage of stage-id -> Stage.
#[derive(Default)]
pub struct StageMap {
    stages: DashMap<StageId, Arc<Stage>>,
}

/// Outcome of [`StageMap::store_if_absent`].
pub enum StoreOutcome {
    /// The caller's stage was inserted
    Stored(Arc<Stage>),
    /// A stage with this id already existed; here is the incumbent
    AlreadyExists(Arc<Stage>),
}

impl StageMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stage stored under `id`, if any.
    pub fn get(&self, id: &StageId) -> Option<Arc<Stage>> {
        self.stages.get(id).map(|entry| entry.value().clone())
    }

    /// Atomic get-or-create: returns the existing stage for `id` or inserts a
    /// fresh one with the given capacity.
    pub fn get_or_create(&self, id: &StageId, max_players: u16) -> Arc<Stage> {
        self.stages
            .entry(id.clone())
            .or_insert_with(|| {
                debug!("Creating stage {}", id);
                Arc::new(Stage::new(id.clone(), max_players))
            })
            .value()
            .clone()
    }

    /// Atomically inserts `stage` only if no stage with that id exists.
    ///
    /// The loser of a create race receives [`StoreOutcome::AlreadyExists`]
    /// with the first writer's stage rather than overwriting it.
    pub fn store_if_absent(&self, stage: Arc<Stage>) -> StoreOutcome {
        match self.stages.entry(stage.id.clone()) {
            Entry::Occupied(occupied) => StoreOutcome::AlreadyExists(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(stage.clone());
                StoreOutcome::Stored(stage)
            }
        }
    }

    /// Removes `id` from the map, returning the stage if it was present.
    pub fn remove(&self, id: &StageId) -> Option<Arc<Stage>> {
        self.stages.remove(id).map(|(_, stage)| stage)
    }

    /// Sweeps out transient stages whose client and reservation sets are both
    /// empty. Persistent world rooms are never collected. Returns the number
    /// of stages removed.
    pub fn sweep_empty(&self) -> usize {
        let before = self.stages.len();
        self.stages.retain(|id, stage| !(id.is_transient() && stage.is_empty()));
        before - self.stages.len()
    }

    /// Ids of all stored stages.
    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Runs `f` over every stored stage.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Stage>)) {
        for entry in self.stages.iter() {
            f(entry.value());
        }
    }

    /// Number of stored stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the map holds no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_same_stage() {
        let map = StageMap::new();
        let id = StageId::from("sl1Qs463p0a0u0");
        let a = map.get_or_create(&id, 4);
        let b = map.get_or_create(&id, 99);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.max_players(), 4, "second create must not overwrite");
    }

    #[test]
    fn store_if_absent_loser_observes_incumbent() {
        let map = StageMap::new();
        let id = StageId::from("sl1Qs463p0a0u0");
        let first = Arc::new(Stage::new(id.clone(), 4));
        let second = Arc::new(Stage::new(id.clone(), 8));

        assert!(matches!(map.store_if_absent(first.clone()), StoreOutcome::Stored(_)));
        match map.store_if_absent(second) {
            StoreOutcome::AlreadyExists(incumbent) => assert!(Arc::ptr_eq(&incumbent, &first)),
            StoreOutcome::Stored(_) => panic!("duplicate insert must lose"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_if_absent_race_has_exactly_one_winner() {
        let map = Arc::new(StageMap::new());
        let id = StageId::from("sl1Qs463p0a0u0");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let map = map.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let candidate = Arc::new(Stage::new(id, 4));
                matches!(map.store_if_absent(candidate), StoreOutcome::Stored(_))
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn sweep_collects_only_empty_transient_stages() {
        let map = StageMap::new();
        let quest = map.get_or_create(&StageId::from("sl1Qs463p0a0u0"), 4);
        map.get_or_create(&StageId::from("sl1Ls210p0a0u0"), 4);
        map.get_or_create(&StageId::from("sl1Ns200p0a0u0"), 0);

        // Occupied transient stages survive the sweep
        quest.try_add_client(1, 100).unwrap();
        assert_eq!(map.sweep_empty(), 1); // only the lobby goes
        assert!(map.get(&StageId::from("sl1Qs463p0a0u0")).is_some());

        quest.remove_client(1);
        assert_eq!(map.sweep_empty(), 1);
        // The persistent world room is never collected
        assert!(map.get(&StageId::from("sl1Ns200p0a0u0")).is_some());
        assert_eq!(map.len(), 1);
    }
}
