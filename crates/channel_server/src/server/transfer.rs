//! Stage lifecycle and the transfer protocol.
//!
//! All stage mutation happens inside the stage's own lock; everything a peer
//! must be told about comes back out as data and is sent only after the lock
//! has been released.

use crate::error::ServerError;
use crate::server::packets::{StageDestruct, TransferComplete};
use crate::server::Server;
use crate::session::Session;
use crate::stage::{Stage, StageId};
use crate::stage_map::StoreOutcome;
use std::sync::Arc;
use tracing::{debug, info};

impl Server {
    /// Explicit stage creation.
    ///
    /// Atomically inserts only if no stage with that id exists; the loser of
    /// a create race gets [`ServerError::DuplicateStage`] rather than
    /// overwriting the first writer's stage.
    pub fn create_stage(
        &self,
        session: &Arc<Session>,
        id: StageId,
        max_players: u16,
    ) -> Result<Arc<Stage>, ServerError> {
        let stage = Arc::new(Stage::new(id.clone(), max_players));
        stage.set_host(Some(session.id));
        match self.stages().store_if_absent(stage) {
            StoreOutcome::Stored(stage) => {
                info!("Stage {} created by session {}", id, session.id);
                Ok(stage)
            }
            StoreOutcome::AlreadyExists(_) => Err(ServerError::DuplicateStage(id.0)),
        }
    }

    /// Moves a session into `dest`, creating the stage on first entry.
    ///
    /// The capacity check is evaluated before any shared state changes, so
    /// the transfer is deny/allow atomic; a session entering on its own
    /// reservation is never rejected by it. On success the transfer-
    /// completion packet is always enqueued, even when it has nothing to
    /// describe, because the client otherwise stalls waiting for the
    /// zone-change acknowledgment.
    pub async fn do_stage_transfer(
        &self,
        session: &Arc<Session>,
        dest: StageId,
    ) -> Result<(), ServerError> {
        let stage = self.stages().get_or_create(&dest, self.config().default_max_players);
        let char_id = session.char_id().unwrap_or(0);

        stage.try_add_client(session.id, char_id)?;

        // Leaving the previous stage releases its lock before any deletion
        // broadcasts go out. Re-entering the current stage skips the removal.
        let previous = session.state().stage_id.clone();
        if previous.as_ref() != Some(&dest) {
            self.leave_current_stage(session);
        }

        {
            let mut state = session.state();
            if let Some(previous) = previous.filter(|p| *p != dest) {
                state.stage_history.push(previous);
            }
            if state.reservation_stage_id.as_ref() == Some(&dest) {
                state.reservation_stage_id = None;
            }
            state.stage_id = Some(dest.clone());
        }

        let present_chars = stage
            .clients()
            .into_iter()
            .filter(|(sid, _)| *sid != session.id)
            .map(|(_, cid)| cid)
            .collect();
        session.queue_send(&TransferComplete { present_chars }).await?;
        debug!("Session {} transferred to stage {}", session.id, dest);
        Ok(())
    }

    /// Returns the session to its previously-visited stage; an empty history
    /// stack falls back to the configured home stage.
    pub async fn back_to_previous_stage(&self, session: &Arc<Session>) -> Result<(), ServerError> {
        // Peek rather than pop: a failed transfer must leave the history
        // intact so a retry targets the same stage.
        let dest = session
            .state()
            .stage_history
            .last()
            .cloned()
            .unwrap_or_else(|| self.config().home_stage_id.clone());
        self.do_stage_transfer(session, dest).await?;
        // The transfer pushed the stage we just left; drop it together with
        // the consumed history entry so "back" cannot bounce between the
        // same two stages forever.
        let mut state = session.state();
        state.stage_history.pop();
        state.stage_history.pop();
        Ok(())
    }

    /// Takes a soft claim on a slot in `stage_id` for the session.
    ///
    /// A session may hold at most one reservation at a time; re-reserving
    /// the stage it already holds only toggles the ready flag.
    pub fn reserve_stage(
        &self,
        session: &Arc<Session>,
        stage_id: &StageId,
        password: Option<&str>,
    ) -> Result<(), ServerError> {
        let char_id = session
            .char_id()
            .ok_or_else(|| ServerError::InvalidReservation("session has no character".into()))?;
        let stage = self
            .stages()
            .get(stage_id)
            .ok_or_else(|| ServerError::InvalidReservation(format!("no such stage {stage_id}")))?;

        let held = session.state().reservation_stage_id.clone();
        if let Some(held) = held {
            if held != *stage_id {
                return Err(ServerError::InvalidReservation(format!(
                    "session already holds a reservation on {held}"
                )));
            }
        }

        let newly_reserved = stage.reserve(char_id, password)?;
        if newly_reserved {
            session.state().reservation_stage_id = Some(stage_id.clone());
        }
        Ok(())
    }

    /// Drops the session's reservation, if it holds one.
    pub fn cancel_stage_reservation(&self, session: &Arc<Session>) {
        let Some(stage_id) = session.state().reservation_stage_id.take() else {
            return;
        };
        let Some(char_id) = session.char_id() else {
            return;
        };
        if let Some(stage) = self.stages().get(&stage_id) {
            stage.cancel_reservation(char_id);
        }
    }

    /// Unlocks a stage held via reservations: every reserved member is told
    /// to destruct its local stage view, and the stage is deleted.
    pub async fn unlock_stage(&self, stage_id: &StageId) {
        let Some(stage) = self.stages().get(stage_id) else {
            return;
        };
        let evicted = stage.take_reservations();
        stage.set_locked(false);

        // Notifications go out after the stage lock has been released.
        for char_id in evicted {
            let Some(session) = self.find_session_by_char_id(char_id) else {
                continue;
            };
            session.state().reservation_stage_id = None;
            let notice = StageDestruct { stage_id: stage_id.0.clone() };
            if let Err(e) = session.queue_send(&notice).await {
                debug!("Destruct notice to char {} failed: {}", char_id, e);
            }
        }

        self.stages().remove(stage_id);
        info!("Stage {} unlocked and deleted", stage_id);
    }
}
