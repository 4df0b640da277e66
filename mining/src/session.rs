/// Session store for live mining sessions
///
/// Manages:
/// - At most one session per user (atomic check-and-set insert)
/// - Claiming a session for stop/completion so only one of them wins
/// - Snapshots for the durable mirror and bulk reload at startup

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::UserId;

/// One in-progress mining attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningSession {
    pub started_at: DateTime<Utc>,
    pub block_number: u64,
    pub hashrate: u64,
    /// Energy debited when the session started; never refunded
    pub energy_reserved: f64,
}

impl MiningSession {
    pub fn completes_at(&self, block_time_ms: u64) -> DateTime<Utc> {
        self.started_at + Duration::milliseconds(block_time_ms as i64)
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_milliseconds().max(0)
    }

    pub fn is_due(&self, now: DateTime<Utc>, block_time_ms: u64) -> bool {
        self.elapsed_ms(now) >= block_time_ms as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Inserted, durable mirror not confirmed yet
    Starting,
    Active,
    /// Claimed by a stop or a completion that is in flight
    Settling,
}

#[derive(Debug, Clone)]
struct Slot {
    session: MiningSession,
    phase: SessionPhase,
}

/// In-memory index of live sessions, keyed by user.
///
/// The map lock is held only for the duration of a single lookup or swap,
/// never across I/O, so unrelated users never wait on each other.
pub struct SessionStore {
    slots: RwLock<HashMap<UserId, Slot>>,
    dirty: AtomicBool,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Insert in `Starting` phase unless the user already has a slot.
    pub fn try_insert(&self, user_id: UserId, session: MiningSession) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(&user_id) {
            return false;
        }
        slots.insert(user_id, Slot { session, phase: SessionPhase::Starting });
        true
    }

    /// `Starting -> Active` once the session is durable.
    pub fn activate(&self, user_id: UserId) -> bool {
        self.transition(user_id, SessionPhase::Starting, SessionPhase::Active)
    }

    /// `Active -> Settling`. Returns the session to the single caller that
    /// won the claim; everyone else sees `None`.
    pub fn claim(&self, user_id: UserId) -> Option<MiningSession> {
        let mut slots = self.slots.write();
        match slots.get_mut(&user_id) {
            Some(slot) if slot.phase == SessionPhase::Active => {
                slot.phase = SessionPhase::Settling;
                Some(slot.session.clone())
            }
            _ => None,
        }
    }

    /// `Settling -> Active`, after a settle attempt failed.
    pub fn release(&self, user_id: UserId) -> bool {
        self.transition(user_id, SessionPhase::Settling, SessionPhase::Active)
    }

    pub fn remove(&self, user_id: UserId) -> Option<MiningSession> {
        self.slots.write().remove(&user_id).map(|slot| slot.session)
    }

    pub fn get(&self, user_id: UserId) -> Option<MiningSession> {
        self.slots.read().get(&user_id).map(|slot| slot.session.clone())
    }

    pub fn phase(&self, user_id: UserId) -> Option<SessionPhase> {
        self.slots.read().get(&user_id).map(|slot| slot.phase)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.slots.read().contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Users whose active session has run for at least `block_time_ms`.
    pub fn expired(&self, now: DateTime<Utc>, block_time_ms: u64) -> Vec<UserId> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.phase == SessionPhase::Active)
            .filter(|(_, slot)| slot.session.is_due(now, block_time_ms))
            .map(|(user_id, _)| *user_id)
            .collect()
    }

    /// Sessions that belong in the durable mirror.
    pub fn snapshot_all(&self) -> Vec<(UserId, MiningSession)> {
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.phase != SessionPhase::Starting)
            .map(|(user_id, slot)| (*user_id, slot.session.clone()))
            .collect()
    }

    /// Bulk-populate from durable rows.
    ///
    /// Fresh sessions come back `Active`. Sessions already past their block
    /// time are inserted `Settling` and returned, for the caller to push
    /// through completion. Users that already have a slot are skipped.
    pub fn load_all(
        &self,
        rows: Vec<(UserId, MiningSession)>,
        now: DateTime<Utc>,
        block_time_ms: u64,
    ) -> Vec<(UserId, MiningSession)> {
        let mut slots = self.slots.write();
        let mut stale = Vec::new();
        for (user_id, session) in rows {
            if slots.contains_key(&user_id) {
                continue;
            }
            let phase = if session.is_due(now, block_time_ms) {
                stale.push((user_id, session.clone()));
                SessionPhase::Settling
            } else {
                SessionPhase::Active
            };
            slots.insert(user_id, Slot { session, phase });
        }
        stale
    }

    /// Record that the durable mirror may have drifted from memory.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    fn transition(&self, user_id: UserId, from: SessionPhase, to: SessionPhase) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(&user_id) {
            Some(slot) if slot.phase == from => {
                slot.phase = to;
                true
            }
            _ => false,
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
