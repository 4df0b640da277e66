/// Mining engine
///
/// Owns the live session index and drives every per-user transition:
///
///   Idle --start--> Active --complete|stop--> Idle
///
/// Request handlers call `start_mining` / `stop_mining` / `get_status`;
/// the scheduler calls the sweep, regeneration and cleanup ticks. Both
/// paths go through the session store's claim discipline, so for a given
/// user exactly one competing transition wins.
///
/// Writes to the durable session mirror hold a shared `mirror` guard; a
/// full snapshot flush takes it exclusively so it never interleaves with
/// a half-finished transition.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::config::MiningConfig;
use crate::energy::{current_energy, EnergyState};
use crate::error::{MiningError, Result, StorageError, StoreResult};
use crate::metrics;
use crate::reward::{block_hash, BlockSequence, RewardGenerator};
use crate::scheduler::Scheduler;
use crate::session::{MiningSession, SessionStore};
use crate::store::{
    BlockFilter, CompletionEvent, CompletionNotifier, LeaderboardEntry, MinedBlock, MiningHistory,
    MiningStatsSnapshot, MiningStore, RecentBlock, StatusCache, UserTotals,
};
use crate::UserId;

/// Returned by a successful `start_mining`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartReceipt {
    pub block_number: u64,
    pub hashrate: u64,
    pub energy_used: f64,
    pub started_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyStatus {
    /// Floored for display
    pub current: u64,
    pub max: f64,
    pub regen_rate: f64,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningStatus {
    pub is_active: bool,
    pub hashrate: u64,
    pub current_block: Option<u64>,
    pub block_start_time: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    /// 0..=100
    pub progress: f64,
    pub time_remaining_ms: u64,
    pub blocks_mined: u64,
    pub total_rewards: u64,
    pub energy: EnergyStatus,
    pub miner_level: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub tokens_purged: u64,
    pub blocks_pruned: u64,
    pub locks_pruned: usize,
}

pub struct MiningEngine {
    config: MiningConfig,
    store: Arc<dyn MiningStore>,
    cache: Arc<dyn StatusCache>,
    notifier: Arc<dyn CompletionNotifier>,
    clock: Arc<dyn Clock>,
    sessions: SessionStore,
    blocks: BlockSequence,
    rewards: RewardGenerator,
    mirror: RwLock<()>,
    energy_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
    scheduler: tokio::sync::Mutex<Option<Scheduler>>,
}

impl MiningEngine {
    pub fn new(
        config: MiningConfig,
        store: Arc<dyn MiningStore>,
        cache: Arc<dyn StatusCache>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Self {
        let rewards = RewardGenerator::new(config.base_reward, config.treasury_fee_percent);
        Self {
            config,
            store,
            cache,
            notifier,
            clock: Arc::new(SystemClock),
            sessions: SessionStore::new(),
            blocks: BlockSequence::new(),
            rewards,
            mirror: RwLock::new(()),
            energy_locks: Mutex::new(HashMap::new()),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &MiningConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Reload durable sessions, settle the ones that expired while we were
    /// down, then arm the scheduler.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            tracing::warn!("Mining engine already initialized");
            return Ok(());
        }

        let rows = self.io(self.store.load_active_sessions()).await?;
        let loaded = rows.len();
        let stale = self.sessions.load_all(rows, self.clock.now(), self.config.block_time_ms);
        tracing::info!("Loaded {} active miners ({} expired while offline)", loaded, stale.len());

        for (user_id, session) in stale {
            let _mirror = self.mirror.read().await;
            match self.settle(user_id, session).await {
                Ok(block) => tracing::info!(
                    user_id,
                    block_number = block.block_number,
                    "Completed session recovered from storage"
                ),
                Err(e) => tracing::warn!(user_id, "Recovered session not settled yet: {}", e),
            }
        }
        metrics::set_active_sessions(self.sessions.len());

        *scheduler = Some(Scheduler::start(self));
        tracing::info!("Mining engine initialized");
        Ok(())
    }

    /// Stop the scheduler, then mirror every live session to durable storage.
    pub async fn shutdown(&self) -> Result<usize> {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }
        let saved = self.flush_sessions().await?;
        tracing::info!("Mining engine stopped, saved {} active miners", saved);
        Ok(saved)
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    // ── User-facing operations ─────────────────────────────────────────

    pub async fn start_mining(&self, user_id: UserId) -> Result<StartReceipt> {
        let result = self.try_start(user_id).await;
        match &result {
            Ok(receipt) => {
                metrics::inc_sessions_started();
                metrics::set_active_sessions(self.sessions.len());
                tracing::info!(
                    user_id,
                    block_number = receipt.block_number,
                    hashrate = receipt.hashrate,
                    energy_used = receipt.energy_used,
                    "Mining started"
                );
            }
            Err(e) => {
                metrics::inc_start_rejected();
                tracing::debug!(user_id, "Start rejected: {}", e);
            }
        }
        result
    }

    async fn try_start(&self, user_id: UserId) -> Result<StartReceipt> {
        if self.sessions.contains(user_id) {
            return Err(MiningError::AlreadyMining);
        }

        let profile = self
            .io(self.store.fetch_miner(user_id))
            .await?
            .filter(|p| p.is_active)
            .ok_or(MiningError::UserNotFound)?;

        let energy_lock = self.energy_lock(user_id);
        let _energy = energy_lock.lock().await;
        if self.sessions.contains(user_id) {
            return Err(MiningError::AlreadyMining);
        }

        let now = self.clock.now();
        let energy = self.io(self.cache.get_energy(user_id)).await?;
        let available = current_energy(energy.as_ref(), now, self.config.base_energy);
        let required = self.config.energy_required();
        if available < required {
            return Err(MiningError::InsufficientEnergy { required, available });
        }

        let hashrate = self.config.hashrate_for(profile.miner_level);
        let block_number = self.io(self.blocks.next(self.store.as_ref())).await?;
        let session = MiningSession {
            started_at: now,
            block_number,
            hashrate,
            energy_reserved: required,
        };

        let _mirror = self.mirror.read().await;
        if !self.sessions.try_insert(user_id, session.clone()) {
            return Err(MiningError::AlreadyMining);
        }

        let debited = EnergyState {
            current: (available - required).min(profile.energy_capacity),
            max: profile.energy_capacity,
            last_update: Some(now),
            regen_rate: energy.as_ref().map(|e| e.regen_rate).unwrap_or(self.config.energy_regen_rate),
        };
        if let Err(e) = self.persist_start(user_id, &session, &debited).await {
            self.sessions.remove(user_id);
            if let Err(cleanup) = self.io(self.store.delete_active_session(user_id)).await {
                tracing::warn!(user_id, "Rollback of active session record failed: {}", cleanup);
                self.sessions.mark_dirty();
            }
            return Err(e.into());
        }

        // Stats are written while the slot is still ours, so no stop or
        // completion can interleave its own snapshot.
        match self.counters(user_id).await {
            Ok(totals) => {
                let stats = MiningStatsSnapshot::active(&session, totals.blocks_mined, totals.total_rewards);
                self.update_stats(user_id, &stats).await;
            }
            Err(e) => tracing::warn!(user_id, "Mining stats not refreshed: {}", e),
        }
        self.sessions.activate(user_id);

        Ok(StartReceipt {
            block_number,
            hashrate,
            energy_used: required,
            started_at: now,
            estimated_completion: session.completes_at(self.config.block_time_ms),
        })
    }

    async fn persist_start(
        &self,
        user_id: UserId,
        session: &MiningSession,
        debited: &EnergyState,
    ) -> StoreResult<()> {
        self.io(self.store.upsert_active_session(user_id, session)).await?;
        self.io(self.cache.set_energy(user_id, debited)).await?;
        Ok(())
    }

    /// Abandon the current session. The energy it reserved is forfeited.
    pub async fn stop_mining(&self, user_id: UserId) -> Result<MiningSession> {
        let _mirror = self.mirror.read().await;
        let session = self.sessions.claim(user_id).ok_or(MiningError::NotMining)?;

        if let Err(e) = self.io(self.store.delete_active_session(user_id)).await {
            self.sessions.release(user_id);
            return Err(e.into());
        }

        match self.counters(user_id).await {
            Ok(totals) => self.update_stats(user_id, &MiningStatsSnapshot::idle(totals)).await,
            Err(e) => tracing::warn!(user_id, "Mining stats not reset: {}", e),
        }
        self.sessions.remove(user_id);

        metrics::inc_sessions_stopped();
        metrics::set_active_sessions(self.sessions.len());
        tracing::info!(
            user_id,
            block_number = session.block_number,
            energy_forfeited = session.energy_reserved,
            "Mining stopped"
        );
        Ok(session)
    }

    /// Read-only view of the user's mining state.
    pub async fn get_status(&self, user_id: UserId) -> Result<MiningStatus> {
        let now = self.clock.now();
        let session = self.sessions.get(user_id);
        let energy = self.energy_status(user_id).await?;
        let miner_level = self
            .io(self.store.fetch_miner(user_id))
            .await?
            .map(|p| p.miner_level)
            .unwrap_or(1);
        let totals = self.counters(user_id).await?;

        let block_time = self.config.block_time_ms;
        let (progress, time_remaining_ms) = match &session {
            Some(s) => {
                let elapsed = s.elapsed_ms(now) as f64;
                let progress = (elapsed / block_time as f64 * 100.0).min(100.0);
                let remaining = (block_time as f64 - elapsed).max(0.0) as u64;
                (progress, remaining)
            }
            None => (0.0, 0),
        };

        Ok(MiningStatus {
            is_active: session.is_some(),
            hashrate: session
                .as_ref()
                .map(|s| s.hashrate)
                .unwrap_or_else(|| self.config.hashrate_for(miner_level)),
            current_block: session.as_ref().map(|s| s.block_number),
            block_start_time: session.as_ref().map(|s| s.started_at),
            estimated_completion: session.as_ref().map(|s| s.completes_at(block_time)),
            progress,
            time_remaining_ms,
            blocks_mined: totals.blocks_mined,
            total_rewards: totals.total_rewards,
            energy,
            miner_level,
        })
    }

    pub async fn energy_status(&self, user_id: UserId) -> Result<EnergyStatus> {
        let state = self.io(self.cache.get_energy(user_id)).await?;
        let current = current_energy(state.as_ref(), self.clock.now(), self.config.base_energy);
        Ok(EnergyStatus {
            current: current.floor().max(0.0) as u64,
            max: state.as_ref().map(|s| s.max).unwrap_or(self.config.base_energy),
            regen_rate: state.as_ref().map(|s| s.regen_rate).unwrap_or(self.config.energy_regen_rate),
            last_update: state.and_then(|s| s.last_update),
        })
    }

    pub async fn get_leaderboard(&self, limit: u32) -> Result<Vec<LeaderboardEntry>> {
        Ok(self.io(self.store.leaderboard(limit.clamp(1, 100))).await?)
    }

    pub async fn mining_history(
        &self,
        user_id: UserId,
        filter: BlockFilter,
        page: u32,
        limit: u32,
    ) -> Result<MiningHistory> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        Ok(self.io(self.store.mining_history(user_id, filter, page, limit)).await?)
    }

    pub async fn recent_blocks(&self, limit: u32) -> Result<Vec<RecentBlock>> {
        Ok(self.io(self.store.recent_blocks(limit.clamp(1, 50))).await?)
    }

    /// Account deactivation: drop any live session without a reward and
    /// flush everything cached for the user. Returns whether a session was
    /// dropped.
    pub async fn deactivate_user(&self, user_id: UserId) -> Result<bool> {
        let dropped = {
            let _mirror = self.mirror.read().await;
            match self.sessions.claim(user_id) {
                Some(_) => {
                    if let Err(e) = self.io(self.store.delete_active_session(user_id)).await {
                        self.sessions.release(user_id);
                        return Err(e.into());
                    }
                    self.sessions.remove(user_id);
                    true
                }
                None => false,
            }
        };
        {
            let lock = self.energy_lock(user_id);
            let _energy = lock.lock().await;
            self.io(self.cache.flush_user(user_id)).await?;
        }
        metrics::set_active_sessions(self.sessions.len());
        tracing::info!(user_id, dropped_session = dropped, "User mining state flushed");
        Ok(dropped)
    }

    // ── Scheduler ticks ────────────────────────────────────────────────

    /// Finalize a due session. A user without a claimable session is a
    /// silent no-op, which makes repeated calls harmless.
    pub(crate) async fn complete_mining(&self, user_id: UserId) -> Result<Option<MinedBlock>> {
        let _mirror = self.mirror.read().await;
        let Some(session) = self.sessions.claim(user_id) else {
            return Ok(None);
        };
        self.settle(user_id, session).await.map(Some)
    }

    /// Mint the block for a claimed session. On any durable failure the
    /// claim is released so the next sweep retries.
    async fn settle(&self, user_id: UserId, session: MiningSession) -> Result<MinedBlock> {
        let profile = match self.io(self.store.fetch_miner(user_id)).await {
            Ok(p) => p,
            Err(e) => {
                self.sessions.release(user_id);
                metrics::inc_completion_failures();
                return Err(e.into());
            }
        };
        let Some(profile) = profile else {
            tracing::error!(user_id, "User not found during mining completion, dropping session");
            if let Err(e) = self.io(self.store.delete_active_session(user_id)).await {
                self.sessions.release(user_id);
                return Err(e.into());
            }
            self.sessions.remove(user_id);
            return Err(MiningError::UserNotFound);
        };

        // Counters are read before the block lands so a store-side fallback
        // does not already include it.
        let totals = self.counters(user_id).await;

        let now = self.clock.now();
        let outcome = self.rewards.generate(profile.miner_level);
        let block = MinedBlock {
            user_id,
            block_number: session.block_number,
            block_hash: block_hash(session.block_number, user_id, session.hashrate, now),
            hashrate: session.hashrate,
            reward: outcome.user_reward,
            treasury_fee: outcome.treasury_fee,
            is_solo: outcome.is_solo,
            energy_used: session.energy_reserved,
            mined_at: now,
        };

        if let Err(e) = self.io(self.store.record_completed_block(&block)).await {
            self.sessions.release(user_id);
            metrics::inc_completion_failures();
            return Err(e.into());
        }

        // The slot is still Settling here, so a new start for this user
        // waits until the incremented counters are in the cache.
        match totals {
            Ok(totals) => {
                let totals = UserTotals {
                    blocks_mined: totals.blocks_mined + 1,
                    total_rewards: totals.total_rewards + block.reward,
                };
                self.update_stats(user_id, &MiningStatsSnapshot::idle(totals)).await;
            }
            Err(e) => tracing::warn!(user_id, "Mining counters not updated: {}", e),
        }
        self.sessions.remove(user_id);

        let event = CompletionEvent {
            block_number: block.block_number,
            reward: block.reward,
            is_solo: block.is_solo,
            block_hash: block.block_hash.clone(),
        };
        if let Err(e) = self.io(self.notifier.publish(user_id, &event)).await {
            tracing::warn!(user_id, "Completion notification dropped: {}", e);
        }

        metrics::record_block(block.reward, block.treasury_fee, block.is_solo);
        tracing::info!(
            user_id,
            block_number = block.block_number,
            reward = block.reward,
            treasury_fee = block.treasury_fee,
            is_solo = block.is_solo,
            block_hash = %block.block_hash,
            "Mining completed"
        );
        Ok(block)
    }

    /// Complete every session past its block time. Per-user failures are
    /// logged and left for the next sweep.
    pub async fn sweep_completions(&self) -> Result<SweepReport> {
        let due = self.sessions.expired(self.clock.now(), self.config.block_time_ms);
        let mut report = SweepReport { due: due.len(), ..SweepReport::default() };

        for user_id in due {
            match self.complete_mining(user_id).await {
                Ok(Some(_)) => report.completed += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(user_id, "Completion deferred to next sweep: {}", e);
                }
            }
        }

        if self.sessions.take_dirty() {
            if let Err(e) = self.flush_sessions().await {
                self.sessions.mark_dirty();
                tracing::warn!("Session snapshot flush failed: {}", e);
            }
        }

        metrics::set_active_sessions(self.sessions.len());
        if report.due > 0 {
            tracing::debug!(
                "Completion sweep: due={} completed={} failed={}",
                report.due,
                report.completed,
                report.failed
            );
        }
        Ok(report)
    }

    /// Credit elapsed regeneration to every non-full energy state.
    pub async fn regenerate_energy(&self) -> Result<usize> {
        let users = self.io(self.cache.energy_users()).await?;
        let mut refreshed = 0;

        for user_id in users {
            match self.regenerate_user(user_id).await {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(user_id, "Energy regeneration skipped: {}", e),
            }
        }

        metrics::inc_energy_regenerated_by(refreshed as u64);
        tracing::debug!("Energy regenerated for {} users", refreshed);
        Ok(refreshed)
    }

    async fn regenerate_user(&self, user_id: UserId) -> StoreResult<bool> {
        let lock = self.energy_lock(user_id);
        let _energy = lock.lock().await;

        let Some(state) = self.io(self.cache.get_energy(user_id)).await? else {
            return Ok(false);
        };
        if state.is_full() {
            return Ok(false);
        }
        let now = self.clock.now();
        let current = current_energy(Some(&state), now, self.config.base_energy);
        self.io(self.cache.set_energy(user_id, &state.rebased(current, now))).await?;
        Ok(true)
    }

    /// Purge expired credential tokens and trim per-user block history.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let tokens_purged = self.io(self.store.purge_expired_tokens(self.clock.now())).await?;
        let blocks_pruned = self
            .io(self.store.prune_block_history(self.config.retained_blocks_per_user))
            .await?;
        let locks_pruned = self.prune_energy_locks();
        tracing::info!(
            "Mining cleanup completed: {} tokens purged, {} blocks pruned, {} idle locks dropped",
            tokens_purged,
            blocks_pruned,
            locks_pruned
        );
        Ok(CleanupReport { tokens_purged, blocks_pruned, locks_pruned })
    }

    /// Replace the durable session mirror with the in-memory index.
    pub async fn flush_sessions(&self) -> Result<usize> {
        let _mirror = self.mirror.write().await;
        let snapshot = self.sessions.snapshot_all();
        self.io(self.store.replace_active_sessions(&snapshot)).await?;
        Ok(snapshot.len())
    }

    // ── Helpers ────────────────────────────────────────────────────────

    /// Cumulative counters: cache first, durable history as fallback.
    async fn counters(&self, user_id: UserId) -> StoreResult<UserTotals> {
        if let Some(stats) = self.io(self.cache.get_stats(user_id)).await? {
            return Ok(UserTotals {
                blocks_mined: stats.blocks_mined,
                total_rewards: stats.total_rewards,
            });
        }
        self.io(self.store.user_totals(user_id)).await
    }

    async fn update_stats(&self, user_id: UserId, stats: &MiningStatsSnapshot) {
        if let Err(e) = self.io(self.cache.set_stats(user_id, stats)).await {
            tracing::warn!(user_id, "Mining stats cache write failed: {}", e);
        }
    }

    fn energy_lock(&self, user_id: UserId) -> Arc<tokio::sync::Mutex<()>> {
        self.energy_locks.lock().entry(user_id).or_default().clone()
    }

    /// Drop lock entries nobody holds. A held entry stays so that two
    /// callers never serialize on different mutexes for the same user.
    fn prune_energy_locks(&self) -> usize {
        let mut locks = self.energy_locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    /// Bound a storage call by the configured timeout.
    async fn io<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let limit = self.config.storage_timeout();
        let result = match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(limit)),
        };
        if result.is_err() {
            metrics::inc_storage_errors();
        }
        result
    }
}
