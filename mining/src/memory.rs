//! In-process backends
//!
//! Drop-in implementations of the collaborator traits that keep everything
//! in memory. Used by the test suites and for running the engine without
//! PostgreSQL/Redis. Each backend can be switched offline to exercise the
//! storage-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::energy::EnergyState;
use crate::error::{StorageError, StoreResult};
use crate::session::MiningSession;
use crate::store::{
    page_count, BlockFilter, CompletionEvent, CompletionNotifier, HistoryStats, LeaderboardEntry,
    MinedBlock, MinerProfile, MiningHistory, MiningStatsSnapshot, MiningStore, RecentBlock,
    StatusCache, UserTotals,
};
use crate::UserId;

fn injected() -> StorageError {
    StorageError::Unavailable("injected failure".to_string())
}

#[derive(Default)]
struct StoreState {
    users: HashMap<UserId, MinerProfile>,
    blocks: Vec<MinedBlock>,
    active: HashMap<UserId, MiningSession>,
    tokens: Vec<(UserId, DateTime<Utc>)>,
    block_floor: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    offline: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, profile: MinerProfile) {
        self.state.lock().users.insert(profile.user_id, profile);
    }

    /// Active level-`level` user with default capacity and zero balance.
    pub fn add_miner(&self, user_id: UserId, level: i32) {
        self.insert_user(MinerProfile {
            user_id,
            username: Some(format!("miner{}", user_id)),
            first_name: None,
            miner_level: level,
            energy_capacity: 1000.0,
            balance: 0,
            is_active: true,
        });
    }

    pub fn remove_user(&self, user_id: UserId) {
        self.state.lock().users.remove(&user_id);
    }

    pub fn user(&self, user_id: UserId) -> Option<MinerProfile> {
        self.state.lock().users.get(&user_id).cloned()
    }

    pub fn balance(&self, user_id: UserId) -> i64 {
        self.user(user_id).map(|u| u.balance).unwrap_or(0)
    }

    pub fn blocks(&self) -> Vec<MinedBlock> {
        self.state.lock().blocks.clone()
    }

    pub fn push_block(&self, block: MinedBlock) {
        self.state.lock().blocks.push(block);
    }

    pub fn active_sessions(&self) -> HashMap<UserId, MiningSession> {
        self.state.lock().active.clone()
    }

    pub fn add_token(&self, user_id: UserId, expires_at: DateTime<Utc>) {
        self.state.lock().tokens.push((user_id, expires_at));
    }

    pub fn token_count(&self) -> usize {
        self.state.lock().tokens.len()
    }

    /// Pretend blocks up to `n` were mined before this store existed.
    pub fn set_max_block_number(&self, n: u64) {
        self.state.lock().block_floor = n;
    }

    /// Every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reads succeed, writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        self.check_read()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }
}

#[async_trait]
impl MiningStore for MemoryStore {
    async fn fetch_miner(&self, user_id: UserId) -> StoreResult<Option<MinerProfile>> {
        self.check_read()?;
        Ok(self.user(user_id))
    }

    async fn max_block_number(&self) -> StoreResult<u64> {
        self.check_read()?;
        let state = self.state.lock();
        let mined = state.blocks.iter().map(|b| b.block_number).max().unwrap_or(0);
        let active = state.active.values().map(|s| s.block_number).max().unwrap_or(0);
        Ok(mined.max(active).max(state.block_floor))
    }

    async fn upsert_active_session(&self, user_id: UserId, session: &MiningSession) -> StoreResult<()> {
        self.check_write()?;
        self.state.lock().active.insert(user_id, session.clone());
        Ok(())
    }

    async fn delete_active_session(&self, user_id: UserId) -> StoreResult<()> {
        self.check_write()?;
        self.state.lock().active.remove(&user_id);
        Ok(())
    }

    async fn load_active_sessions(&self) -> StoreResult<Vec<(UserId, MiningSession)>> {
        self.check_read()?;
        Ok(self.state.lock().active.iter().map(|(u, s)| (*u, s.clone())).collect())
    }

    async fn replace_active_sessions(&self, sessions: &[(UserId, MiningSession)]) -> StoreResult<()> {
        self.check_write()?;
        let mut state = self.state.lock();
        state.active = sessions.iter().cloned().collect();
        Ok(())
    }

    async fn record_completed_block(&self, block: &MinedBlock) -> StoreResult<()> {
        self.check_write()?;
        let mut state = self.state.lock();
        let duplicate = state.blocks.iter().any(|b| b.block_number == block.block_number);
        if !duplicate {
            if let Some(user) = state.users.get_mut(&block.user_id) {
                user.balance += block.reward as i64;
            }
            state.blocks.push(block.clone());
        }
        state.active.remove(&block.user_id);
        Ok(())
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        let before = state.tokens.len();
        state.tokens.retain(|(_, expires_at)| *expires_at >= now);
        Ok((before - state.tokens.len()) as u64)
    }

    async fn prune_block_history(&self, keep: u32) -> StoreResult<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        let before = state.blocks.len();

        let mut by_user: HashMap<UserId, Vec<MinedBlock>> = HashMap::new();
        for block in state.blocks.drain(..) {
            by_user.entry(block.user_id).or_default().push(block);
        }
        let mut kept = Vec::with_capacity(before);
        for (_, mut blocks) in by_user {
            blocks.sort_by(|a, b| b.mined_at.cmp(&a.mined_at));
            blocks.truncate(keep as usize);
            kept.extend(blocks);
        }
        kept.sort_by(|a, b| a.mined_at.cmp(&b.mined_at));
        state.blocks = kept;
        Ok((before - state.blocks.len()) as u64)
    }

    async fn leaderboard(&self, limit: u32) -> StoreResult<Vec<LeaderboardEntry>> {
        self.check_read()?;
        let state = self.state.lock();
        let mut entries: Vec<LeaderboardEntry> = state
            .users
            .values()
            .filter(|u| u.is_active)
            .map(|u| {
                let mine: Vec<&MinedBlock> =
                    state.blocks.iter().filter(|b| b.user_id == u.user_id).collect();
                LeaderboardEntry {
                    user_id: u.user_id,
                    username: u.username.clone(),
                    first_name: u.first_name.clone(),
                    miner_level: u.miner_level,
                    blocks_mined: mine.len() as u64,
                    total_rewards: if mine.is_empty() {
                        None
                    } else {
                        Some(mine.iter().map(|b| b.reward).sum())
                    },
                    last_mining: mine.iter().map(|b| b.mined_at).max(),
                }
            })
            .collect();
        // descending, users without blocks last
        entries.sort_by(|a, b| {
            b.total_rewards
                .cmp(&a.total_rewards)
                .then(a.user_id.cmp(&b.user_id))
        });
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn user_totals(&self, user_id: UserId) -> StoreResult<UserTotals> {
        self.check_read()?;
        let state = self.state.lock();
        let mine = state.blocks.iter().filter(|b| b.user_id == user_id);
        let (blocks_mined, total_rewards) =
            mine.fold((0u64, 0u64), |(n, sum), b| (n + 1, sum + b.reward));
        Ok(UserTotals { blocks_mined, total_rewards })
    }

    async fn mining_history(
        &self,
        user_id: UserId,
        filter: BlockFilter,
        page: u32,
        limit: u32,
    ) -> StoreResult<MiningHistory> {
        self.check_read()?;
        let state = self.state.lock();
        let mut mine: Vec<&MinedBlock> = state.blocks.iter().filter(|b| b.user_id == user_id).collect();
        mine.sort_by(|a, b| b.mined_at.cmp(&a.mined_at));

        let total_blocks = mine.len() as u64;
        let solo_blocks = mine.iter().filter(|b| b.is_solo).count() as u64;
        let stats = HistoryStats {
            total_blocks,
            total_rewards: mine.iter().map(|b| b.reward).sum(),
            solo_blocks,
            pool_blocks: total_blocks - solo_blocks,
            avg_hashrate: if total_blocks == 0 {
                0
            } else {
                (mine.iter().map(|b| b.hashrate as f64).sum::<f64>() / total_blocks as f64).round() as u64
            },
            last_mining: mine.first().map(|b| b.mined_at),
        };

        let filtered: Vec<&MinedBlock> = mine.into_iter().filter(|b| filter.matches(b.is_solo)).collect();
        let total = filtered.len() as u64;
        let offset = (page.saturating_sub(1) as usize) * limit as usize;
        let blocks = filtered.into_iter().skip(offset).take(limit as usize).cloned().collect();

        Ok(MiningHistory { blocks, page, limit, total, pages: page_count(total, limit), stats })
    }

    async fn recent_blocks(&self, limit: u32) -> StoreResult<Vec<RecentBlock>> {
        self.check_read()?;
        let state = self.state.lock();
        let mut blocks: Vec<&MinedBlock> = state.blocks.iter().collect();
        blocks.sort_by(|a, b| b.mined_at.cmp(&a.mined_at));
        Ok(blocks
            .into_iter()
            .filter_map(|b| {
                state.users.get(&b.user_id).map(|u| RecentBlock {
                    block: b.clone(),
                    username: u.username.clone(),
                    first_name: u.first_name.clone(),
                    miner_level: u.miner_level,
                })
            })
            .take(limit as usize)
            .collect())
    }
}

#[derive(Default)]
struct CacheState {
    energy: HashMap<UserId, EnergyState>,
    stats: HashMap<UserId, MiningStatsSnapshot>,
}

#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<CacheState>,
    offline: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn energy(&self, user_id: UserId) -> Option<EnergyState> {
        self.state.lock().energy.get(&user_id).cloned()
    }

    pub fn stats(&self, user_id: UserId) -> Option<MiningStatsSnapshot> {
        self.state.lock().stats.get(&user_id).cloned()
    }

    pub fn put_energy(&self, user_id: UserId, state: EnergyState) {
        self.state.lock().energy.insert(user_id, state);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        self.check()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }
}

#[async_trait]
impl StatusCache for MemoryCache {
    async fn get_energy(&self, user_id: UserId) -> StoreResult<Option<EnergyState>> {
        self.check()?;
        Ok(self.energy(user_id))
    }

    async fn set_energy(&self, user_id: UserId, state: &EnergyState) -> StoreResult<()> {
        self.check_write()?;
        self.put_energy(user_id, state.clone());
        Ok(())
    }

    async fn energy_users(&self) -> StoreResult<Vec<UserId>> {
        self.check()?;
        Ok(self.state.lock().energy.keys().copied().collect())
    }

    async fn get_stats(&self, user_id: UserId) -> StoreResult<Option<MiningStatsSnapshot>> {
        self.check()?;
        Ok(self.stats(user_id))
    }

    async fn set_stats(&self, user_id: UserId, stats: &MiningStatsSnapshot) -> StoreResult<()> {
        self.check_write()?;
        self.state.lock().stats.insert(user_id, stats.clone());
        Ok(())
    }

    async fn flush_user(&self, user_id: UserId) -> StoreResult<()> {
        self.check_write()?;
        let mut state = self.state.lock();
        state.energy.remove(&user_id);
        state.stats.remove(&user_id);
        Ok(())
    }
}

/// Records every published event.
#[derive(Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<(UserId, CompletionEvent)>>,
    offline: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(UserId, CompletionEvent)> {
        self.events.lock().clone()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionNotifier for MemoryNotifier {
    async fn publish(&self, user_id: UserId, event: &CompletionEvent) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.events.lock().push((user_id, event.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn block(user_id: UserId, n: u64, reward: u64, mined_at: DateTime<Utc>, is_solo: bool) -> MinedBlock {
        MinedBlock {
            user_id,
            block_number: n,
            block_hash: format!("{:064x}", n),
            hashrate: 100,
            reward,
            treasury_fee: 0,
            is_solo,
            energy_used: 99.0,
            mined_at,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn prune_keeps_newest_per_user() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.push_block(block(1, i, 10, t0() + Duration::minutes(i as i64), false));
        }
        store.push_block(block(2, 99, 10, t0(), false));

        let removed = store.prune_block_history(2).await.unwrap();
        assert_eq!(removed, 3);
        let mut kept: Vec<u64> = store.blocks().iter().filter(|b| b.user_id == 1).map(|b| b.block_number).collect();
        kept.sort();
        assert_eq!(kept, vec![3, 4]);
        assert_eq!(store.blocks().iter().filter(|b| b.user_id == 2).count(), 1);
    }

    #[tokio::test]
    async fn leaderboard_orders_by_rewards_nulls_last() {
        let store = MemoryStore::new();
        store.add_miner(1, 1);
        store.add_miner(2, 1);
        store.add_miner(3, 1);
        store.push_block(block(1, 1, 100, t0(), false));
        store.push_block(block(2, 2, 500, t0(), true));

        let board = store.leaderboard(10).await.unwrap();
        let order: Vec<UserId> = board.iter().map(|e| e.user_id).collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert_eq!(board[2].total_rewards, None);
        assert_eq!(board[2].blocks_mined, 0);
    }

    #[tokio::test]
    async fn history_filters_and_paginates() {
        let store = MemoryStore::new();
        for i in 0..5u64 {
            store.push_block(block(1, i, 10, t0() + Duration::minutes(i as i64), i % 2 == 0));
        }
        let page = store.mining_history(1, BlockFilter::Solo, 1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.pages, 2);
        assert_eq!(page.blocks.iter().map(|b| b.block_number).collect::<Vec<_>>(), vec![4, 2]);
        assert_eq!(page.stats.total_blocks, 5);
        assert_eq!(page.stats.solo_blocks, 3);
        assert_eq!(page.stats.pool_blocks, 2);
    }

    #[tokio::test]
    async fn recording_the_same_block_twice_credits_once() {
        let store = MemoryStore::new();
        store.add_miner(1, 1);
        let b = block(1, 7, 450, t0(), false);
        store.record_completed_block(&b).await.unwrap();
        store.record_completed_block(&b).await.unwrap();
        assert_eq!(store.balance(1), 450);
        assert_eq!(store.blocks().len(), 1);
    }

    #[tokio::test]
    async fn offline_store_rejects_calls() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(store.max_block_number().await.is_err());
        store.set_offline(false);
        store.set_fail_writes(true);
        assert!(store.max_block_number().await.is_ok());
        assert!(store.delete_active_session(1).await.is_err());
    }
}
