//! Collaborator interfaces and the records that cross them
//!
//! The engine never talks to PostgreSQL or Redis directly. It is handed a
//! [`MiningStore`] (durable, transactional), a [`StatusCache`] (hot per-user
//! state) and a [`CompletionNotifier`] (best-effort push channel).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::energy::EnergyState;
use crate::error::StoreResult;
use crate::session::MiningSession;
use crate::UserId;

/// The slice of a user account the engine cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerProfile {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub miner_level: i32,
    pub energy_capacity: f64,
    /// Token balance in smallest units
    pub balance: i64,
    pub is_active: bool,
}

/// One completed session. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinedBlock {
    pub user_id: UserId,
    pub block_number: u64,
    pub block_hash: String,
    pub hashrate: u64,
    /// Net amount credited to the user
    pub reward: u64,
    pub treasury_fee: u64,
    pub is_solo: bool,
    pub energy_used: f64,
    pub mined_at: DateTime<Utc>,
}

/// Cached, non-authoritative mining view of one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MiningStatsSnapshot {
    pub is_active: bool,
    pub hashrate: u64,
    pub current_block: Option<u64>,
    pub block_start_time: Option<DateTime<Utc>>,
    pub blocks_mined: u64,
    pub total_rewards: u64,
}

impl MiningStatsSnapshot {
    pub fn active(session: &MiningSession, blocks_mined: u64, total_rewards: u64) -> Self {
        Self {
            is_active: true,
            hashrate: session.hashrate,
            current_block: Some(session.block_number),
            block_start_time: Some(session.started_at),
            blocks_mined,
            total_rewards,
        }
    }

    /// Idle view carrying the cumulative counters over.
    pub fn idle(totals: UserTotals) -> Self {
        Self {
            blocks_mined: totals.blocks_mined,
            total_rewards: totals.total_rewards,
            ..Self::default()
        }
    }
}

/// Payload published when a block is mined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub block_number: u64,
    pub reward: u64,
    pub is_solo: bool,
    pub block_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub miner_level: i32,
    pub blocks_mined: u64,
    /// `None` for users that never mined a block
    pub total_rewards: Option<u64>,
    pub last_mining: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTotals {
    pub blocks_mined: u64,
    pub total_rewards: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockFilter {
    #[default]
    All,
    Solo,
    Pool,
}

impl BlockFilter {
    pub fn matches(&self, is_solo: bool) -> bool {
        match self {
            BlockFilter::All => true,
            BlockFilter::Solo => is_solo,
            BlockFilter::Pool => !is_solo,
        }
    }

    /// Value for an `is_solo = $n` predicate; `None` means no predicate.
    pub fn solo_flag(&self) -> Option<bool> {
        match self {
            BlockFilter::All => None,
            BlockFilter::Solo => Some(true),
            BlockFilter::Pool => Some(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_blocks: u64,
    pub total_rewards: u64,
    pub solo_blocks: u64,
    pub pool_blocks: u64,
    pub avg_hashrate: u64,
    pub last_mining: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningHistory {
    pub blocks: Vec<MinedBlock>,
    pub page: u32,
    pub limit: u32,
    /// Rows matching the filter
    pub total: u64,
    pub pages: u64,
    /// Aggregates over all of the user's blocks, regardless of filter
    pub stats: HistoryStats,
}

/// A block with the miner's display fields, for the global feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentBlock {
    pub block: MinedBlock,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub miner_level: i32,
}

/// Durable, transactional store (users, mined blocks, active sessions).
#[async_trait]
pub trait MiningStore: Send + Sync {
    async fn fetch_miner(&self, user_id: UserId) -> StoreResult<Option<MinerProfile>>;

    /// Highest block number across mined blocks and active sessions, 0 if none.
    async fn max_block_number(&self) -> StoreResult<u64>;

    async fn upsert_active_session(&self, user_id: UserId, session: &MiningSession) -> StoreResult<()>;

    async fn delete_active_session(&self, user_id: UserId) -> StoreResult<()>;

    async fn load_active_sessions(&self) -> StoreResult<Vec<(UserId, MiningSession)>>;

    /// Replace the whole active-session table with `sessions`, atomically.
    async fn replace_active_sessions(&self, sessions: &[(UserId, MiningSession)]) -> StoreResult<()>;

    /// Credit `block.reward`, append `block` and drop the user's active
    /// session record in one transaction. A block number that was already
    /// recorded is not credited again, so a retry after an ambiguous
    /// failure only clears the session record.
    async fn record_completed_block(&self, block: &MinedBlock) -> StoreResult<()>;

    /// Delete credential tokens past expiry. Returns rows removed.
    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Keep only the newest `keep` blocks per user. Returns rows removed.
    async fn prune_block_history(&self, keep: u32) -> StoreResult<u64>;

    async fn leaderboard(&self, limit: u32) -> StoreResult<Vec<LeaderboardEntry>>;

    async fn user_totals(&self, user_id: UserId) -> StoreResult<UserTotals>;

    async fn mining_history(
        &self,
        user_id: UserId,
        filter: BlockFilter,
        page: u32,
        limit: u32,
    ) -> StoreResult<MiningHistory>;

    async fn recent_blocks(&self, limit: u32) -> StoreResult<Vec<RecentBlock>>;
}

/// Fast per-user cache for energy and mining status.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get_energy(&self, user_id: UserId) -> StoreResult<Option<EnergyState>>;

    async fn set_energy(&self, user_id: UserId, state: &EnergyState) -> StoreResult<()>;

    /// Every user that currently has an energy state.
    async fn energy_users(&self) -> StoreResult<Vec<UserId>>;

    async fn get_stats(&self, user_id: UserId) -> StoreResult<Option<MiningStatsSnapshot>>;

    async fn set_stats(&self, user_id: UserId, stats: &MiningStatsSnapshot) -> StoreResult<()>;

    /// Drop everything cached for the user.
    async fn flush_user(&self, user_id: UserId) -> StoreResult<()>;
}

/// Best-effort push channel for completion events.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn publish(&self, user_id: UserId, event: &CompletionEvent) -> StoreResult<()>;
}

/// Number of pages needed for `total` rows.
pub fn page_count(total: u64, limit: u32) -> u64 {
    if limit == 0 {
        return 0;
    }
    total.div_ceil(limit as u64)
}
