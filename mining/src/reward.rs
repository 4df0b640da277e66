/// Block rewards
///
/// Every completed session mints one block. Higher miner levels are more
/// likely to land a solo block (full reward) instead of a pool block (half).
/// A fixed percentage of every reward is withheld for the treasury.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::StoreResult;
use crate::store::MiningStore;
use crate::UserId;

const BASE_SOLO_CHANCE: f64 = 0.10;
const SOLO_CHANCE_PER_LEVEL: f64 = 0.10;
const MAX_SOLO_CHANCE: f64 = 0.50;

/// Probability that a miner of `level` lands a solo block.
pub fn solo_chance(level: i32) -> f64 {
    let steps = (level.max(1) - 1) as f64;
    (BASE_SOLO_CHANCE + SOLO_CHANCE_PER_LEVEL * steps).min(MAX_SOLO_CHANCE)
}

/// Result of one reward roll, already split with the treasury.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardOutcome {
    /// Gross reward before the treasury cut
    pub reward: u64,
    pub treasury_fee: u64,
    pub user_reward: u64,
    pub is_solo: bool,
}

#[derive(Debug, Clone)]
pub struct RewardGenerator {
    base_reward: u64,
    treasury_fee_percent: u64,
}

impl RewardGenerator {
    pub fn new(base_reward: u64, treasury_fee_percent: u64) -> Self {
        Self { base_reward, treasury_fee_percent: treasury_fee_percent.min(100) }
    }

    /// Roll with the calling thread's RNG.
    pub fn generate(&self, miner_level: i32) -> RewardOutcome {
        self.roll(miner_level, &mut rand::thread_rng())
    }

    pub fn roll<R: Rng>(&self, miner_level: i32, rng: &mut R) -> RewardOutcome {
        let draw: f64 = rng.gen();
        self.outcome(draw < solo_chance(miner_level))
    }

    pub fn outcome(&self, is_solo: bool) -> RewardOutcome {
        let reward = if is_solo { self.base_reward } else { self.base_reward / 2 };
        let (treasury_fee, user_reward) = self.split(reward);
        RewardOutcome { reward, treasury_fee, user_reward, is_solo }
    }

    /// `(treasury_fee, user_reward)`; the two always add up to `reward`.
    pub fn split(&self, reward: u64) -> (u64, u64) {
        let fee = (reward as u128 * self.treasury_fee_percent as u128 / 100) as u64;
        (fee, reward - fee)
    }
}

/// Opaque display hash of a mined block, hex SHA-256.
pub fn block_hash(block_number: u64, user_id: UserId, hashrate: u64, now: DateTime<Utc>) -> String {
    let data = format!("{}-{}-{}-{}", block_number, user_id, hashrate, now.timestamp_millis());
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Single-writer block number allocator.
///
/// Seeded once from the highest number the durable store has seen (mined
/// blocks and in-flight sessions), then advanced in memory so concurrent
/// starts never share a number.
pub struct BlockSequence {
    last: Mutex<Option<u64>>,
}

impl BlockSequence {
    pub fn new() -> Self {
        Self { last: Mutex::new(None) }
    }

    pub async fn next(&self, store: &dyn MiningStore) -> StoreResult<u64> {
        let mut last = self.last.lock().await;
        let current = match *last {
            Some(n) => n,
            None => store.max_block_number().await?,
        };
        let next = current + 1;
        *last = Some(next);
        Ok(next)
    }
}

impl Default for BlockSequence {
    fn default() -> Self {
        Self::new()
    }
}
