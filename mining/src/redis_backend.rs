/// Redis status cache and completion channel
///
/// Keys:
/// - user:{id}:energy  JSON `EnergyState`
/// - user:{id}:mining  JSON `MiningStatsSnapshot`
/// - energy:users      set of user ids that have an energy state
///
/// Completion events are published on `mining:complete:{id}`.
///
/// Uses redis::aio::ConnectionManager, opened lazily on first use.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::energy::EnergyState;
use crate::error::{StorageError, StoreResult};
use crate::store::{CompletionEvent, CompletionNotifier, MiningStatsSnapshot, StatusCache};
use crate::UserId;

const ENERGY_USERS_KEY: &str = "energy:users";

fn energy_key(user_id: UserId) -> String {
    format!("user:{}:energy", user_id)
}

fn stats_key(user_id: UserId) -> String {
    format!("user:{}:mining", user_id)
}

fn completion_channel(user_id: UserId) -> String {
    format!("mining:complete:{}", user_id)
}

pub struct RedisBackend {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
}

impl RedisBackend {
    pub fn new(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    async fn get_connection(&self) -> StoreResult<redis::aio::ConnectionManager> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut conn_guard = self.connection.write().await;
        match conn_guard.as_ref() {
            Some(conn) => Ok(conn.clone()),
            None => {
                let manager = self.client.get_connection_manager().await?;
                *conn_guard = Some(manager.clone());
                Ok(manager)
            }
        }
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StorageError::Unavailable(format!("Redis health check failed: got {}", pong)));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusCache for RedisBackend {
    async fn get_energy(&self, user_id: UserId) -> StoreResult<Option<EnergyState>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(energy_key(user_id)).await?;
        Ok(raw.map(|s| serde_json::from_str::<EnergyState>(&s)).transpose()?)
    }

    async fn set_energy(&self, user_id: UserId, state: &EnergyState) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(state)?;
        redis::pipe()
            .atomic()
            .set(energy_key(user_id), json)
            .ignore()
            .sadd(ENERGY_USERS_KEY, user_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn energy_users(&self) -> StoreResult<Vec<UserId>> {
        let mut conn = self.get_connection().await?;
        let users: Vec<UserId> = conn.smembers(ENERGY_USERS_KEY).await?;
        Ok(users)
    }

    async fn get_stats(&self, user_id: UserId) -> StoreResult<Option<MiningStatsSnapshot>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(stats_key(user_id)).await?;
        Ok(raw.map(|s| serde_json::from_str::<MiningStatsSnapshot>(&s)).transpose()?)
    }

    async fn set_stats(&self, user_id: UserId, stats: &MiningStatsSnapshot) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(stats)?;
        conn.set::<_, _, ()>(stats_key(user_id), json).await?;
        Ok(())
    }

    async fn flush_user(&self, user_id: UserId) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        redis::pipe()
            .atomic()
            .del(energy_key(user_id))
            .ignore()
            .del(stats_key(user_id))
            .ignore()
            .srem(ENERGY_USERS_KEY, user_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CompletionNotifier for RedisBackend {
    async fn publish(&self, user_id: UserId, event: &CompletionEvent) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let payload = serde_json::to_string(event)?;
        conn.publish::<_, _, ()>(completion_channel(user_id), payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
    }

    #[test]
    fn key_layout() {
        assert_eq!(energy_key(42), "user:42:energy");
        assert_eq!(stats_key(42), "user:42:mining");
        assert_eq!(completion_channel(42), "mining:complete:42");
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn energy_round_trip_tracks_user_set() {
        let backend = RedisBackend::new(&redis_url()).unwrap();
        backend.ping().await.unwrap();

        let user_id = 9_000_001;
        let state = EnergyState {
            current: 412.5,
            max: 1000.0,
            last_update: Some(Utc::now()),
            regen_rate: 250.0,
        };
        backend.set_energy(user_id, &state).await.unwrap();
        assert_eq!(backend.get_energy(user_id).await.unwrap(), Some(state));
        assert!(backend.energy_users().await.unwrap().contains(&user_id));

        backend.flush_user(user_id).await.unwrap();
        assert_eq!(backend.get_energy(user_id).await.unwrap(), None);
        assert!(!backend.energy_users().await.unwrap().contains(&user_id));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn stats_round_trip() {
        let backend = RedisBackend::new(&redis_url()).unwrap();
        let user_id = 9_000_002;
        let stats = MiningStatsSnapshot {
            blocks_mined: 3,
            total_rewards: 1_350_000_000,
            ..MiningStatsSnapshot::default()
        };
        backend.set_stats(user_id, &stats).await.unwrap();
        assert_eq!(backend.get_stats(user_id).await.unwrap(), Some(stats));
        backend.flush_user(user_id).await.unwrap();
    }
}
