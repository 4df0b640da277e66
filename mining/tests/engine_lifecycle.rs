/// Mining lifecycle tests
///
/// Drives the engine end to end through the in-memory backends with a
/// manual clock: start, sweep, stop, status, history and leaderboard.

use aegisum_mining::clock::{Clock, ManualClock};
use aegisum_mining::config::MiningConfig;
use aegisum_mining::energy::EnergyState;
use aegisum_mining::memory::{MemoryCache, MemoryNotifier, MemoryStore};
use aegisum_mining::store::BlockFilter;
use aegisum_mining::{MiningEngine, MiningError};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

struct Rig {
    engine: Arc<MiningEngine>,
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    notifier: Arc<MemoryNotifier>,
    clock: Arc<ManualClock>,
}

fn rig() -> Rig {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let clock = Arc::new(ManualClock::new(
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
    ));
    let engine = Arc::new(
        MiningEngine::new(MiningConfig::default(), store.clone(), cache.clone(), notifier.clone())
            .with_clock(clock.clone()),
    );
    Rig { engine, store, cache, notifier, clock }
}

// ═══════════════════════════════════════════════════════════════════════════
// 1. Full session
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_level_one_session_runs_to_completion() {
    let r = rig();
    r.store.add_miner(1, 1);
    r.cache.put_energy(1, EnergyState::full(1000.0, 250.0));

    let receipt = r.engine.start_mining(1).await.unwrap();
    assert_eq!(receipt.hashrate, 100);
    assert_eq!(receipt.energy_used, 99.0);
    assert_eq!(receipt.estimated_completion, receipt.started_at + Duration::milliseconds(180_000));
    assert_eq!(r.cache.energy(1).unwrap().current, 901.0);

    // not due yet
    r.clock.advance_ms(179_999);
    assert_eq!(r.engine.sweep_completions().await.unwrap().due, 0);

    r.clock.advance_ms(1);
    let report = r.engine.sweep_completions().await.unwrap();
    assert_eq!(report.completed, 1);

    let blocks = r.store.blocks();
    assert_eq!(blocks.len(), 1);
    let block = &blocks[0];
    let gross = block.reward + block.treasury_fee;
    if block.is_solo {
        assert_eq!(gross, 1_000_000_000);
    } else {
        assert_eq!(gross, 500_000_000);
    }
    assert_eq!(block.treasury_fee, gross / 10);
    assert_eq!(r.store.balance(1), block.reward as i64);
    assert_eq!(block.block_hash.len(), 64);

    let events = r.notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, 1);
    assert_eq!(events[0].1.block_number, block.block_number);

    // energy keeps regenerating after the session
    r.clock.advance(Duration::hours(1));
    let status = r.engine.get_status(1).await.unwrap();
    assert!(!status.is_active);
    assert_eq!(status.blocks_mined, 1);
    assert_eq!(status.total_rewards, block.reward);
    assert_eq!(status.energy.current, 1000);
}

#[tokio::test]
async fn test_higher_levels_mine_faster_hashrate() {
    let r = rig();
    r.store.add_miner(5, 5);
    let receipt = r.engine.start_mining(5).await.unwrap();
    assert_eq!(receipt.hashrate, 500);
}

#[tokio::test]
async fn test_new_user_without_energy_state_starts_from_base_capacity() {
    let r = rig();
    r.store.add_miner(3, 1);
    assert!(r.cache.energy(3).is_none());
    r.engine.start_mining(3).await.unwrap();
    let energy = r.cache.energy(3).unwrap();
    assert_eq!(energy.current, 901.0);
    assert_eq!(energy.max, 1000.0);
    assert_eq!(energy.last_update, Some(r.clock.now()));
}

// ═══════════════════════════════════════════════════════════════════════════
// 2. Races and rejections
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_back_to_back_starts_admit_exactly_one() {
    let r = rig();
    r.store.add_miner(1, 1);

    let (a, b) = tokio::join!(r.engine.start_mining(1), r.engine.start_mining(1));
    let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(wins, 1);
    assert!(matches!(a, Err(MiningError::AlreadyMining)) || matches!(b, Err(MiningError::AlreadyMining)));
    assert_eq!(r.store.active_sessions().len(), 1);
}

#[tokio::test]
async fn test_stop_on_idle_user_changes_nothing() {
    let r = rig();
    r.store.add_miner(1, 1);
    let before = r.cache.energy(1);

    let err = r.engine.stop_mining(1).await.unwrap_err();
    assert!(matches!(err, MiningError::NotMining));
    assert_eq!(err.code(), "NOT_MINING");
    assert_eq!(r.cache.energy(1), before);
    assert!(r.store.active_sessions().is_empty());
    assert!(r.cache.stats(1).is_none());
}

#[tokio::test]
async fn test_stop_forfeits_energy() {
    let r = rig();
    r.store.add_miner(1, 1);
    r.engine.start_mining(1).await.unwrap();
    r.clock.advance_ms(60_000);

    let abandoned = r.engine.stop_mining(1).await.unwrap();
    assert_eq!(abandoned.energy_reserved, 99.0);
    assert_eq!(r.cache.energy(1).unwrap().current, 901.0);
    assert!(r.store.blocks().is_empty());
    assert!(!r.cache.stats(1).unwrap().is_active);

    // a fresh session can start right away
    assert!(r.engine.start_mining(1).await.is_ok());
}

#[tokio::test]
async fn test_drained_user_is_rejected_with_amounts() {
    let r = rig();
    r.store.add_miner(1, 1);
    r.cache.put_energy(
        1,
        EnergyState { current: 98.5, max: 1000.0, last_update: Some(r.clock.now()), regen_rate: 250.0 },
    );
    let err = r.engine.start_mining(1).await.unwrap_err();
    assert_eq!(err.to_string(), "Insufficient energy. Required: 99, Available: 98.50");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_storage_outage_is_retryable_and_leaves_no_session() {
    let r = rig();
    r.store.add_miner(1, 1);
    r.store.set_offline(true);
    let err = r.engine.start_mining(1).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
    assert!(r.engine.sessions().is_empty());
}

#[tokio::test]
async fn test_notifier_outage_does_not_block_completion() {
    let r = rig();
    r.store.add_miner(1, 1);
    r.notifier.set_offline(true);
    r.engine.start_mining(1).await.unwrap();
    r.clock.advance_ms(180_000);

    let report = r.engine.sweep_completions().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(r.store.blocks().len(), 1);
    assert!(r.notifier.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_the_sweep_settles_exactly_once() {
    let r = rig();
    r.store.add_miner(1, 1);

    let mut stop_wins = 0;
    for round in 0..200 {
        r.cache.put_energy(1, EnergyState::full(1000.0, 250.0));
        r.engine.start_mining(1).await.unwrap();
        r.clock.advance_ms(180_000);
        let blocks_before = r.store.blocks().len();
        let balance_before = r.store.balance(1);

        let stop = tokio::spawn({
            let engine = r.engine.clone();
            async move { engine.stop_mining(1).await }
        });
        let sweep = tokio::spawn({
            let engine = r.engine.clone();
            async move { engine.sweep_completions().await }
        });
        let stopped = stop.await.unwrap();
        let report = sweep.await.unwrap().unwrap();

        let completed = report.completed == 1;
        assert_ne!(stopped.is_ok(), completed, "round {round}: stop={stopped:?} sweep={report:?}");
        if completed {
            assert!(matches!(stopped, Err(MiningError::NotMining)));
            assert_eq!(r.store.blocks().len(), blocks_before + 1);
        } else {
            stop_wins += 1;
            assert_eq!(r.store.blocks().len(), blocks_before, "round {round}: block recorded after stop");
            assert_eq!(r.store.balance(1), balance_before);
        }
        assert!(r.engine.sessions().is_empty());
        assert!(r.store.active_sessions().is_empty());
    }
    assert_eq!(r.store.blocks().len() + stop_wins, 200);
}

// ═══════════════════════════════════════════════════════════════════════════
// 3. Queries
// ═══════════════════════════════════════════════════════════════════════════

async fn mine_blocks(r: &Rig, user_id: i64, count: usize) {
    for _ in 0..count {
        r.engine.start_mining(user_id).await.unwrap();
        r.clock.advance_ms(180_000);
        r.engine.sweep_completions().await.unwrap();
    }
}

#[tokio::test]
async fn test_history_pages_and_clamps() {
    let r = rig();
    r.store.add_miner(1, 1);
    mine_blocks(&r, 1, 5).await;

    let history = r.engine.mining_history(1, BlockFilter::All, 0, 2).await.unwrap();
    assert_eq!(history.page, 1);
    assert_eq!(history.total, 5);
    assert_eq!(history.pages, 3);
    assert_eq!(history.blocks.len(), 2);
    assert!(history.blocks[0].mined_at > history.blocks[1].mined_at);
    assert_eq!(history.stats.total_blocks, 5);
    assert_eq!(history.stats.solo_blocks + history.stats.pool_blocks, 5);

    let clamped = r.engine.mining_history(1, BlockFilter::All, 1, 1_000).await.unwrap();
    assert_eq!(clamped.limit, 100);
}

#[tokio::test]
async fn test_leaderboard_and_recent_feed() {
    let r = rig();
    r.store.add_miner(1, 1);
    r.store.add_miner(2, 3);
    r.store.add_miner(3, 1);
    mine_blocks(&r, 1, 1).await;
    mine_blocks(&r, 2, 3).await;

    let board = r.engine.get_leaderboard(10).await.unwrap();
    assert_eq!(board.len(), 3);
    assert_eq!(board[0].user_id, 2);
    assert_eq!(board[0].blocks_mined, 3);
    assert_eq!(board[2].user_id, 3);
    assert_eq!(board[2].total_rewards, None);

    let recent = r.engine.recent_blocks(500).await.unwrap();
    assert_eq!(recent.len(), 4);
    assert_eq!(recent[0].block.user_id, 2);
    assert_eq!(recent[0].username.as_deref(), Some("miner2"));
}

#[tokio::test]
async fn test_energy_status_floors_current() {
    let r = rig();
    r.store.add_miner(1, 1);
    r.engine.start_mining(1).await.unwrap();
    r.clock.advance_ms(1_000);

    let energy = r.engine.energy_status(1).await.unwrap();
    assert_eq!(energy.current, 901);
    assert_eq!(energy.max, 1000.0);
    assert_eq!(energy.regen_rate, 250.0);
}

// ═══════════════════════════════════════════════════════════════════════════
// 4. Cleanup
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_cleanup_purges_tokens_and_prunes_history() {
    let r = rig();
    let mut config = MiningConfig::default();
    config.retained_blocks_per_user = 2;
    let engine = MiningEngine::new(config, r.store.clone(), r.cache.clone(), r.notifier.clone())
        .with_clock(r.clock.clone());

    r.store.add_miner(1, 1);
    for _ in 0..4 {
        engine.start_mining(1).await.unwrap();
        r.clock.advance_ms(180_000);
        engine.sweep_completions().await.unwrap();
    }
    r.store.add_token(1, r.clock.now() - Duration::minutes(1));
    r.store.add_token(1, r.clock.now() + Duration::days(7));

    let report = engine.cleanup().await.unwrap();
    assert_eq!(report.tokens_purged, 1);
    assert_eq!(report.blocks_pruned, 2);
    assert_eq!(r.store.token_count(), 1);
    assert_eq!(r.store.blocks().len(), 2);
}
