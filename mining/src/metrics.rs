use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static SESSIONS_STARTED: OnceLock<IntCounter> = OnceLock::new();
static SESSIONS_STOPPED: OnceLock<IntCounter> = OnceLock::new();
static START_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_MINED: OnceLock<IntCounter> = OnceLock::new();
static SOLO_BLOCKS: OnceLock<IntCounter> = OnceLock::new();
static REWARDS_MINTED: OnceLock<IntCounter> = OnceLock::new();
static TREASURY_FEES: OnceLock<IntCounter> = OnceLock::new();
static STORAGE_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static COMPLETION_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static ENERGY_REGENERATED_USERS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();

fn sessions_started() -> &'static IntCounter {
    SESSIONS_STARTED.get_or_init(|| {
        IntCounter::new("mining_sessions_started_total", "Mining sessions started").unwrap()
    })
}

fn sessions_stopped() -> &'static IntCounter {
    SESSIONS_STOPPED.get_or_init(|| {
        IntCounter::new("mining_sessions_stopped_total", "Mining sessions stopped by the user").unwrap()
    })
}

fn start_rejected() -> &'static IntCounter {
    START_REJECTED.get_or_init(|| {
        IntCounter::new("mining_start_rejected_total", "Start requests rejected").unwrap()
    })
}

fn blocks_mined() -> &'static IntCounter {
    BLOCKS_MINED.get_or_init(|| IntCounter::new("mining_blocks_mined_total", "Blocks mined").unwrap())
}

fn solo_blocks() -> &'static IntCounter {
    SOLO_BLOCKS.get_or_init(|| IntCounter::new("mining_solo_blocks_total", "Solo blocks mined").unwrap())
}

fn rewards_minted() -> &'static IntCounter {
    REWARDS_MINTED.get_or_init(|| {
        IntCounter::new(
            "mining_rewards_minted_total",
            "Net rewards credited to users (smallest units)",
        )
        .unwrap()
    })
}

fn treasury_fees() -> &'static IntCounter {
    TREASURY_FEES.get_or_init(|| {
        IntCounter::new(
            "mining_treasury_fees_total",
            "Treasury share withheld from rewards (smallest units)",
        )
        .unwrap()
    })
}

fn storage_errors() -> &'static IntCounter {
    STORAGE_ERRORS.get_or_init(|| {
        IntCounter::new("mining_storage_errors_total", "Durable store / cache failures").unwrap()
    })
}

fn completion_failures() -> &'static IntCounter {
    COMPLETION_FAILURES.get_or_init(|| {
        IntCounter::new(
            "mining_completion_failures_total",
            "Completions left for the next sweep after a failure",
        )
        .unwrap()
    })
}

fn energy_regenerated_users() -> &'static IntCounter {
    ENERGY_REGENERATED_USERS.get_or_init(|| {
        IntCounter::new(
            "mining_energy_regenerated_users_total",
            "Energy states refreshed by the regeneration task",
        )
        .unwrap()
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| IntGauge::new("mining_active_sessions", "Live mining sessions").unwrap())
}

pub fn inc_sessions_started() {
    sessions_started().inc();
}

pub fn inc_sessions_stopped() {
    sessions_stopped().inc();
}

pub fn inc_start_rejected() {
    start_rejected().inc();
}

pub fn record_block(user_reward: u64, treasury_fee: u64, is_solo: bool) {
    blocks_mined().inc();
    if is_solo {
        solo_blocks().inc();
    }
    rewards_minted().inc_by(user_reward);
    treasury_fees().inc_by(treasury_fee);
}

pub fn inc_storage_errors() {
    storage_errors().inc();
}

pub fn inc_completion_failures() {
    completion_failures().inc();
}

pub fn inc_energy_regenerated_by(n: u64) {
    energy_regenerated_users().inc_by(n);
}

pub fn set_active_sessions(n: usize) {
    active_sessions().set(n as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(sessions_started().collect());
    mfs.extend(sessions_stopped().collect());
    mfs.extend(start_rejected().collect());
    mfs.extend(blocks_mined().collect());
    mfs.extend(solo_blocks().collect());
    mfs.extend(rewards_minted().collect());
    mfs.extend(treasury_fees().collect());
    mfs.extend(storage_errors().collect());
    mfs.extend(completion_failures().collect());
    mfs.extend(energy_regenerated_users().collect());
    mfs.extend(active_sessions().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
