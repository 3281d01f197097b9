use std::sync::Arc;

use tempfile::tempdir;

use trading_arena::clock::{Clock, ManualClock};
use trading_arena::config::Config;
use trading_arena::engine::MarketEngine;
use trading_arena::storage::StateStore;

fn seeding_config(db_path: &str) -> Config {
    Config {
        candle_seconds: 1,
        tick_seconds: 1.0,
        start_price: 100.0,
        initial_usd_liquidity: 200_000.0,
        fee_rate: 0.0,
        min_equity: 0.0,
        leverage_max: 3.0,
        stopout_equity: 0.0,
        seed_enabled: true,
        seed_seconds: 3_600,
        seed_candle_seconds: 60,
        seed_step_pct: 0.0007,
        initial_cash: 10_000.0,
        sqlite_path: db_path.to_string(),
        bind_addr: "0.0.0.0:0".to_string(),
        allowed_origins: vec![],
    }
}

#[test]
fn s4_fresh_arena_backfills_visible_history_on_first_boot() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("arena.db");
    let db_path = db_path.to_str().unwrap();

    let store = StateStore::open(db_path).unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_010_000));
    let _engine = MarketEngine::new(seeding_config(db_path), store, clock).unwrap();

    // Reopen the DB directly to inspect what the engine persisted.
    let verify_store = StateStore::open(db_path).unwrap();
    let earliest = verify_store.get_earliest_candle_ts().unwrap();
    assert!(earliest.is_some());
    assert!(earliest.unwrap() <= 1_700_010_000 - 3_600 + 60);

    let rows = verify_store.get_candles_since(0, 10_000).unwrap();
    assert!(!rows.is_empty());
    for r in &rows {
        assert!(r.low <= r.open.min(r.close));
        assert!(r.open.max(r.close) <= r.high);
    }
}

#[test]
fn reboot_does_not_duplicate_or_destroy_seeded_history() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("arena.db");
    let db_path = db_path.to_str().unwrap();

    {
        let store = StateStore::open(db_path).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_010_000));
        let _engine = MarketEngine::new(seeding_config(db_path), store, clock).unwrap();
    }

    let count_after_first_boot = {
        let store = StateStore::open(db_path).unwrap();
        store.get_candles_since(0, 100_000).unwrap().len()
    };

    {
        let store = StateStore::open(db_path).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_010_005));
        let _engine = MarketEngine::new(seeding_config(db_path), store, clock).unwrap();
    }

    let count_after_second_boot = {
        let store = StateStore::open(db_path).unwrap();
        store.get_candles_since(0, 100_000).unwrap().len()
    };

    assert_eq!(count_after_first_boot, count_after_second_boot);
}
