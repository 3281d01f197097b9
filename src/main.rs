use std::sync::Arc;

use trading_arena::config::Config;
use trading_arena::clock::{Clock, SystemClock};
use trading_arena::engine::MarketEngine;
use trading_arena::http;
use trading_arena::logging::{self, obj, v_num, v_str, Domain, Level};
use trading_arena::storage::StateStore;

fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env();
    logging::log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("bind_addr", v_str(&cfg.bind_addr)),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("candle_seconds", v_num(cfg.candle_seconds as f64)),
        ]),
    );

    let store = StateStore::open(&cfg.sqlite_path)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(MarketEngine::new(cfg.clone(), store, clock)?);
    engine.start_ticker();

    logging::log(Level::Info, Domain::System, "ticker_started", obj(&[]));

    http::serve(Arc::new(cfg), engine)?;
    Ok(())
}
