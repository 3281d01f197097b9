//! Market engine: the single writer over the AMM pool and live candle.
//!
//! Everything that touches `pool`/`candle`/`started` goes through one
//! [`Mutex`] — compute the candidate next state first, validate it (margin,
//! liquidity), and only then commit both the in-memory state and the
//! storage write. There is no mutate-then-revert branch: a refused trade
//! never touches `hot`.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::amm::{self, Pool};
use crate::candles::{self, Candle};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::EngineError;
use crate::logging::{self, Domain, Level};
use crate::pnl::{self, PnlCache};
use crate::seeder;
use crate::storage::{CandleRow, EngineStateRow, StateStore};

struct HotState {
    pool: Pool,
    candle: Candle,
    started: bool,
}

/// Backfill synthetic history if the stored candles don't already reach far
/// enough back. Runs once, at construction, before the pre-game price is
/// read off the tail of `candles` — the seeded rows have to already be on
/// disk for that read to see them.
fn seed_history_if_needed(cfg: &Config, store: &StateStore, now: u64) -> Result<(), EngineError> {
    if !cfg.seed_enabled {
        return Ok(());
    }
    let earliest = store
        .get_earliest_candle_ts()?
        .map(|ts| -> Result<(u64, f64), EngineError> {
            let open = store.get_candles_since(ts, 1)?.first().map(|r| r.open).unwrap_or(cfg.start_price);
            Ok((ts as u64, open))
        })
        .transpose()?;

    let mut rng = StdRng::seed_from_u64(now ^ 0x9E3779B97F4A7C15);
    if let Some(plan) = seeder::plan(cfg, now, earliest, &mut rng) {
        for c in plan.candles {
            store.upsert_candle(CandleRow { ts: c.ts as i64, open: c.open, high: c.high, low: c.low, close: c.close })?;
        }
    }
    Ok(())
}

pub struct MarketEngine {
    cfg: Config,
    store: StateStore,
    clock: Arc<dyn Clock>,
    hot: Mutex<HotState>,
    pnl_cache: PnlCache,
    ticker_stop: Mutex<Option<mpsc::Sender<()>>>,
    ticker_handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolView {
    pub x_rich: f64,
    pub y_usd: f64,
    pub k: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub started: bool,
    pub price: f64,
    pub pool: PoolView,
    pub candle: Candle,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeOutcome {
    pub side: &'static str,
    pub ts: i64,
    pub qty: f64,
    pub usd: f64,
    pub fee: f64,
    pub avg_price: f64,
    pub price_after: f64,
    pub cash_after: f64,
    pub pos_after: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeView {
    pub code: String,
    pub nick: String,
    pub cash: f64,
    pub pos: f64,
    pub price: f64,
    pub equity: f64,
    pub avg_price: f64,
    pub pnl_realized: f64,
    pub pnl_unrealized: f64,
    pub pnl_total: f64,
}

impl MarketEngine {
    pub fn new(cfg: Config, store: StateStore, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        let now = clock.now_unix();

        // Seed backward history first: on a fresh database the pre-game price
        // must track the tail of the synthetic random walk, not `start_price`
        // literally, so the pool `start_game` later seeds from has to see the
        // seeded candles already on disk.
        seed_history_if_needed(&cfg, &store, now)?;

        let saved = store.load_engine_state()?;
        let (pool, candle, started) = match saved {
            Some(s) if s.pool_x > 0.0 && s.pool_y > 0.0 => (
                Pool::new(s.pool_x, s.pool_y),
                Candle { ts: s.candle_ts, open: s.candle_open, high: s.candle_high, low: s.candle_low, close: s.candle_close },
                s.started,
            ),
            _ => {
                let price = store.get_last_candle()?.map(|c| c.close).unwrap_or(cfg.start_price);
                let bucket = (now / cfg.candle_seconds.max(1)) * cfg.candle_seconds.max(1);
                (Pool::new(0.0, 0.0), Candle::flat(bucket, price), false)
            }
        };

        let engine = Self {
            cfg,
            store,
            clock,
            hot: Mutex::new(HotState { pool, candle, started }),
            pnl_cache: PnlCache::new(),
            ticker_stop: Mutex::new(None),
            ticker_handle: Mutex::new(None),
        };
        engine.persist_state()?;
        Ok(engine)
    }

    fn persist_state(&self) -> Result<(), EngineError> {
        let hot = self.hot.lock().unwrap();
        self.store.save_engine_state(&EngineStateRow {
            pool_x: hot.pool.x,
            pool_y: hot.pool.y,
            candle_ts: hot.candle.ts as i64,
            candle_open: hot.candle.open,
            candle_high: hot.candle.high,
            candle_low: hot.candle.low,
            candle_close: hot.candle.close,
            seeded_tag: Some(seeder::seed_tag(&self.cfg)),
            started: hot.started,
        })
    }

    /// Narrow escape hatch for callers (the HTTP layer's `/api/join`) that
    /// need direct store access without duplicating player bookkeeping here.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn now_unix(&self) -> u64 {
        self.clock.now_unix()
    }

    pub fn current_price(&self) -> f64 {
        let hot = self.hot.lock().unwrap();
        if hot.pool.x > 0.0 {
            hot.pool.price()
        } else {
            hot.candle.close
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let hot = self.hot.lock().unwrap();
        let price = if hot.pool.x > 0.0 { hot.pool.price() } else { hot.candle.close };
        Snapshot {
            started: hot.started,
            price,
            pool: PoolView { x_rich: hot.pool.x, y_usd: hot.pool.y, k: hot.pool.k },
            candle: hot.candle,
        }
    }

    /// Initializes the AMM pool at the current price and flips `started`.
    /// Idempotent: calling it again once started just returns the snapshot.
    pub fn start_game(&self) -> Result<Snapshot, EngineError> {
        {
            let mut hot = self.hot.lock().unwrap();
            if !(hot.started && hot.pool.x > 0.0 && hot.pool.y > 0.0) {
                let usd_liq = self.cfg.initial_usd_liquidity.max(1000.0);
                let p0 = hot.candle.close.max(0.0001);
                let x = usd_liq / p0;
                let y = usd_liq;
                hot.pool = Pool::new(x, y);
                hot.started = true;

                let now = self.clock.now_unix();
                let cs = self.cfg.candle_seconds.max(1);
                let bucket = (now / cs) * cs;
                hot.candle = Candle::flat(bucket, hot.pool.price());
            }
        }
        self.persist_state()?;
        logging::log(Level::Info, Domain::Market, "start_game", logging::obj(&[]));
        Ok(self.snapshot())
    }

    fn equity(cash: f64, pos: f64, price: f64) -> f64 {
        cash + pos * price
    }

    fn margin_ok(&self, cash_after: f64, pos_after: f64, price_after: f64) -> bool {
        let equity = Self::equity(cash_after, pos_after, price_after);
        if equity < self.cfg.min_equity {
            return false;
        }
        if self.cfg.leverage_max <= 0.0 {
            return false;
        }
        let exposure = pos_after.abs() * price_after;
        exposure <= equity * self.cfg.leverage_max + 1e-9
    }

    /// BUY: spend `usd_in`, receive RICH from the pool. Closes an existing
    /// short automatically since `pos_after = pos + rich_out`.
    pub fn market_buy(&self, code: &str, usd_in: f64) -> Result<TradeOutcome, EngineError> {
        self.market_order(code, "BUY", usd_in)
    }

    /// SELL: deliver `rich_in` to the pool, receive USD. Allowed to go
    /// negative (opens/extends a short) subject to the margin check.
    pub fn market_sell(&self, code: &str, rich_in: f64) -> Result<TradeOutcome, EngineError> {
        self.market_order(code, "SELL", rich_in)
    }

    fn market_order(&self, code: &str, side: &'static str, qty_in: f64) -> Result<TradeOutcome, EngineError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(EngineError::Validation("code must not be empty".to_string()));
        }
        if qty_in <= 0.0 {
            return Err(EngineError::Validation("amount must be positive".to_string()));
        }

        let now = self.clock.now_unix();

        // The wallet read has to be inside the same critical section as the
        // pool mutation: two concurrent trades against one account must see
        // each other's effects, or the later `update_wallet` silently
        // clobbers the earlier trade's delta (a lost update).
        let mut hot = self.hot.lock().unwrap();
        if !hot.started {
            return Err(EngineError::NotReady);
        }
        if hot.pool.x <= 0.0 || hot.pool.y <= 0.0 {
            return Err(EngineError::Validation("pool not initialized".to_string()));
        }

        let player = self
            .store
            .get_player(code)?
            .ok_or_else(|| EngineError::NotFound(format!("no player with code {code}")))?;

        if side == "BUY" && player.cash < qty_in {
            return Err(EngineError::InsufficientFunds);
        }

        let fill = if side == "BUY" {
            amm::buy(hot.pool, qty_in, self.cfg.fee_rate)?
        } else {
            amm::sell(hot.pool, qty_in, self.cfg.fee_rate)?
        };

        let (cash_after, pos_after, trade_qty, notional) = if side == "BUY" {
            (player.cash - qty_in, player.pos + fill.amount_out, fill.amount_out, qty_in)
        } else {
            (player.cash + fill.amount_out, player.pos - qty_in, qty_in, fill.amount_out)
        };

        if !self.margin_ok(cash_after, pos_after, fill.pool_after.price()) {
            return Err(EngineError::MarginRefused("leverage exceeded".to_string()));
        }

        hot.pool = fill.pool_after;
        let roll = candles::roll(hot.candle, self.cfg.candle_seconds, now, fill.pool_after.price());
        if let Some(closed) = roll.closed {
            self.store.upsert_candle(CandleRow { ts: closed.ts as i64, open: closed.open, high: closed.high, low: closed.low, close: closed.close })?;
        }
        hot.candle = roll.current;

        self.store.update_wallet(code, cash_after, pos_after, now as i64)?;
        self.store.insert_trade(code, now as i64, side, trade_qty, fill.effective_price, notional, fill.fee, cash_after, pos_after)?;

        drop(hot);
        self.pnl_cache.invalidate(code);
        self.persist_state()?;

        logging::log(
            Level::Info,
            Domain::Trade,
            "market_order",
            logging::obj(&[("code", logging::v_str(code)), ("side", logging::v_str(side)), ("qty", logging::v_num(trade_qty))]),
        );

        Ok(TradeOutcome {
            side,
            ts: now as i64,
            qty: trade_qty,
            usd: notional,
            fee: fill.fee,
            avg_price: fill.effective_price,
            price_after: fill.pool_after.price(),
            cash_after,
            pos_after,
        })
    }

    /// PnL view for `/api/me` and the leaderboard, replaying the trade log
    /// through the short-TTL cache.
    pub fn me(&self, code: &str) -> Result<MeView, EngineError> {
        let player = self.store.get_player(code)?.ok_or_else(|| EngineError::NotFound(format!("no player with code {code}")))?;
        let last_id = self.store.last_trade_id(code)?;

        let recon = match self.pnl_cache.get(code, last_id) {
            Some(r) => r,
            None => {
                let trades = self.store.list_trades_asc(code)?;
                let r = pnl::reconstruct(&trades);
                self.pnl_cache.put(code, last_id, r);
                r
            }
        };

        let price = self.current_price();
        let unrealized = pnl::unrealized(recon.pos, recon.avg, price);
        let equity = Self::equity(player.cash, player.pos, price);

        Ok(MeView {
            code: player.code,
            nick: player.nick,
            cash: player.cash,
            pos: player.pos,
            price,
            equity,
            avg_price: recon.avg,
            pnl_realized: recon.realized,
            pnl_unrealized: unrealized,
            pnl_total: recon.realized + unrealized,
        })
    }

    pub fn leaderboard(&self, limit: i64) -> Result<Vec<MeView>, EngineError> {
        let mut players = self.store.list_players()?;
        players.truncate(limit.max(0) as usize);
        let mut views = Vec::with_capacity(players.len());
        for p in players {
            views.push(self.me(&p.code)?);
        }
        views.sort_by(|a, b| b.equity.partial_cmp(&a.equity).unwrap_or(std::cmp::Ordering::Equal));
        views.truncate(limit.max(0) as usize);
        Ok(views)
    }

    pub fn recent_trades(&self, code: &str, limit: i64) -> Result<Vec<crate::storage::TradeRow>, EngineError> {
        self.store.get_player(code)?.ok_or_else(|| EngineError::NotFound(format!("no player with code {code}")))?;
        self.store.list_recent_trades(code, limit)
    }

    pub fn candles_for_chart(&self, limit: i64, tf_seconds: u64) -> Result<Vec<candles::AggCandle>, EngineError> {
        let earliest = self.store.get_earliest_candle_ts()?.unwrap_or(0);
        let rows = self.store.get_candles_since(earliest, limit)?;
        let live = {
            let hot = self.hot.lock().unwrap();
            hot.candle
        };
        let as_candles: Vec<Candle> = rows.into_iter().map(|r| Candle { ts: r.ts as u64, open: r.open, high: r.high, low: r.low, close: r.close }).collect();
        let merged = candles::merge_live(as_candles, live);
        Ok(candles::aggregate(&merged, tf_seconds))
    }

    /// Advance the live candle without a trade, so idle periods still
    /// produce a flat candle, and sweep for stop-outs if configured.
    pub fn tick(&self) -> Result<(), EngineError> {
        let now = self.clock.now_unix();
        let price = {
            let mut hot = self.hot.lock().unwrap();
            let roll = candles::roll(hot.candle, self.cfg.candle_seconds, now, hot.candle.close);
            if let Some(closed) = roll.closed {
                self.store.upsert_candle(CandleRow { ts: closed.ts as i64, open: closed.open, high: closed.high, low: closed.low, close: closed.close })?;
            }
            hot.candle = roll.current;
            if hot.pool.x > 0.0 { hot.pool.price() } else { hot.candle.close }
        };
        self.persist_state()?;

        if self.cfg.stopout_equity > 0.0 {
            self.liquidate_if_needed(price, now as i64)?;
        }
        Ok(())
    }

    fn liquidate_if_needed(&self, mark: f64, now: i64) -> Result<(), EngineError> {
        for p in self.store.list_players()? {
            if p.pos == 0.0 {
                continue;
            }
            let equity = Self::equity(p.cash, p.pos, mark);
            if equity <= self.cfg.stopout_equity {
                let side = if p.pos > 0.0 { "SELL" } else { "BUY" };
                let qty = p.pos.abs();
                let notional = qty * mark;
                self.store.update_wallet(&p.code, 0.0, 0.0, now)?;
                self.store.insert_trade(&p.code, now, side, qty, mark, notional, 0.0, 0.0, 0.0)?;
                self.pnl_cache.invalidate(&p.code);
                logging::log(Level::Warn, Domain::Risk, "stopout", logging::obj(&[("code", logging::v_str(&p.code))]));
            }
        }
        Ok(())
    }

    /// Spawn the tick thread. Stops cleanly on drop or [`Self::stop_ticker`].
    pub fn start_ticker(self: &Arc<Self>) {
        let mut stop_guard = self.ticker_stop.lock().unwrap();
        if stop_guard.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<()>();
        *stop_guard = Some(tx);
        drop(stop_guard);

        let engine = Arc::clone(self);
        let period = std::time::Duration::from_secs_f64(engine.cfg.tick_seconds.max(0.01));
        let poll = std::time::Duration::from_millis(50);
        let handle = std::thread::spawn(move || {
            let mut elapsed = std::time::Duration::ZERO;
            loop {
                let wait = poll.min(period.saturating_sub(elapsed)).max(std::time::Duration::from_millis(1));
                match rx.recv_timeout(wait) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        elapsed += wait;
                        if elapsed >= period {
                            elapsed = std::time::Duration::ZERO;
                            if let Err(e) = engine.tick() {
                                logging::log(Level::Error, Domain::System, "tick_failed", logging::obj(&[("error", logging::v_str(&e.to_string()))]));
                            }
                        }
                    }
                }
            }
        });
        *self.ticker_handle.lock().unwrap() = Some(handle);
    }

    pub fn stop_ticker(&self) {
        if let Some(tx) = self.ticker_stop.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.ticker_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MarketEngine {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
