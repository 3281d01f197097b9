//! SQLite-backed persistence. One [`rusqlite::Connection`], opened once at
//! startup under WAL journaling, wrapped behind typed accessors so callers
//! never see a bare column name or a stringly-typed key.
//!
//! `Connection` is `Send` but not `Sync`, and `StateStore` is shared across
//! the ticker thread and every per-connection HTTP thread via `Arc`, so the
//! connection is kept behind a `Mutex` and locked for the duration of each
//! accessor rather than handed out bare.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub struct StateStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRow {
    pub code: String,
    pub nick: String,
    pub cash: f64,
    pub pos: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: i64,
    pub code: String,
    pub ts: i64,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub notional: f64,
    pub fee: f64,
    pub cash_after: f64,
    pub pos_after: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandleRow {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Persisted engine hot state, so a restart resumes the same pool/candle
/// instead of reseeding from `Config::start_price`. Replaces the original's
/// freeform `market_state(k,v)` lookups with one typed row.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStateRow {
    pub pool_x: f64,
    pub pool_y: f64,
    pub candle_ts: i64,
    pub candle_open: f64,
    pub candle_high: f64,
    pub candle_low: f64,
    pub candle_close: f64,
    pub seeded_tag: Option<String>,
    pub started: bool,
}

impl StateStore {
    pub fn open(path: &str) -> Result<Self, EngineError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Storage(format!("creating db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), EngineError> {
        self.conn.lock().unwrap().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS players (
                code TEXT PRIMARY KEY,
                nick TEXT NOT NULL,
                cash REAL NOT NULL,
                pos REAL NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL,
                ts INTEGER NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('BUY','SELL')),
                qty REAL NOT NULL,
                price REAL NOT NULL,
                notional REAL NOT NULL,
                fee REAL NOT NULL,
                cash_after REAL NOT NULL,
                pos_after REAL NOT NULL,
                FOREIGN KEY(code) REFERENCES players(code)
            );

            CREATE TABLE IF NOT EXISTS candles (
                ts INTEGER PRIMARY KEY,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS market_state (
                k TEXT PRIMARY KEY,
                v TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // -- players ----------------------------------------------------------

    /// Create the player with `initial_cash` if absent; if present, only
    /// touch `nick`/`updated_at` — never reset an existing wallet.
    pub fn upsert_player(&self, code: &str, nick: &str, initial_cash: f64, now: i64) -> Result<(), EngineError> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO players(code, nick, cash, pos, created_at, updated_at)
             VALUES(?1, ?2, ?3, 0.0, ?4, ?4)
             ON CONFLICT(code) DO UPDATE SET nick=excluded.nick, updated_at=excluded.updated_at",
            params![code, nick, initial_cash, now],
        )?;
        Ok(())
    }

    pub fn get_player(&self, code: &str) -> Result<Option<PlayerRow>, EngineError> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT code, nick, cash, pos, created_at, updated_at FROM players WHERE code = ?1",
                params![code],
                |r| {
                    Ok(PlayerRow {
                        code: r.get(0)?,
                        nick: r.get(1)?,
                        cash: r.get(2)?,
                        pos: r.get(3)?,
                        created_at: r.get(4)?,
                        updated_at: r.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
    }

    pub fn list_players(&self) -> Result<Vec<PlayerRow>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT code, nick, cash, pos, created_at, updated_at FROM players")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(PlayerRow {
                    code: r.get(0)?,
                    nick: r.get(1)?,
                    cash: r.get(2)?,
                    pos: r.get(3)?,
                    created_at: r.get(4)?,
                    updated_at: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_wallet(&self, code: &str, cash: f64, pos: f64, now: i64) -> Result<(), EngineError> {
        self.conn.lock().unwrap().execute(
            "UPDATE players SET cash=?1, pos=?2, updated_at=?3 WHERE code=?4",
            params![cash, pos, now, code],
        )?;
        Ok(())
    }

    // -- trades -------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_trade(
        &self,
        code: &str,
        ts: i64,
        side: &str,
        qty: f64,
        price: f64,
        notional: f64,
        fee: f64,
        cash_after: f64,
        pos_after: f64,
    ) -> Result<i64, EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades(code, ts, side, qty, price, notional, fee, cash_after, pos_after)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![code, ts, side, qty, price, notional, fee, cash_after, pos_after],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn map_trade_row(r: &rusqlite::Row) -> rusqlite::Result<TradeRow> {
        Ok(TradeRow {
            id: r.get(0)?,
            code: r.get(1)?,
            ts: r.get(2)?,
            side: r.get(3)?,
            qty: r.get(4)?,
            price: r.get(5)?,
            notional: r.get(6)?,
            fee: r.get(7)?,
            cash_after: r.get(8)?,
            pos_after: r.get(9)?,
        })
    }

    const TRADE_COLUMNS: &'static str = "id, code, ts, side, qty, price, notional, fee, cash_after, pos_after";

    /// All of a player's trades, ascending by id — the order PnL replay needs.
    pub fn list_trades_asc(&self, code: &str) -> Result<Vec<TradeRow>, EngineError> {
        let sql = format!("SELECT {} FROM trades WHERE code = ?1 ORDER BY id ASC", Self::TRADE_COLUMNS);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![code], Self::map_trade_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent `limit` trades, returned oldest-first for display.
    pub fn list_recent_trades(&self, code: &str, limit: i64) -> Result<Vec<TradeRow>, EngineError> {
        let sql = format!(
            "SELECT {} FROM trades WHERE code = ?1 ORDER BY id DESC LIMIT ?2",
            Self::TRADE_COLUMNS
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![code, limit], Self::map_trade_row)?.collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn last_trade_id(&self, code: &str) -> Result<i64, EngineError> {
        self.conn
            .lock()
            .unwrap()
            .query_row("SELECT COALESCE(MAX(id), 0) FROM trades WHERE code = ?1", params![code], |r| r.get(0))
            .map_err(EngineError::from)
    }

    // -- candles --------------------------------------------------------

    pub fn upsert_candle(&self, c: CandleRow) -> Result<(), EngineError> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO candles(ts, open, high, low, close) VALUES(?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(ts) DO UPDATE SET open=excluded.open, high=excluded.high,
               low=excluded.low, close=excluded.close",
            params![c.ts, c.open, c.high, c.low, c.close],
        )?;
        Ok(())
    }

    fn map_candle_row(r: &rusqlite::Row) -> rusqlite::Result<CandleRow> {
        Ok(CandleRow { ts: r.get(0)?, open: r.get(1)?, high: r.get(2)?, low: r.get(3)?, close: r.get(4)? })
    }

    pub fn get_last_candle(&self) -> Result<Option<CandleRow>, EngineError> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT ts, open, high, low, close FROM candles ORDER BY ts DESC LIMIT 1",
                [],
                Self::map_candle_row,
            )
            .optional()
            .map_err(EngineError::from)
    }

    pub fn get_earliest_candle_ts(&self) -> Result<Option<i64>, EngineError> {
        self.conn
            .lock()
            .unwrap()
            .query_row("SELECT MIN(ts) FROM candles", [], |r| r.get(0))
            .map_err(EngineError::from)
    }

    pub fn get_candles_since(&self, ts_from: i64, limit: i64) -> Result<Vec<CandleRow>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT ts, open, high, low, close FROM candles WHERE ts >= ?1 ORDER BY ts ASC LIMIT ?2")?;
        let rows = stmt.query_map(params![ts_from, limit], Self::map_candle_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- engine state -----------------------------------------------------

    const STATE_KEY: &'static str = "engine";

    pub fn load_engine_state(&self) -> Result<Option<EngineStateRow>, EngineError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT v FROM market_state WHERE k = ?1", params![Self::STATE_KEY], |r| r.get(0))
            .optional()?;
        match raw {
            None => Ok(None),
            Some(json) => {
                let wire: WireEngineState = serde_json::from_str(&json)
                    .map_err(|e| EngineError::Storage(format!("decoding engine state: {e}")))?;
                Ok(Some(wire.into()))
            }
        }
    }

    pub fn save_engine_state(&self, state: &EngineStateRow) -> Result<(), EngineError> {
        let wire = WireEngineState::from(state.clone());
        let json = serde_json::to_string(&wire)
            .map_err(|e| EngineError::Storage(format!("encoding engine state: {e}")))?;
        self.conn.lock().unwrap().execute(
            "INSERT INTO market_state(k, v) VALUES(?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v=excluded.v",
            params![Self::STATE_KEY, json],
        )?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct WireEngineState {
    pool_x: f64,
    pool_y: f64,
    candle_ts: i64,
    candle_open: f64,
    candle_high: f64,
    candle_low: f64,
    candle_close: f64,
    seeded_tag: Option<String>,
    started: bool,
}

impl From<EngineStateRow> for WireEngineState {
    fn from(s: EngineStateRow) -> Self {
        Self {
            pool_x: s.pool_x,
            pool_y: s.pool_y,
            candle_ts: s.candle_ts,
            candle_open: s.candle_open,
            candle_high: s.candle_high,
            candle_low: s.candle_low,
            candle_close: s.candle_close,
            seeded_tag: s.seeded_tag,
            started: s.started,
        }
    }
}

impl From<WireEngineState> for EngineStateRow {
    fn from(w: WireEngineState) -> Self {
        Self {
            pool_x: w.pool_x,
            pool_y: w.pool_y,
            candle_ts: w.candle_ts,
            candle_open: w.candle_open,
            candle_high: w.candle_high,
            candle_low: w.candle_low,
            candle_close: w.candle_close,
            seeded_tag: w.seeded_tag,
            started: w.started,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_player_does_not_reset_existing_wallet() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_player("alice01", "Alice", 10_000.0, 1000).unwrap();
        store.update_wallet("alice01", 9_500.0, 5.0, 1001).unwrap();
        store.upsert_player("alice01", "Alice2", 10_000.0, 1002).unwrap();
        let p = store.get_player("alice01").unwrap().unwrap();
        assert_eq!(p.nick, "Alice2");
        assert_eq!(p.cash, 9_500.0);
        assert_eq!(p.pos, 5.0);
    }

    #[test]
    fn trade_round_trip_and_ordering() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_player("alice01", "Alice", 10_000.0, 1000).unwrap();
        let id1 = store.insert_trade("alice01", 1000, "BUY", 5.0, 100.0, 500.0, 0.0, 9_500.0, 5.0).unwrap();
        let id2 = store.insert_trade("alice01", 1001, "SELL", 2.0, 101.0, 202.0, 0.0, 9_702.0, 3.0).unwrap();
        assert!(id2 > id1);
        let trades = store.list_trades_asc("alice01").unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].id, id1);
        assert_eq!(store.last_trade_id("alice01").unwrap(), id2);
    }

    #[test]
    fn candle_upsert_overwrites_same_bucket() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_candle(CandleRow { ts: 60, open: 100.0, high: 101.0, low: 99.0, close: 100.5 }).unwrap();
        store.upsert_candle(CandleRow { ts: 60, open: 100.0, high: 105.0, low: 98.0, close: 103.0 }).unwrap();
        let last = store.get_last_candle().unwrap().unwrap();
        assert_eq!(last.high, 105.0);
        assert_eq!(last.low, 98.0);
    }

    #[test]
    fn engine_state_round_trips() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.load_engine_state().unwrap().is_none());
        let state = EngineStateRow {
            pool_x: 2000.0,
            pool_y: 200_000.0,
            candle_ts: 60,
            candle_open: 100.0,
            candle_high: 100.0,
            candle_low: 100.0,
            candle_close: 100.0,
            seeded_tag: Some("v1:7d:60s".to_string()),
            started: true,
        };
        store.save_engine_state(&state).unwrap();
        let loaded = store.load_engine_state().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn get_candles_since_filters_and_orders() {
        let store = StateStore::open_in_memory().unwrap();
        for ts in [0, 60, 120, 180] {
            store.upsert_candle(CandleRow { ts, open: 100.0, high: 100.0, low: 100.0, close: 100.0 }).unwrap();
        }
        let rows = store.get_candles_since(60, 100).unwrap();
        assert_eq!(rows.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![60, 120, 180]);
        assert_eq!(store.get_earliest_candle_ts().unwrap(), Some(0));
    }
}
