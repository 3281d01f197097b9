//! Pure replay of a player's trade log into (avg cost basis, realized PnL,
//! position), plus a short-TTL memoization cache so hot paths (`/api/me`,
//! `/api/leaderboard`) don't re-walk the whole trade log on every request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::storage::TradeRow;

const FLAT_EPSILON: f64 = 1e-12;
const CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconstruction {
    pub avg: f64,
    pub realized: f64,
    pub pos: f64,
}

/// Fold a player's trades, in ascending `id` order, into the current
/// position / cost basis / realized PnL. Long+short crossings are handled by
/// covering the existing side first, then flipping into the remainder.
pub fn reconstruct(trades: &[TradeRow]) -> Reconstruction {
    let mut pos = 0.0_f64;
    let mut avg = 0.0_f64;
    let mut realized = 0.0_f64;

    for t in trades {
        match t.side.as_str() {
            "BUY" => {
                if pos >= 0.0 {
                    let new_pos = pos + t.qty;
                    avg = if new_pos != 0.0 { (pos * avg + t.qty * t.price) / new_pos } else { 0.0 };
                    pos = new_pos;
                } else {
                    let cover = t.qty.min(-pos);
                    realized += (avg - t.price) * cover;
                    pos += cover;
                    let leftover = t.qty - cover;
                    if pos.abs() < FLAT_EPSILON {
                        pos = 0.0;
                        avg = 0.0;
                    }
                    if leftover > 0.0 {
                        pos = leftover;
                        avg = t.price;
                    }
                }
                realized -= t.fee;
            }
            "SELL" => {
                if pos <= 0.0 {
                    let new_pos = pos - t.qty;
                    let abs_old = pos.abs();
                    let abs_new = new_pos.abs();
                    avg = if abs_new != 0.0 { (abs_old * avg + t.qty * t.price) / abs_new } else { 0.0 };
                    pos = new_pos;
                } else {
                    let close = t.qty.min(pos);
                    realized += (t.price - avg) * close;
                    pos -= close;
                    let leftover = t.qty - close;
                    if pos.abs() < FLAT_EPSILON {
                        pos = 0.0;
                        avg = 0.0;
                    }
                    if leftover > 0.0 {
                        pos = -leftover;
                        avg = t.price;
                    }
                }
                realized -= t.fee;
            }
            _ => {}
        }
    }

    Reconstruction { avg, realized, pos }
}

/// Unrealized PnL against the current mark.
pub fn unrealized(pos: f64, avg: f64, price: f64) -> f64 {
    if pos > 0.0 {
        (price - avg) * pos
    } else if pos < 0.0 {
        (avg - price) * pos.abs()
    } else {
        0.0
    }
}

struct CacheEntry {
    last_trade_id: i64,
    result: Reconstruction,
    computed_at: Instant,
}

/// Keyed, short-TTL memoization over [`reconstruct`]. A trade commit must
/// call [`PnlCache::invalidate`] for the affected player before releasing the
/// engine lock, or a read within the TTL window could observe a stale
/// position.
pub struct PnlCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl PnlCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Returns a cached result if it's fresh and the player has not traded
    /// since it was computed, else `None`.
    pub fn get(&self, code: &str, last_trade_id: i64) -> Option<Reconstruction> {
        let entries = self.entries.lock().unwrap();
        entries.get(code).and_then(|e| {
            if e.last_trade_id == last_trade_id && e.computed_at.elapsed() < CACHE_TTL {
                Some(e.result)
            } else {
                None
            }
        })
    }

    pub fn put(&self, code: &str, last_trade_id: i64, result: Reconstruction) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            code.to_string(),
            CacheEntry { last_trade_id, result, computed_at: Instant::now() },
        );
    }

    pub fn invalidate(&self, code: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(code);
    }
}

impl Default for PnlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(id: i64, side: &str, qty: f64, price: f64, fee: f64) -> TradeRow {
        TradeRow {
            id,
            code: "alice01".to_string(),
            ts: 0,
            side: side.to_string(),
            qty,
            price,
            notional: qty * price,
            fee,
            cash_after: 0.0,
            pos_after: 0.0,
        }
    }

    #[test]
    fn s6_replay_over_flip() {
        let trades = vec![trade(1, "BUY", 5.0, 100.0, 0.0), trade(2, "SELL", 8.0, 110.0, 0.0)];
        let r = reconstruct(&trades);
        assert!((r.pos - (-3.0)).abs() < 1e-9);
        assert!((r.avg - 110.0).abs() < 1e-9);
        assert!((r.realized - 50.0).abs() < 1e-9);
    }

    #[test]
    fn s2_short_then_cover_zeroes_out() {
        let trades = vec![trade(1, "SELL", 10.0, 99.5025, 0.0), trade(2, "BUY", 10.0, 99.5025, 0.0)];
        let r = reconstruct(&trades);
        assert!(r.pos.abs() < 1e-9);
        assert!(r.avg.abs() < 1e-9);
    }

    #[test]
    fn avg_is_never_negative() {
        let trades = vec![
            trade(1, "BUY", 5.0, 100.0, 1.0),
            trade(2, "SELL", 3.0, 95.0, 1.0),
            trade(3, "SELL", 10.0, 90.0, 1.0),
        ];
        let r = reconstruct(&trades);
        assert!(r.avg >= 0.0);
        if r.pos == 0.0 {
            assert_eq!(r.avg, 0.0);
        }
    }

    #[test]
    fn unrealized_pnl_sign_by_side() {
        assert!((unrealized(10.0, 100.0, 110.0) - 100.0).abs() < 1e-9);
        assert!((unrealized(-10.0, 100.0, 90.0) - 100.0).abs() < 1e-9);
        assert_eq!(unrealized(0.0, 0.0, 123.0), 0.0);
    }

    #[test]
    fn cache_hits_until_trade_id_changes() {
        let cache = PnlCache::new();
        assert!(cache.get("alice01", 5).is_none());
        cache.put("alice01", 5, Reconstruction { avg: 1.0, realized: 2.0, pos: 3.0 });
        assert!(cache.get("alice01", 5).is_some());
        assert!(cache.get("alice01", 6).is_none());
    }

    #[test]
    fn invalidate_clears_entry() {
        let cache = PnlCache::new();
        cache.put("alice01", 5, Reconstruction { avg: 1.0, realized: 2.0, pos: 3.0 });
        cache.invalidate("alice01");
        assert!(cache.get("alice01", 5).is_none());
    }
}
