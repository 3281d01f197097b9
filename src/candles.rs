//! Candle rollover and timeframe aggregation. Both are pure functions of
//! their inputs — no lock, no store — so they're testable without a
//! [`crate::engine::MarketEngine`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn flat(ts: u64, price: f64) -> Self {
        Self { ts, open: price, high: price, low: price, close: price }
    }

    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high && self.low <= self.high
    }
}

/// Outcome of touching the live candle with a new price observation.
pub struct RollResult {
    /// The previous candle, if the bucket just rolled over and it must be
    /// upserted into storage before the new one replaces it.
    pub closed: Option<Candle>,
    pub current: Candle,
}

/// Advance the live candle given a new price at wall time `now_s`, bucketed
/// to `candle_seconds`-wide buckets. Grounded on the original
/// `_touch_candle`: same bucket, update close/high/low in place; new bucket,
/// close the old candle and open a flat one at `price`.
pub fn roll(current: Candle, candle_seconds: u64, now_s: u64, price: f64) -> RollResult {
    let cs = candle_seconds.max(1);
    let bucket = (now_s / cs) * cs;

    if bucket == current.ts {
        let mut updated = current;
        updated.close = price;
        updated.high = updated.high.max(price);
        updated.low = updated.low.min(price);
        RollResult { closed: None, current: updated }
    } else {
        RollResult { closed: Some(current), current: Candle::flat(bucket, price) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggCandle {
    pub time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Group ascending 1s (or whatever the storage granularity is) candles into
/// `tf`-second buckets. `rows` must already be sorted ascending by `ts`.
pub fn aggregate(rows: &[Candle], tf_seconds: u64) -> Vec<AggCandle> {
    if rows.is_empty() {
        return Vec::new();
    }
    let tf = tf_seconds.max(1);
    let mut out: Vec<AggCandle> = Vec::new();
    let mut cur: Option<AggCandle> = None;

    for r in rows {
        let bucket = (r.ts / tf) * tf;
        match &mut cur {
            None => {
                cur = Some(AggCandle { time: bucket, open: r.open, high: r.high, low: r.low, close: r.close });
            }
            Some(acc) if acc.time == bucket => {
                acc.high = acc.high.max(r.high);
                acc.low = acc.low.min(r.low);
                acc.close = r.close;
            }
            Some(acc) => {
                out.push(*acc);
                cur = Some(AggCandle { time: bucket, open: r.open, high: r.high, low: r.low, close: r.close });
            }
        }
    }
    if let Some(acc) = cur {
        out.push(acc);
    }
    out
}

/// Merge the live in-flight candle into an ascending stream of closed
/// candles before aggregation, so the most recent bucket reflects unseen
/// state. If `live.ts` matches the last stored row, it replaces it.
pub fn merge_live(mut rows: Vec<Candle>, live: Candle) -> Vec<Candle> {
    if let Some(last) = rows.last_mut() {
        if last.ts == live.ts {
            *last = live;
            return rows;
        }
    }
    rows.push(live);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bucket_extends_high_low() {
        let c = Candle::flat(1000, 100.0);
        let r = roll(c, 1, 1000, 103.0);
        assert!(r.closed.is_none());
        assert_eq!(r.current.close, 103.0);
        assert_eq!(r.current.high, 103.0);
        assert_eq!(r.current.low, 100.0);

        let r2 = roll(r.current, 1, 1000, 95.0);
        assert_eq!(r2.current.low, 95.0);
        assert_eq!(r2.current.high, 103.0);
    }

    #[test]
    fn new_bucket_closes_previous() {
        let c = Candle::flat(1000, 100.0);
        let r = roll(c, 1, 1001, 102.0);
        assert_eq!(r.closed, Some(c));
        assert_eq!(r.current, Candle::flat(1001, 102.0));
    }

    #[test]
    fn s4_rollover_without_trades_produces_flat_candles() {
        // 5 consecutive seconds with no price change must all be flat.
        let mut current = Candle::flat(1000, 100.0);
        let mut closed = Vec::new();
        for t in 1001..=1005 {
            let r = roll(current, 1, t, 100.0);
            if let Some(c) = r.closed {
                closed.push(c);
            }
            current = r.current;
        }
        closed.push(current);
        assert_eq!(closed.len(), 6);
        for c in &closed {
            assert_eq!(c.open, 100.0);
            assert_eq!(c.high, 100.0);
            assert_eq!(c.low, 100.0);
            assert_eq!(c.close, 100.0);
        }
    }

    fn linear_candles(n: u64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle { ts: i, open: 100.0 + i as f64, high: 100.5 + i as f64, low: 99.5 + i as f64, close: 100.2 + i as f64 })
            .collect()
    }

    #[test]
    fn s5_aggregation_groups_by_timeframe() {
        let rows = linear_candles(300);
        let agg = aggregate(&rows, 60);
        assert_eq!(agg.len(), 5);
        for (i, bucket) in agg.iter().enumerate() {
            let start = (i as u64) * 60;
            assert_eq!(bucket.time, start);
            assert_eq!(bucket.open, rows[start as usize].open);
            assert_eq!(bucket.close, rows[(start + 59) as usize].close);
            let expected_high = rows[start as usize..(start + 60) as usize]
                .iter()
                .fold(f64::MIN, |acc, c| acc.max(c.high));
            assert_eq!(bucket.high, expected_high);
        }
    }

    #[test]
    fn aggregation_idempotent_at_tf_one() {
        let rows = linear_candles(10);
        let agg = aggregate(&rows, 1);
        assert_eq!(agg.len(), rows.len());
        for (a, r) in agg.iter().zip(rows.iter()) {
            assert_eq!(a.time, r.ts);
            assert_eq!(a.open, r.open);
            assert_eq!(a.high, r.high);
            assert_eq!(a.low, r.low);
            assert_eq!(a.close, r.close);
        }
    }

    #[test]
    fn reaggregation_is_a_fixed_point() {
        let rows = linear_candles(300);
        let once = aggregate(&rows, 60);
        let as_candles: Vec<Candle> = once
            .iter()
            .map(|a| Candle { ts: a.time, open: a.open, high: a.high, low: a.low, close: a.close })
            .collect();
        let twice = aggregate(&as_candles, 60);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn well_formedness_holds() {
        let c = Candle { ts: 0, open: 100.0, high: 105.0, low: 95.0, close: 102.0 };
        assert!(c.is_well_formed());
        let bad = Candle { ts: 0, open: 100.0, high: 99.0, low: 95.0, close: 102.0 };
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn merge_live_replaces_matching_bucket() {
        let rows = vec![Candle::flat(0, 100.0), Candle::flat(60, 101.0)];
        let live = Candle { ts: 60, open: 101.0, high: 103.0, low: 101.0, close: 102.0 };
        let merged = merge_live(rows, live);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], live);
    }

    #[test]
    fn merge_live_appends_new_bucket() {
        let rows = vec![Candle::flat(0, 100.0)];
        let live = Candle::flat(60, 101.0);
        let merged = merge_live(rows, live);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], live);
    }
}
