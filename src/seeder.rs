//! Backward-extending synthetic history, so a freshly started arena has a
//! week of chart to scroll through instead of one flat candle. Seeding never
//! touches the AMM pool and never writes trades — it only fills `candles`
//! rows older than whatever is already on disk.

use rand::Rng;

use crate::candles::Candle;
use crate::config::Config;

/// Encodes every knob that changes the synthetic series, so a config change
/// is detected and the backfill re-runs instead of silently keeping stale
/// history around.
pub fn seed_tag(cfg: &Config) -> String {
    format!(
        "v2|secs={}|cs={}|step={:.8}|p0={:.6}",
        cfg.seed_seconds, cfg.seed_candle_seconds, cfg.seed_step_pct, cfg.start_price
    )
}

pub struct SeedPlan {
    /// Candles to insert, oldest first, covering `[target_start, end_ts)`.
    pub candles: Vec<Candle>,
    pub tag: String,
}

/// Compute the backfill needed given `now` and whatever the earliest stored
/// candle (and its open price, as the walk's anchor) currently is. Returns
/// `None` when existing history already reaches back far enough — the tag
/// still gets refreshed by the caller in that case.
pub fn plan<R: Rng + ?Sized>(
    cfg: &Config,
    now: u64,
    earliest: Option<(u64, f64)>,
    rng: &mut R,
) -> Option<SeedPlan> {
    if !cfg.seed_enabled {
        return None;
    }

    let seed_cs = cfg.seed_candle_seconds.max(1);
    let target_start = now.saturating_sub(cfg.seed_seconds);
    let target_start = (target_start / seed_cs) * seed_cs;

    if let Some((earliest_ts, _)) = earliest {
        if earliest_ts <= target_start {
            return None;
        }
    }

    let end_ts = earliest.map(|(ts, _)| ts).unwrap_or((now / seed_cs) * seed_cs);
    let mut last_close = earliest.map(|(_, open)| open).unwrap_or(cfg.start_price);

    let mut candles = Vec::new();
    let mut ts = target_start;
    while ts < end_ts {
        let step = rng.gen_range(-1.0..1.0) * cfg.seed_step_pct;
        let mean_reversion = (cfg.start_price - last_close) / cfg.start_price * 0.015;
        let ret = step + mean_reversion;
        let close = (last_close * (1.0 + ret)).max(0.0001);

        let open = last_close;
        let high = open.max(close);
        let low = open.min(close);
        candles.push(Candle { ts, open, high, low, close });

        last_close = close;
        ts += seed_cs;
    }

    Some(SeedPlan { candles, tag: seed_tag(cfg) })
}
