//! Pure constant-product AMM kernel. No locks, no storage — just reserves in,
//! reserves out, so it can be exhaustively unit-tested in isolation.

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pool {
    pub x: f64, // RICH reserve
    pub y: f64, // USD reserve
    pub k: f64,
}

impl Pool {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, k: x * y }
    }

    pub fn price(&self) -> f64 {
        self.y / self.x
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmmFill {
    pub pool_after: Pool,
    pub amount_out: f64,
    pub fee: f64,
    pub effective_price: f64,
}

/// USD in -> RICH out. Fee is taken off the input before it touches reserves.
pub fn buy(pool: Pool, usd_in: f64, fee_rate: f64) -> Result<AmmFill, EngineError> {
    if usd_in <= 0.0 {
        return Err(EngineError::Validation("usd_in must be positive".to_string()));
    }

    let fee = usd_in * fee_rate;
    let usd_effective = usd_in - fee;
    if usd_effective <= 0.0 {
        return Err(EngineError::FeeUnderflow);
    }

    let y_new = pool.y + usd_effective;
    let x_new = pool.k / y_new;
    let rich_out = pool.x - x_new;

    if rich_out <= 0.0 || x_new <= 0.0 {
        return Err(EngineError::InsufficientLiquidity);
    }

    let pool_after = Pool { x: x_new, y: y_new, k: x_new * y_new };
    Ok(AmmFill {
        pool_after,
        amount_out: rich_out,
        fee,
        effective_price: usd_effective / rich_out,
    })
}

/// RICH in -> USD out. Fee is taken off the gross output.
pub fn sell(pool: Pool, rich_in: f64, fee_rate: f64) -> Result<AmmFill, EngineError> {
    if rich_in <= 0.0 {
        return Err(EngineError::Validation("rich_in must be positive".to_string()));
    }

    let x_new = pool.x + rich_in;
    let y_new = pool.k / x_new;
    let usd_out_gross = pool.y - y_new;

    if usd_out_gross <= 0.0 || y_new <= 0.0 {
        return Err(EngineError::InsufficientLiquidity);
    }

    let fee = usd_out_gross * fee_rate;
    let usd_out = usd_out_gross - fee;
    if usd_out <= 0.0 {
        return Err(EngineError::FeeUnderflow);
    }

    let pool_after = Pool { x: x_new, y: y_new, k: x_new * y_new };
    Ok(AmmFill {
        pool_after,
        amount_out: usd_out,
        fee,
        effective_price: usd_out / rich_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_pool() -> Pool {
        // S1/S2 fixture: start_price=100, initial_usd_liquidity=200000
        Pool::new(2000.0, 200_000.0)
    }

    #[test]
    fn s1_open_long() {
        let pool = seed_pool();
        let fill = buy(pool, 1000.0, 0.0).unwrap();
        assert!((fill.pool_after.y - 201_000.0).abs() < 1e-6);
        assert!((fill.pool_after.x - 1990.0498).abs() < 1e-3);
        assert!((fill.amount_out - 9.9502).abs() < 1e-3);
        assert!((fill.pool_after.price() - 101.0025).abs() < 1e-2);
    }

    #[test]
    fn s2_open_short_then_cover() {
        let pool = seed_pool();
        let fill = sell(pool, 10.0, 0.0).unwrap();
        assert!((fill.pool_after.x - 2010.0).abs() < 1e-6);
        assert!((fill.pool_after.y - 199_004.975).abs() < 1e-2);
        assert!((fill.amount_out - 995.025).abs() < 1e-2);
    }

    #[test]
    fn buy_rejects_nonpositive_input() {
        let pool = seed_pool();
        assert!(matches!(buy(pool, 0.0, 0.0), Err(EngineError::Validation(_))));
        assert!(matches!(buy(pool, -5.0, 0.0), Err(EngineError::Validation(_))));
    }

    #[test]
    fn buy_rejects_fee_underflow() {
        let pool = seed_pool();
        // fee_rate = 1.0 consumes the entire input.
        assert!(matches!(buy(pool, 100.0, 1.0), Err(EngineError::FeeUnderflow)));
    }

    #[test]
    fn sell_rejects_nonpositive_input() {
        let pool = seed_pool();
        assert!(matches!(sell(pool, 0.0, 0.0), Err(EngineError::Validation(_))));
    }

    #[test]
    fn conservation_holds_after_buy() {
        let pool = seed_pool();
        let k_before = pool.x * pool.y;
        let fill = buy(pool, 2500.0, 0.001).unwrap();
        let k_after = fill.pool_after.x * fill.pool_after.y;
        let drift = (k_after - k_before).abs() / k_before;
        assert!(drift <= 1e-6, "k drifted by {}", drift);
        assert!((fill.pool_after.price() - fill.pool_after.y / fill.pool_after.x).abs() < 1e-9);
    }

    #[test]
    fn conservation_holds_after_sell() {
        let pool = seed_pool();
        let k_before = pool.x * pool.y;
        let fill = sell(pool, 50.0, 0.001).unwrap();
        let k_after = fill.pool_after.x * fill.pool_after.y;
        let drift = (k_after - k_before).abs() / k_before;
        assert!(drift <= 1e-6, "k drifted by {}", drift);
    }

    #[test]
    fn buy_then_sell_roundtrip_loses_to_fees() {
        let pool = seed_pool();
        let buy_fill = buy(pool, 1000.0, 0.01).unwrap();
        let sell_fill = sell(buy_fill.pool_after, buy_fill.amount_out, 0.01).unwrap();
        // With fees, selling straight back nets less than the original 1000.
        assert!(sell_fill.amount_out < 1000.0);
    }
}
