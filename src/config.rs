//! Process configuration, loaded once from the environment at startup.
//!
//! Every field follows the teacher's `Config::from_env` idiom: read the env
//! var, parse it, fall back to a hard-coded default on absence or parse
//! failure.

#[derive(Debug, Clone)]
pub struct Config {
    pub candle_seconds: u64,
    pub tick_seconds: f64,
    pub start_price: f64,
    pub initial_usd_liquidity: f64,
    pub fee_rate: f64,
    pub min_equity: f64,
    pub leverage_max: f64,
    pub stopout_equity: f64,
    pub seed_enabled: bool,
    pub seed_seconds: u64,
    pub seed_candle_seconds: u64,
    pub seed_step_pct: f64,
    pub initial_cash: f64,
    pub sqlite_path: String,
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            candle_seconds: env_or("CANDLE_SECONDS", 1),
            tick_seconds: env_or("TICK_SECONDS", 1.0),
            start_price: env_or("START_PRICE", 100.0),
            initial_usd_liquidity: env_or("INITIAL_USD_LIQUIDITY", 200_000.0),
            fee_rate: env_or("FEE_RATE", 0.0),
            min_equity: env_or("MIN_EQUITY", 0.0),
            leverage_max: env_or("LEVERAGE_MAX", 3.0),
            stopout_equity: env_or("STOPOUT_EQUITY", 0.0),
            seed_enabled: std::env::var("SEED_ENABLED")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(true),
            seed_seconds: env_or("SEED_SECONDS", 7 * 24 * 60 * 60),
            seed_candle_seconds: env_or("SEED_CANDLE_SECONDS", 60),
            seed_step_pct: env_or("SEED_STEP_PCT", 0.0007),
            initial_cash: env_or("INITIAL_CASH", 10_000.0),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./var/game.db".to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_allowed_origins() -> Vec<String> {
    if let Ok(raw) = std::env::var("ALLOWED_ORIGINS") {
        return raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    }
    [
        "https://mundoericlene.github.io",
        "https://mundoericlene.github.io/trading-arena",
        "http://localhost",
        "http://localhost:3000",
        "http://127.0.0.1",
        "http://127.0.0.1:3000",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
