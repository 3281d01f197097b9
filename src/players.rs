//! Player join/lookup. Thin enough that it's really just naming for two
//! [`crate::storage::StateStore`] calls, kept as its own module because the
//! HTTP layer and the engine both need it without reaching into storage
//! directly.

use serde::Serialize;

use crate::error::EngineError;
use crate::storage::StateStore;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlayerView {
    pub code: String,
    pub nick: String,
    pub cash: f64,
    pub pos: f64,
}

/// Idempotent: a repeat join refreshes the nickname but never resets the
/// wallet, so reconnecting mid-session doesn't grant a free reset.
pub fn join(store: &StateStore, code: &str, nick: &str, initial_cash: f64, now: i64) -> Result<PlayerView, EngineError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(EngineError::Validation("code must not be empty".to_string()));
    }
    let nick = if nick.trim().is_empty() { code } else { nick.trim() };

    store.upsert_player(code, nick, initial_cash, now)?;
    let row = store
        .get_player(code)?
        .ok_or_else(|| EngineError::Storage("player missing immediately after upsert".to_string()))?;

    Ok(PlayerView { code: row.code, nick: row.nick, cash: row.cash, pos: row.pos })
}
