//! Error taxonomy surfaced at the engine boundary.
//!
//! The HTTP layer is the single place that matches on [`EngineError`] and
//! maps it to a status code — the engine itself never thinks in terms of
//! HTTP.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    Validation(String),
    NotFound(String),
    NotReady,
    InsufficientFunds,
    InsufficientLiquidity,
    FeeUnderflow,
    MarginRefused(String),
    Storage(String),
}

impl EngineError {
    /// HTTP status code this error maps to (SPEC_FULL.md §7).
    pub fn status(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::Storage(_) => 500,
            _ => 400,
        }
    }

    pub fn message(&self) -> String {
        match self {
            EngineError::Validation(msg) => msg.clone(),
            EngineError::NotFound(msg) => msg.clone(),
            EngineError::NotReady => "market not started".to_string(),
            EngineError::InsufficientFunds => "insufficient USD balance".to_string(),
            EngineError::InsufficientLiquidity => "insufficient liquidity".to_string(),
            EngineError::FeeUnderflow => "amount too small after fee".to_string(),
            EngineError::MarginRefused(msg) => msg.clone(),
            EngineError::Storage(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
