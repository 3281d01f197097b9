//! Raw-socket JSON API server. One thread per accepted connection, manual
//! request-line + header parsing over `std::net::TcpListener` — the
//! teacher's `bin/epistemic_server.rs` idiom, not an async framework.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::Config;
use crate::engine::MarketEngine;
use crate::error::EngineError;
use crate::logging::{self, Domain, Level};

pub fn serve(cfg: Arc<Config>, engine: Arc<MarketEngine>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&cfg.bind_addr)?;
    logging::log(Level::Info, Domain::System, "http_listening", logging::obj(&[("addr", logging::v_str(&cfg.bind_addr))]));

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(_) => continue,
        };
        let cfg = Arc::clone(&cfg);
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            if let Err(e) = handle_connection(stream, &cfg, &engine) {
                logging::log(Level::Warn, Domain::System, "conn_error", logging::obj(&[("error", logging::v_str(&e.to_string()))]));
            }
        });
    }
    Ok(())
}

struct ParsedRequest {
    method: String,
    path: String,
    query: std::collections::HashMap<String, String>,
    origin: Option<String>,
    body: String,
}

fn handle_connection(mut stream: TcpStream, cfg: &Config, engine: &MarketEngine) -> std::io::Result<()> {
    let req = match read_request(&mut stream)? {
        Some(r) => r,
        None => return Ok(()),
    };

    if req.method == "OPTIONS" {
        write_response(&mut stream, 204, &req.origin, cfg, "");
        return Ok(());
    }

    let (status, body) = route(&req, cfg, engine);
    write_response(&mut stream, status, &req.origin, cfg, &body.to_string());
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<ParsedRequest>> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(None);
    }
    let mut parts = request_line.trim().split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    if method.is_empty() {
        return Ok(None);
    }

    let mut content_length: usize = 0;
    let mut origin: Option<String> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "origin" => origin = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body)?;
    }
    let body = String::from_utf8_lossy(&body).to_string();

    let (path, query) = split_target(&target);
    Ok(Some(ParsedRequest { method, path, query, origin, body }))
}

fn split_target(target: &str) -> (String, std::collections::HashMap<String, String>) {
    let mut query = std::collections::HashMap::new();
    let (path, qs) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    for pair in qs.split('&').filter(|s| !s.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        query.insert(urldecode(k), urldecode(v));
    }
    (path.to_string(), query)
}

fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

fn route(req: &ParsedRequest, cfg: &Config, engine: &MarketEngine) -> (u16, Value) {
    let result = match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/api/start") => handle_start(engine),
        ("GET", "/api/state") => handle_state(engine),
        ("POST", "/api/join") => handle_join(req, engine, cfg),
        ("GET", "/api/me") => handle_me(req, engine),
        ("POST", "/api/trade") => handle_trade(req, engine),
        ("GET", "/api/trades") => handle_trades(req, engine),
        ("GET", "/api/candles") => handle_candles(req, engine),
        ("GET", "/api/leaderboard") => handle_leaderboard(req, engine),
        ("GET", "/api/health") => Ok(json!({"ok": true, "ts": engine.now_unix()})),
        _ => Err(EngineError::NotFound(format!("no such route: {} {}", req.method, req.path))),
    };

    match result {
        Ok(body) => (200, body),
        Err(e) => (e.status(), json!({"ok": false, "error": e.message()})),
    }
}

fn handle_start(engine: &MarketEngine) -> Result<Value, EngineError> {
    let snap = engine.start_game()?;
    Ok(serde_json::to_value(snap).unwrap())
}

fn handle_state(engine: &MarketEngine) -> Result<Value, EngineError> {
    Ok(serde_json::to_value(engine.snapshot()).unwrap())
}

fn handle_join(req: &ParsedRequest, engine: &MarketEngine, cfg: &Config) -> Result<Value, EngineError> {
    let body: Value = serde_json::from_str(&req.body).map_err(|_| EngineError::Validation("malformed JSON body".to_string()))?;
    let code = body.get("code").and_then(Value::as_str).unwrap_or("");
    let nick = body.get("nick").and_then(Value::as_str).unwrap_or("");
    if code.trim().len() < 4 || code.trim().len() > 64 {
        return Err(EngineError::Validation("code must be 4-64 characters".to_string()));
    }
    if nick.trim().is_empty() || nick.trim().len() > 32 {
        return Err(EngineError::Validation("nick must be 1-32 characters".to_string()));
    }
    let now = engine.now_unix() as i64;
    let player = crate::players::join(store_of(engine), code, nick, cfg.initial_cash, now)?;
    Ok(json!({"ok": true, "code": player.code, "nick": player.nick, "initial_cash": cfg.initial_cash}))
}

fn handle_me(req: &ParsedRequest, engine: &MarketEngine) -> Result<Value, EngineError> {
    let code = req.query.get("code").map(String::as_str).unwrap_or("");
    let me = engine.me(code)?;
    let mut v = serde_json::to_value(me).unwrap();
    v["ok"] = json!(true);
    Ok(v)
}

fn handle_trade(req: &ParsedRequest, engine: &MarketEngine) -> Result<Value, EngineError> {
    let body: Value = serde_json::from_str(&req.body).map_err(|_| EngineError::Validation("malformed JSON body".to_string()))?;
    let code = body.get("code").and_then(Value::as_str).unwrap_or("");
    let side = body.get("side").and_then(Value::as_str).unwrap_or("");
    let usd = body.get("usd").and_then(Value::as_f64).unwrap_or(0.0);
    if usd <= 0.0 {
        return Err(EngineError::Validation("usd must be positive".to_string()));
    }

    let outcome = match side {
        "BUY" => engine.market_buy(code, usd)?,
        "SELL" => {
            // Converts the requested USD amount into RICH using the pre-trade
            // price, so the realized proceeds can differ from the requested
            // `usd` figure — documented, intentional behavior of this system.
            let price = engine.current_price();
            if price <= 0.0 {
                return Err(EngineError::Validation("market not started".to_string()));
            }
            let rich_in = usd / price;
            engine.market_sell(code, rich_in)?
        }
        _ => return Err(EngineError::Validation("side must be BUY or SELL".to_string())),
    };

    let me = engine.me(code)?;
    let mut v = serde_json::to_value(&outcome).unwrap();
    v["ok"] = json!(true);
    v["me"] = serde_json::to_value(me).unwrap();
    Ok(v)
}

fn handle_trades(req: &ParsedRequest, engine: &MarketEngine) -> Result<Value, EngineError> {
    let code = req.query.get("code").map(String::as_str).unwrap_or("");
    let limit: i64 = req.query.get("limit").and_then(|s| s.parse().ok()).unwrap_or(50);
    let limit = limit.clamp(1, 200);
    let trades = engine.recent_trades(code, limit)?;
    Ok(json!({"ok": true, "trades": trades}))
}

fn handle_candles(req: &ParsedRequest, engine: &MarketEngine) -> Result<Value, EngineError> {
    let limit: i64 = req.query.get("limit").and_then(|s| s.parse().ok()).unwrap_or(600);
    let limit = limit.clamp(10, 2000);
    let tf: u64 = req.query.get("tf").and_then(|s| s.parse().ok()).unwrap_or(300);
    let tf = tf.clamp(1, 86_400);
    let candles = engine.candles_for_chart(limit, tf)?;
    Ok(json!({"ok": true, "candles": candles}))
}

fn handle_leaderboard(req: &ParsedRequest, engine: &MarketEngine) -> Result<Value, EngineError> {
    let limit: i64 = req.query.get("limit").and_then(|s| s.parse().ok()).unwrap_or(50);
    let limit = limit.clamp(1, 500);
    let rows = engine.leaderboard(limit)?;
    let entries: Vec<Value> = rows
        .into_iter()
        .map(|r| json!({"nick": r.nick, "equity": r.equity, "pnl": r.pnl_total, "pos": r.pos, "cash": r.cash}))
        .collect();
    Ok(json!({"ok": true, "leaderboard": entries}))
}

/// `MarketEngine` keeps its store private; the HTTP layer needs `join`'s
/// upsert semantics but not general storage access, so it reaches through a
/// narrow accessor rather than a pub field.
fn store_of(engine: &MarketEngine) -> &crate::storage::StateStore {
    engine.store()
}

fn write_response(stream: &mut TcpStream, status: u16, origin: &Option<String>, cfg: &Config, body: &str) {
    let status_line = match status {
        200 => "200 OK",
        204 => "204 No Content",
        400 => "400 Bad Request",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        _ => "500 Internal Server Error",
    };

    let allow_origin = origin
        .as_deref()
        .filter(|o| cfg.allowed_origins.iter().any(|allowed| allowed == o))
        .unwrap_or("null");

    let mut response = format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: {allow_origin}\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: *\r\n\
         Access-Control-Max-Age: 600\r\n\
         X-Content-Type-Options: nosniff\r\n\
         Cache-Control: no-store\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    );
    response.push_str(body);
    let _ = stream.write_all(response.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_target_parses_query_string() {
        let (path, query) = split_target("/api/me?code=alice01&limit=10");
        assert_eq!(path, "/api/me");
        assert_eq!(query.get("code").map(String::as_str), Some("alice01"));
        assert_eq!(query.get("limit").map(String::as_str), Some("10"));
    }

    #[test]
    fn split_target_handles_no_query() {
        let (path, query) = split_target("/api/state");
        assert_eq!(path, "/api/state");
        assert!(query.is_empty());
    }

    #[test]
    fn urldecode_handles_percent_and_plus() {
        assert_eq!(urldecode("hello%20world"), "hello world");
        assert_eq!(urldecode("a+b"), "a b");
    }
}
