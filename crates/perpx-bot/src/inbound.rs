//! Newline-delimited JSON command interface.
//!
//! One command per line, one response line per command:
//!
//! ```text
//! {"op":"submit","market":"ETHUSDT","side":"long","collateral":"1000","leverage":5,"idempotencyKey":"k1"}
//! {"op":"status","operationId":"..."}
//! {"op":"cancel","operationId":"..."}
//! {"op":"position","market":"ETHUSDT","side":"long"}
//! ```
//!
//! Payloads are converted to typed intents here; nothing untyped reaches
//! the engine.

use std::str::FromStr;

use perpx_core::{MarketId, OperationId, Side, TradeIntent};
use perpx_executor::{ExecutionEngine, ExecutionError};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Turns command lines into engine calls.
#[derive(Clone)]
pub struct CommandHandler {
    engine: ExecutionEngine,
    default_slippage_bps: u32,
}

impl CommandHandler {
    pub fn new(engine: ExecutionEngine, default_slippage_bps: u32) -> Self {
        Self {
            engine,
            default_slippage_bps,
        }
    }

    /// Handle one line and return the response object.
    pub async fn handle_line(&self, line: &str) -> Value {
        let payload: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return bad_request(format!("malformed JSON: {e}")),
        };
        let Some(op) = payload.get("op").and_then(Value::as_str) else {
            return bad_request("missing op".to_string());
        };
        debug!(op, "Inbound command");

        match op {
            "submit" => self.submit(&payload).await,
            "status" => self.status(&payload),
            "cancel" => self.cancel(&payload),
            "position" => self.position(&payload),
            other => bad_request(format!("unknown op {other:?}")),
        }
    }

    async fn submit(&self, payload: &Value) -> Value {
        let intent = match TradeIntent::from_payload(payload, self.default_slippage_bps) {
            Ok(intent) => intent,
            Err(e) => return bad_request(e.to_string()),
        };
        let key = intent.idempotency_key.clone();

        match self.engine.submit_intent(intent).await {
            Ok(operation_id) => {
                let status = self
                    .engine
                    .status(&operation_id)
                    .map(|v| v.status.to_string())
                    .unwrap_or_default();
                json!({
                    "ok": true,
                    "operationId": operation_id.to_string(),
                    "status": status,
                })
            }
            Err(e) => {
                warn!(idempotency_key = %key, error = %e, "Intent not accepted");
                error_response(&e)
            }
        }
    }

    fn status(&self, payload: &Value) -> Value {
        let operation_id = match operation_id(payload) {
            Ok(id) => id,
            Err(resp) => return resp,
        };
        match self.engine.status(&operation_id) {
            Ok(view) => json!({ "ok": true, "operation": view }),
            Err(e) => error_response(&e),
        }
    }

    fn cancel(&self, payload: &Value) -> Value {
        let operation_id = match operation_id(payload) {
            Ok(id) => id,
            Err(resp) => return resp,
        };
        match self.engine.cancel(&operation_id) {
            Ok(view) => json!({ "ok": true, "operation": view }),
            Err(e) => error_response(&e),
        }
    }

    fn position(&self, payload: &Value) -> Value {
        let market = match string_field(payload, &["market", "marketId", "symbol"]) {
            Some(raw) => match MarketId::parse(raw) {
                Ok(m) => m,
                Err(e) => return bad_request(e.to_string()),
            },
            None => return bad_request("missing market".to_string()),
        };
        let side = match string_field(payload, &["side", "direction"]) {
            Some(raw) => match Side::from_str(raw) {
                Ok(s) => s,
                Err(e) => return bad_request(e.to_string()),
            },
            None => return bad_request("missing side".to_string()),
        };

        json!({
            "ok": true,
            "position": self.engine.position(&market, side),
        })
    }
}

fn string_field<'a>(payload: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| payload.get(*name).and_then(Value::as_str))
}

fn operation_id(payload: &Value) -> Result<OperationId, Value> {
    let raw = string_field(payload, &["operationId", "operation_id"])
        .ok_or_else(|| bad_request("missing operationId".to_string()))?;
    OperationId::parse(raw).map_err(|e| bad_request(e.to_string()))
}

fn bad_request(message: String) -> Value {
    json!({
        "ok": false,
        "error": { "kind": "invalid_request", "message": message },
    })
}

fn error_response(error: &ExecutionError) -> Value {
    let mut body = json!({
        "ok": false,
        "error": { "kind": error.kind(), "message": error.to_string() },
    });
    match error {
        ExecutionError::DuplicateIntent {
            operation_id,
            status,
        } => {
            body["operationId"] = json!(operation_id.to_string());
            body["status"] = json!(status.to_string());
        }
        ExecutionError::ValidationRejected(reason) => {
            body["error"]["reason"] = json!(reason.as_str());
        }
        _ => {}
    }
    body
}
