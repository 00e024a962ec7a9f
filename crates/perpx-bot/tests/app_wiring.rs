//! Application wiring tests.
//!
//! Builds the application on the scriptable gateway and drives it through
//! preflight, the command interface and log recovery.

use std::sync::Arc;
use std::time::Duration;

use perpx_bot::{AppConfig, Application};
use perpx_chain::{MockChainGateway, ReceiptPlan};
use perpx_core::{MarketId, OperationId, OperationStatus, Price};
use perpx_persistence::{MemoryJournal, OperationJournal, OperationLog};
use rust_decimal_macros::dec;
use serde_json::Value;

// Well-known test private key (DO NOT use in production)
const TEST_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

fn config(extra: &str) -> AppConfig {
    let content = format!(
        r#"
        [chain]
        trading_contract = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"

        [execution]
        retry_base_ms = 1

        [tracker]
        base_interval_ms = 1
        max_interval_ms = 5
        jitter_ms = 0
        horizon_ms = 200

        {extra}
        "#
    );
    AppConfig::from_toml_str(&content).unwrap()
}

fn key_file(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("key.hex");
    std::fs::write(&path, TEST_PRIVATE_KEY).unwrap();
    path.display().to_string()
}

fn mock(chain_id: u64) -> Arc<MockChainGateway> {
    let mock = Arc::new(MockChainGateway::new(chain_id));
    mock.set_market(
        MarketId::parse("ETHUSDT").unwrap(),
        Price::new(dec!(2000)),
        dec!(0),
    );
    mock.set_balance(dec!(5000));
    mock
}

fn trading_app(dir: &tempfile::TempDir, gateway: Arc<MockChainGateway>) -> Application {
    let config = config(&format!(
        "[signer]\nkey_file = {:?}\n\n[persistence]\nlog_path = {:?}\n",
        key_file(dir),
        dir.path().join("operations.jsonl").display().to_string()
    ));
    let journal: Arc<dyn OperationJournal> =
        Arc::new(OperationLog::open(&config.persistence.log_path).unwrap());
    Application::with_parts(config, gateway, journal).unwrap()
}

fn operation_id(response: &Value) -> OperationId {
    OperationId::parse(response["operationId"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_preflight_rejects_wrong_chain() {
    let dir = tempfile::tempdir().unwrap();
    let app = trading_app(&dir, mock(1));
    let err = app.run_preflight().await.unwrap_err();
    assert!(err.to_string().contains("chain id mismatch"));
}

#[tokio::test]
async fn test_preflight_warns_on_low_balance_and_syncs_nonce() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = mock(8453);
    gateway.set_balance(dec!(1));
    let app = trading_app(&dir, gateway.clone());
    gateway.set_nonce(app.engine().account(), 4);

    app.run_preflight().await.unwrap();
    assert_eq!(app.engine().ledger().next_nonce(app.engine().account()), 4);
}

#[tokio::test]
async fn test_commands_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = trading_app(&dir, mock(8453));
    app.run_preflight().await.unwrap();
    let handler = app.handler();

    let submit = r#"{"op":"submit","symbol":"eth/usdt","direction":"buy","margin":"1000","leverage":5,"requestId":"cmd-1"}"#;
    let response = handler.handle_line(submit).await;
    assert_eq!(response["ok"], true, "{response}");
    let id = operation_id(&response);

    let view = app
        .engine()
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(view.status, OperationStatus::Confirmed);

    let status = handler
        .handle_line(&format!(r#"{{"op":"status","operationId":"{id}"}}"#))
        .await;
    assert_eq!(status["ok"], true);
    assert_eq!(status["operation"]["status"], "confirmed");

    let position = handler
        .handle_line(r#"{"op":"position","market":"ETHUSDT","side":"long"}"#)
        .await;
    assert_eq!(position["ok"], true);
    assert_eq!(position["position"]["collateral"], "1000");

    let duplicate = handler.handle_line(submit).await;
    assert_eq!(duplicate["ok"], false);
    assert_eq!(duplicate["error"]["kind"], "duplicate_intent");
    assert_eq!(duplicate["operationId"], id.to_string());
    assert_eq!(duplicate["status"], "confirmed");

    let cancel = handler
        .handle_line(&format!(r#"{{"op":"cancel","operationId":"{id}"}}"#))
        .await;
    assert_eq!(cancel["operation"]["status"], "confirmed");
}

#[tokio::test]
async fn test_rejections_and_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let app = trading_app(&dir, mock(8453));
    let handler = app.handler();

    let too_much = handler
        .handle_line(r#"{"op":"submit","market":"ETHUSDT","side":"long","collateral":100,"leverage":80,"idempotencyKey":"x"}"#)
        .await;
    assert_eq!(too_much["error"]["kind"], "validation_rejected");
    assert_eq!(too_much["error"]["reason"], "leverage_exceeded");

    let malformed = handler.handle_line("{not json").await;
    assert_eq!(malformed["error"]["kind"], "invalid_request");

    let unknown_op = handler.handle_line(r#"{"op":"liquidate"}"#).await;
    assert_eq!(unknown_op["error"]["kind"], "invalid_request");

    let missing_side = handler
        .handle_line(r#"{"op":"submit","market":"ETHUSDT","collateral":100,"idempotencyKey":"y"}"#)
        .await;
    assert_eq!(missing_side["error"]["kind"], "invalid_request");

    let unknown = handler
        .handle_line(&format!(
            r#"{{"op":"status","operationId":"{}"}}"#,
            OperationId::new()
        ))
        .await;
    assert_eq!(unknown["error"]["kind"], "unknown_operation");
}

#[tokio::test]
async fn test_observation_only_fails_signing() {
    let config = config(
        "[signer]\nobservation_address = \"0x2222222222222222222222222222222222222222\"\n",
    );
    let app = Application::with_parts(config, mock(8453), Arc::new(MemoryJournal::new())).unwrap();
    let response = app
        .handler()
        .handle_line(r#"{"op":"submit","market":"ETHUSDT","side":"long","collateral":1000,"leverage":2,"idempotencyKey":"obs"}"#)
        .await;
    let id = operation_id(&response);

    let view = app
        .engine()
        .wait_terminal(&id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(view.status, OperationStatus::Failed);
}

#[tokio::test]
async fn test_recover_resumes_from_log() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = mock(8453);
    gateway.push_receipt_plan(ReceiptPlan::ConfirmAfter(1));

    let id = {
        let app = trading_app(&dir, gateway.clone());
        app.run_preflight().await.unwrap();
        let response = app
            .handler()
            .handle_line(r#"{"op":"submit","market":"ETHUSDT","side":"long","collateral":1000,"leverage":5,"idempotencyKey":"persist"}"#)
            .await;
        let id = operation_id(&response);
        app.engine()
            .wait_terminal(&id, Duration::from_secs(10))
            .await
            .unwrap();
        id
    };

    let app = trading_app(&dir, gateway);
    app.run_preflight().await.unwrap();
    let summary = app.recover().unwrap();
    assert_eq!(summary.restored, 1);

    assert_eq!(
        app.engine().status(&id).unwrap().status,
        OperationStatus::Confirmed
    );
    assert_eq!(app.engine().positions().len(), 1);
    assert_eq!(app.scan_liquidations().await, 0);
}
