//! Operation log write/replay tests.
//!
//! Verifies that replay keeps the latest snapshot per operation, survives
//! corrupt lines and never truncates an existing log.

use std::io::Write;

use perpx_core::{
    FailureReason, IdempotencyKey, MarketId, NormalizedOrder, OperationId, OperationKind,
    OperationRecord, OperationStatus, Price, ResultingPosition, Side, Size, TradeIntent,
};
use perpx_persistence::{replay, MemoryJournal, OperationJournal, OperationLog};
use rust_decimal_macros::dec;

fn record(key: &str) -> OperationRecord {
    let market = MarketId::parse("ETHUSDT").unwrap();
    let intent = TradeIntent::open(
        market.clone(),
        Side::Long,
        dec!(1000),
        dec!(5),
        50,
        IdempotencyKey::new(key).unwrap(),
    );
    let order = NormalizedOrder {
        market,
        side: Side::Long,
        kind: OperationKind::Open,
        size_delta: dec!(5000),
        collateral_delta: dec!(1000),
        mark_price: Price::new(dec!(2000)),
        acceptable_price: Price::new(dec!(2010)),
        resulting: ResultingPosition {
            size: Size::new(dec!(2.5)),
            collateral: dec!(1000),
            leverage: dec!(5),
            liquidation_price: Price::new(dec!(1600)),
        },
        risk_version: 1,
        take_profit: None,
        stop_loss: None,
    };
    OperationRecord::new(OperationId::new(), "0xabc".into(), intent, order)
}

/// Replay returns the newest snapshot of each operation.
#[test]
fn test_replay_keeps_latest_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ops/operations.jsonl");

    let mut a = record("a");
    let mut b = record("b");
    {
        let log = OperationLog::open(&path).unwrap();
        log.append(&a).unwrap();
        log.append(&b).unwrap();

        a.transition(OperationStatus::Building).unwrap();
        a.transition(OperationStatus::Signed).unwrap();
        a.nonce = Some(7);
        log.append(&a).unwrap();

        b.fail(FailureReason::Interrupted).unwrap();
        log.append(&b).unwrap();
        assert_eq!(log.records_written(), 4);
    }

    let records = replay(&path).unwrap();
    assert_eq!(records.len(), 2);

    let a_replayed = records.iter().find(|r| r.operation_id == a.operation_id).unwrap();
    assert_eq!(a_replayed.status, OperationStatus::Signed);
    assert_eq!(a_replayed.nonce, Some(7));

    let b_replayed = records.iter().find(|r| r.operation_id == b.operation_id).unwrap();
    assert_eq!(b_replayed.failure, Some(FailureReason::Interrupted));
}

/// A torn or corrupt line does not prevent replay of the rest.
#[test]
fn test_replay_skips_corrupt_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("operations.jsonl");

    let a = record("a");
    {
        let log = OperationLog::open(&path).unwrap();
        log.append(&a).unwrap();
    }
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"operation_id\": \"trunc").unwrap();
        writeln!(file).unwrap();
    }

    let records = replay(&path).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0], a);
}

/// Reopening appends instead of truncating.
#[test]
fn test_reopen_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("operations.jsonl");

    OperationLog::open(&path).unwrap().append(&record("a")).unwrap();
    OperationLog::open(&path).unwrap().append(&record("b")).unwrap();

    assert_eq!(replay(&path).unwrap().len(), 2);
}

/// Compaction keeps one line per operation and later appends still land.
#[test]
fn test_compact_rewrites_to_latest_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("operations.jsonl");

    let mut a = record("a");
    let b = record("b");
    let log = OperationLog::open(&path).unwrap();
    log.append(&a).unwrap();
    log.append(&b).unwrap();
    for next in [
        OperationStatus::Building,
        OperationStatus::Signed,
        OperationStatus::Submitted,
        OperationStatus::Confirmed,
    ] {
        a.transition(next).unwrap();
        log.append(&a).unwrap();
    }
    let before = replay(&path).unwrap();

    assert_eq!(log.compact().unwrap(), 2);
    let lines = std::fs::read_to_string(&path).unwrap();
    assert_eq!(lines.lines().count(), 2);
    assert_eq!(replay(&path).unwrap(), before);

    let c = record("c");
    log.append(&c).unwrap();
    let after = replay(&path).unwrap();
    assert_eq!(after.len(), 3);
    assert_eq!(
        after.iter().find(|r| r.operation_id == a.operation_id).unwrap().status,
        OperationStatus::Confirmed
    );
}

#[test]
fn test_missing_log_replays_empty() {
    let dir = tempfile::tempdir().unwrap();
    assert!(replay(dir.path().join("absent.jsonl")).unwrap().is_empty());
}

#[test]
fn test_memory_journal_records_in_order() {
    let journal = MemoryJournal::new();
    let mut a = record("a");
    journal.append(&a).unwrap();
    a.transition(OperationStatus::Cancelled).unwrap();
    journal.append(&a).unwrap();

    let statuses: Vec<_> = journal.records().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![OperationStatus::Validated, OperationStatus::Cancelled]);
}
