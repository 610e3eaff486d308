//! Ledger funding and transaction submission scenarios.

#![allow(clippy::expect_used)]

use super::{TestHarness, PROVIDER};
use compute_broker::chain::memory::ScriptedOutcome;
use compute_broker::chain::{ChainError, RetryableKind};
use compute_broker::{Error, ServiceType};

fn underpriced() -> ScriptedOutcome {
    ScriptedOutcome::Fail(ChainError::Retryable {
        kind: RetryableKind::Underpriced,
        message: "transaction underpriced".to_string(),
    })
}

#[tokio::test]
async fn test_gas_price_escalates_until_confirmed() {
    let harness = TestHarness::setup().await;
    let ledger = harness.broker.ledger();
    ledger.add_ledger(1_000).await.expect("ledger");

    harness.chain.push_outcome(underpriced());
    harness.chain.push_outcome(underpriced());
    ledger.deposit_fund(500).await.expect("deposit");

    let prices: Vec<u128> = harness
        .chain
        .submissions()
        .iter()
        .filter(|s| s.call.name() == "depositFund")
        .map(|s| s.options.gas_price)
        .collect();
    assert_eq!(prices, vec![1_000, 1_100, 1_210]);
    assert_eq!(ledger.get_ledger().await.expect("ledger").total_balance, 1_500);
}

#[tokio::test]
async fn test_gas_cap_stops_escalation() {
    let mut config = TestHarness::config();
    config.gas.max_gas_price = Some(1_200);
    let harness = TestHarness::setup_with(config, 8).await;
    let ledger = harness.broker.ledger();
    ledger.add_ledger(1_000).await.expect("ledger");

    for _ in 0..3 {
        harness.chain.push_outcome(underpriced());
    }
    let err = ledger.deposit_fund(500).await.expect_err("capped");
    match err {
        Error::GasCapReached {
            gas_price,
            attempts,
            ..
        } => {
            assert_eq!(gas_price, 1_200);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected gas cap, got {other}"),
    }
}

#[tokio::test]
async fn test_revert_is_terminal_and_decoded() {
    let harness = TestHarness::setup().await;
    let ledger = harness.broker.ledger();
    ledger.add_ledger(1_000).await.expect("ledger");
    ledger
        .transfer(PROVIDER, ServiceType::Inference, 300)
        .await
        .expect("transfer");

    let err = ledger.delete_ledger().await.expect_err("funds in sub-account");
    match err {
        Error::Transaction(message) => assert!(message.contains("retrieve them before deleting")),
        other => panic!("expected decoded revert, got {other}"),
    }
    assert_eq!(harness.chain.count_calls("deleteLedger"), 1);
}

#[tokio::test]
async fn test_retrieve_then_delete() {
    let harness = TestHarness::setup().await;
    let ledger = harness.broker.ledger();
    ledger.add_ledger(1_000).await.expect("ledger");
    ledger
        .transfer(PROVIDER, ServiceType::Inference, 300)
        .await
        .expect("transfer");

    ledger
        .retrieve_all(ServiceType::Inference)
        .await
        .expect("retrieve")
        .expect("one sub-account");
    assert!(ledger
        .retrieve_all(ServiceType::FineTuning)
        .await
        .expect("nothing to retrieve")
        .is_none());

    harness.chain.process_refunds(harness.user, ServiceType::Inference);
    let funds = ledger.get_ledger().await.expect("ledger");
    assert_eq!(funds.available_balance, 1_000);

    ledger.refund(1_000).await.expect("refund");
    ledger.delete_ledger().await.expect("delete");
    let err = ledger.get_ledger().await.expect_err("deleted");
    assert!(err.is_precondition());
}
