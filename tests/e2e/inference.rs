//! Inference billing scenarios.

#![allow(clippy::expect_used)]

use super::{TestHarness, PROVIDER};
use compute_broker::chain::{ChainError, ContractCall, LedgerChain, TxOptions};
use compute_broker::config::FeeConfig;
use compute_broker::{BillingHeaders, Error, NonceAllocator, ServiceType};

async fn settle(harness: &TestHarness, headers: &[&BillingHeaders]) -> Result<(), ChainError> {
    let call = ContractCall::SettleFees {
        user: harness.user,
        service_type: ServiceType::Inference,
        requests: headers.iter().map(|h| h.signed_request()).collect(),
    };
    let options = TxOptions {
        gas_price: 1,
        nonce: None,
    };
    harness
        .provider_chain()
        .submit(&call, &options)
        .await
        .map(|_| ())
}

fn top_ups(harness: &TestHarness) -> Vec<u128> {
    harness
        .chain
        .submissions()
        .into_iter()
        .filter_map(|s| match s.call {
            ContractCall::TransferFund { amount, .. } if amount > 0 => Some(amount),
            _ => None,
        })
        .collect()
}

/// First request tops the new sub-account up to target exactly once; later
/// requests below the check threshold go out without touching the chain.
#[tokio::test]
async fn test_first_request_tops_up_exactly_once() {
    let harness = TestHarness::setup().await;
    let broker = harness.broker.inference();
    harness.broker.ledger().add_ledger(1_000).await.expect("ledger");

    let signer = broker
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge");
    assert_eq!(signer, harness.provider_key.address());

    let first = broker
        .get_request_headers(PROVIDER, "hello")
        .await
        .expect("first headers");
    assert_eq!(first.input_fee, 5);
    assert_eq!(first.fee, 5);
    assert_eq!(top_ups(&harness), vec![200]);
    assert_eq!(harness.inference_account().await.balance, 200);

    harness.provider.sign_response("r1", "0123456789");
    let verified = broker
        .process_response(PROVIDER, "0123456789", Some("r1"))
        .await
        .expect("process response");
    assert_eq!(verified, Some(true));

    let second = broker
        .get_request_headers(PROVIDER, "hi")
        .await
        .expect("second headers");
    assert_eq!(second.input_fee, 2);
    assert_eq!(second.fee, 12, "carries the output fee of the first response");
    assert!(second.nonce > first.nonce);

    let third = broker
        .get_request_headers(PROVIDER, "hi")
        .await
        .expect("third headers");
    assert_eq!(third.fee, 2);
    assert!(third.nonce > second.nonce);

    assert_eq!(top_ups(&harness), vec![200]);
    let ledger = harness.broker.ledger().get_ledger().await.expect("ledger");
    assert_eq!(ledger.available_balance, 800);

    settle(&harness, &[&first, &second, &third])
        .await
        .expect("provider settles");
    let account = harness.inference_account().await;
    assert_eq!(account.balance, 200 - 19);
    assert_eq!(account.nonce, third.nonce);

    let replay = settle(&harness, &[&first]).await.expect_err("replayed nonce");
    assert!(matches!(replay, ChainError::Reverted { ref name, .. } if name == "InvalidNonce"));

    harness.teardown().await;
}

/// Spend past the check threshold re-reads the account and restores target.
#[tokio::test]
async fn test_spend_triggers_recheck_and_top_up() {
    let harness = TestHarness::setup().await;
    let broker = harness.broker.inference();
    harness.broker.ledger().add_ledger(1_000).await.expect("ledger");
    broker
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge");

    let big = "x".repeat(150);
    let first = broker
        .get_request_headers(PROVIDER, &big)
        .await
        .expect("first");
    assert_eq!(top_ups(&harness), vec![200]);
    settle(&harness, &[&first]).await.expect("settle");
    assert_eq!(harness.inference_account().await.available(), 50);

    broker
        .get_request_headers(PROVIDER, &"y".repeat(10))
        .await
        .expect("below check threshold");
    assert_eq!(top_ups(&harness), vec![200]);

    broker
        .get_request_headers(PROVIDER, &"z".repeat(15))
        .await
        .expect("past check threshold");
    assert_eq!(top_ups(&harness), vec![200, 150]);
    assert_eq!(harness.inference_account().await.available(), 200);
}

/// Send a request costing `spend` at unit input price and settle it.
async fn send_settled(harness: &TestHarness, spend: u128) {
    let content = "x".repeat(usize::try_from(spend).expect("length"));
    let headers = harness
        .broker
        .inference()
        .get_request_headers(PROVIDER, &content)
        .await
        .expect("headers");
    assert_eq!(headers.fee, spend);
    settle(harness, &[&headers]).await.expect("settle");
}

/// Default multipliers with price sum `p = 2`: check 100k*p, trigger 500k*p,
/// target 1000k*p. Every request is settled by the provider before the next.
#[tokio::test]
async fn test_default_thresholds_top_up_once_after_550k() {
    const P: u128 = 2;
    const K: u128 = 1_000;

    let mut config = TestHarness::config();
    config.fees = FeeConfig::default();
    let harness = TestHarness::setup_with(config, 8).await;
    let broker = harness.broker.inference();
    harness
        .broker
        .ledger()
        .add_ledger(5_000 * K)
        .await
        .expect("ledger");
    broker
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge");

    // 400k*p in total: only the funding of the new sub-account.
    for _ in 0..4 {
        send_settled(&harness, 100 * K * P).await;
    }
    assert_eq!(top_ups(&harness), vec![1_000 * K * P]);
    assert_eq!(harness.inference_account().await.available(), 600 * K * P);

    // A further 150k*p leaves 450k*p, below the trigger.
    send_settled(&harness, 125 * K * P).await;
    send_settled(&harness, 25 * K * P).await;
    assert_eq!(top_ups(&harness), vec![1_000 * K * P]);
    assert_eq!(harness.inference_account().await.available(), 450 * K * P);

    // The next re-check restores the target with exactly one transfer.
    let headers = broker
        .get_request_headers(PROVIDER, &"y".repeat(150_001))
        .await
        .expect("re-check");
    assert_eq!(top_ups(&harness), vec![1_000 * K * P, 550 * K * P]);
    assert_eq!(harness.inference_account().await.available(), 1_000 * K * P);
    assert_eq!(headers.fee, 150_001);

    harness.teardown().await;
}

#[tokio::test]
async fn test_unacknowledged_provider_is_rejected() {
    let harness = TestHarness::setup().await;
    harness.broker.ledger().add_ledger(1_000).await.expect("ledger");

    let err = harness
        .broker
        .inference()
        .get_request_headers(PROVIDER, "hello")
        .await
        .expect_err("not acknowledged");
    assert!(err.is_precondition());
    assert!(top_ups(&harness).is_empty());
}

#[tokio::test]
async fn test_top_up_beyond_ledger_is_precondition() {
    let harness = TestHarness::setup().await;
    let broker = harness.broker.inference();
    harness.broker.ledger().add_ledger(100).await.expect("ledger");
    broker
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge");

    let err = broker
        .get_request_headers(PROVIDER, "hello")
        .await
        .expect_err("ledger too small");
    assert!(matches!(err, Error::Precondition(_)));
}

#[tokio::test]
async fn test_response_verification_outcomes() {
    let harness = TestHarness::setup().await;
    let broker = harness.broker.inference();
    harness.broker.ledger().add_ledger(1_000).await.expect("ledger");
    broker
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge");

    assert_eq!(
        broker
            .process_response(PROVIDER, "unverified", None)
            .await
            .expect("no id"),
        None
    );
    assert_eq!(
        broker
            .process_response(PROVIDER, "answer", Some("unknown"))
            .await
            .expect("missing signature"),
        Some(false)
    );

    harness.provider.sign_response("r2", "signed answer");
    assert_eq!(
        broker
            .process_response(PROVIDER, "swapped answer", Some("r2"))
            .await
            .expect("substituted content"),
        Some(false)
    );
    assert_eq!(broker.fees().pending_output_fee(PROVIDER).await.expect("pending"), 30);
}

#[tokio::test]
async fn test_nonces_survive_restart() {
    let harness = TestHarness::setup().await;
    let broker = harness.broker.inference();
    harness.broker.ledger().add_ledger(1_000).await.expect("ledger");
    broker
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge");
    let headers = broker
        .get_request_headers(PROVIDER, "hello")
        .await
        .expect("headers");

    let config = harness.broker.context().config().clone();
    let restarted = compute_broker::BrokerContext::init(config.clone())
        .await
        .expect("restart");
    let nonces = NonceAllocator::new(
        restarted.persistent_cache().clone(),
        harness.user,
        config.nonce,
    );
    assert!(nonces.next_nonce().await.expect("nonce") > headers.nonce);
}
