//! Fine-tuning deliverable scenarios.

#![allow(clippy::expect_used)]

use super::{TestHarness, PROVIDER};
use compute_broker::crypto::ecies;
use compute_broker::deliverable::format::{IV_SIZE, KEY_SIZE, TAG_SIZE};
use compute_broker::deliverable::seal;
use compute_broker::{Error, ServiceType};

const CHUNK: usize = 8;
const ROOT: [u8; 32] = [0x7d; 32];
const SESSION_KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

/// Publish a 3-chunk deliverable, acknowledge it and reveal its key.
async fn published(harness: &TestHarness) -> (Vec<u8>, Vec<u8>) {
    let ledger = harness.broker.ledger();
    ledger.add_ledger(1_000).await.expect("ledger");
    ledger
        .transfer(PROVIDER, ServiceType::FineTuning, 100)
        .await
        .expect("fund job");
    harness
        .broker
        .fine_tuning()
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge signer");

    let plaintext: Vec<u8> = (0u8..20).collect();
    let sealed = seal(
        &plaintext,
        &SESSION_KEY,
        [0u8; IV_SIZE],
        harness.provider_key.secret_key(),
        CHUNK,
    )
    .expect("seal");
    harness.fetcher.publish(ROOT, sealed.clone());
    let index = harness
        .chain
        .push_deliverable(harness.user, PROVIDER, ROOT)
        .expect("publish");

    let download = harness.dir.path().join("model.enc");
    harness
        .broker
        .fine_tuning()
        .acknowledge_deliverable(PROVIDER, &download)
        .await
        .expect("acknowledge deliverable");
    assert_eq!(tokio::fs::read(&download).await.expect("downloaded"), sealed);

    let secret = ecies::seal(&harness.user_public_key, &SESSION_KEY).expect("seal key");
    harness
        .chain
        .reveal_deliverable_secret(harness.user, PROVIDER, index, secret)
        .expect("reveal");
    (plaintext, sealed)
}

#[tokio::test]
async fn test_three_chunk_deliverable_decrypts() {
    let harness = TestHarness::setup().await;
    let (plaintext, _) = published(&harness).await;

    let input = harness.dir.path().join("model.enc");
    let output = harness.dir.path().join("model.bin");
    harness
        .broker
        .fine_tuning()
        .decrypt_model(PROVIDER, &input, &output)
        .await
        .expect("decrypt");
    assert_eq!(tokio::fs::read(&output).await.expect("output"), plaintext);
    assert_eq!(harness.chain.count_calls("acknowledgeDeliverable"), 1);
}

#[tokio::test]
async fn test_zeroed_tag_leaves_no_output() {
    let harness = TestHarness::setup().await;
    let (_, mut sealed) = published(&harness).await;

    // Tag of the second chunk.
    let header = 65 + IV_SIZE;
    let start = header + (CHUNK + TAG_SIZE) + CHUNK;
    sealed[start..start + TAG_SIZE].fill(0);
    let input = harness.dir.path().join("tampered.enc");
    tokio::fs::write(&input, &sealed).await.expect("write");

    let output = harness.dir.path().join("out").join("model.bin");
    tokio::fs::create_dir_all(output.parent().expect("parent"))
        .await
        .expect("mkdir");
    let err = harness
        .broker
        .fine_tuning()
        .decrypt_model(PROVIDER, &input, &output)
        .await
        .expect_err("tampered");
    assert!(err.is_verification());
    assert!(!output.exists());

    let mut leftovers = tokio::fs::read_dir(output.parent().expect("parent"))
        .await
        .expect("read dir");
    assert!(leftovers.next_entry().await.expect("entry").is_none());
}

#[tokio::test]
async fn test_decrypt_before_acknowledgement_is_precondition() {
    let harness = TestHarness::setup().await;
    let ledger = harness.broker.ledger();
    ledger.add_ledger(1_000).await.expect("ledger");
    ledger
        .transfer(PROVIDER, ServiceType::FineTuning, 100)
        .await
        .expect("fund job");
    harness
        .broker
        .fine_tuning()
        .acknowledge_provider_signer(PROVIDER)
        .await
        .expect("acknowledge signer");
    harness
        .chain
        .push_deliverable(harness.user, PROVIDER, ROOT)
        .expect("publish");

    let err = harness
        .broker
        .fine_tuning()
        .decrypt_model(
            PROVIDER,
            &harness.dir.path().join("in"),
            &harness.dir.path().join("out"),
        )
        .await
        .expect_err("not acknowledged");
    assert!(matches!(err, Error::Precondition(_)));
}
