// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::Ordering;

use duties_indexer::state::{StateError, ValidatorStatus};
use duties_rewards::RewardError;
use num_bigint::BigInt;

use super::common::{
    harness, pubkey, state_document, validator_json, FakeRegistrySource, StateBody, GENESIS_TIME,
    OPERATOR_NAME, SECONDS_PER_SLOT,
};

fn two_validators() -> String {
    state_document(&[
        validator_json(0, 1, "active_ongoing", 32_000_000_000),
        validator_json(1, 9, "withdrawal_done", 0),
    ])
}

#[tokio::test]
async fn test_check_folds_all_validators() {
    let h = harness(StateBody::Json(two_validators()), FakeRegistrySource::new(), 1000);

    let report = h.service.check(100, 3_200).await.unwrap();

    assert_eq!(report.validators, 2);
    assert_eq!(report.operator_misses, 1);
    assert_eq!(report.meta.active_validators, 1);
    assert_eq!(report.meta.active_validators_total_increments, BigInt::from(32));
    assert_eq!(report.meta.base_reward, 357_771);

    let meta = h.summary.get_meta(100).await.unwrap();
    assert_eq!(meta.state, Some(report.meta.clone()));

    let active = h.summary.get(100, 0).await.unwrap();
    assert_eq!(active.val_pubkey, Some(pubkey(1)));
    assert_eq!(active.val_nos_id, Some(3));
    assert_eq!(active.val_nos_name.as_deref(), Some(OPERATOR_NAME));
    assert_eq!(active.val_status, Some(ValidatorStatus::ActiveOngoing));
    assert_eq!(active.val_slashed, Some(false));
    assert_eq!(active.val_balance, Some(32_000_012_345));
    assert_eq!(active.val_effective_balance, Some(32_000_000_000));

    let withdrawn = h.summary.get(100, 1).await.unwrap();
    assert_eq!(withdrawn.val_status, Some(ValidatorStatus::WithdrawalDone));
    assert_eq!(withdrawn.val_effective_balance, Some(0));
    assert_eq!(withdrawn.val_nos_id, None);
    assert_eq!(withdrawn.val_nos_name, None);
}

#[tokio::test]
async fn test_registry_refreshed_at_epoch_start_time() {
    let source = FakeRegistrySource::new();
    let timestamps = source.timestamps.clone();
    let h = harness(StateBody::Json(two_validators()), source, 1000);

    h.service.check(10, 999).await.unwrap();

    assert_eq!(*h.client.slot_time_requests.lock().unwrap(), vec![320]);
    assert_eq!(*timestamps.lock().unwrap(), vec![GENESIS_TIME + 320 * SECONDS_PER_SLOT]);
    assert_eq!(*h.client.state_requests.lock().unwrap(), vec![999]);
}

#[tokio::test]
async fn test_batching_does_not_change_result() {
    let entries: Vec<_> = (0..25)
        .map(|i| validator_json(i, (i % 4) as u8, "active_ongoing", 31_000_000_000 + i))
        .collect();
    let doc = state_document(&entries);

    let single = harness(StateBody::Json(doc.clone()), FakeRegistrySource::new(), 1000);
    let small = harness(StateBody::Json(doc), FakeRegistrySource::new(), 3);

    let a = single.service.check(1, 32).await.unwrap();
    let b = small.service.check(1, 32).await.unwrap();

    assert_eq!(a.meta, b.meta);
    assert_eq!(a.meta.active_validators, 25);
    assert_eq!(a.meta.active_validators_total_increments, BigInt::from(25 * 31));
    assert_eq!(single.summary.values(1).await, small.summary.values(1).await);
    assert_eq!(small.summary.len(1).await, 25);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = harness(StateBody::Json(two_validators()), FakeRegistrySource::new(), 1);

    let first = h.service.check(5, 160).await.unwrap();
    let records = h.summary.values(5).await;
    let second = h.service.check(5, 160).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.summary.values(5).await, records);
    assert_eq!(h.summary.get_meta(5).await.unwrap().state, Some(second.meta));
}

#[tokio::test]
async fn test_malformed_record_aborts_without_meta() {
    let doc = state_document(&[
        validator_json(0, 1, "active_ongoing", 32_000_000_000),
        validator_json(1, 2, "active_ongoing", 32_000_000_000),
        r#"{"index":"2","balance":"oops"}"#.to_string(),
    ]);
    let h = harness(StateBody::Json(doc), FakeRegistrySource::new(), 1);

    let err = h.service.check(7, 224).await.unwrap_err();

    assert!(matches!(err, StateError::Decode(_)), "unexpected error: {err:?}");
    assert!(h.summary.get_meta(7).await.is_none());
    // Records folded before the failure stay in the store
    assert_eq!(h.summary.len(7).await, 2);
}

#[tokio::test]
async fn test_rerun_after_partial_failure_matches_clean_run() {
    let good = state_document(&[
        validator_json(0, 1, "active_ongoing", 32_000_000_000),
        validator_json(1, 2, "active_exiting", 31_000_000_000),
        validator_json(2, 4, "withdrawal_done", 0),
    ]);
    let broken = state_document(&[
        validator_json(0, 1, "active_ongoing", 16_000_000_000),
        validator_json(1, 2, "active_ongoing", 16_000_000_000),
        r#"{"index":"2","balance":"oops"}"#.to_string(),
    ]);
    let h = harness(StateBody::Json(broken), FakeRegistrySource::new(), 1);

    let err = h.service.check(9, 288).await.unwrap_err();
    assert!(matches!(err, StateError::Decode(_)), "unexpected error: {err:?}");
    assert_eq!(h.summary.len(9).await, 2);

    h.client.set_body(StateBody::Json(good.clone()));
    let rerun = h.service.check(9, 288).await.unwrap();

    let clean = harness(StateBody::Json(good), FakeRegistrySource::new(), 1);
    let expected = clean.service.check(9, 288).await.unwrap();

    assert_eq!(rerun.meta, expected.meta);
    assert_eq!(rerun.meta.active_validators, 2);
    assert_eq!(h.summary.values(9).await, clean.summary.values(9).await);
    assert_eq!(h.summary.get_meta(9).await.unwrap().state, Some(expected.meta));
}

#[tokio::test]
async fn test_missing_data_field_is_decode_error() {
    let doc = r#"{"execution_optimistic":false,"finalized":true}"#.to_string();
    let h = harness(StateBody::Json(doc), FakeRegistrySource::new(), 1000);

    let err = h.service.check(7, 224).await.unwrap_err();

    assert!(matches!(err, StateError::Decode(_)), "unexpected error: {err:?}");
    assert!(h.summary.get_meta(7).await.is_none());
}

#[tokio::test]
async fn test_dropped_connection_is_stream_error() {
    let doc = two_validators();
    let truncated = doc[..doc.len() - 40].to_string();
    let h = harness(StateBody::FailAfter(truncated), FakeRegistrySource::new(), 1000);

    let err = h.service.check(8, 256).await.unwrap_err();

    assert!(matches!(err, StateError::StreamIo(_)), "unexpected error: {err:?}");
    assert!(h.summary.get_meta(8).await.is_none());
}

#[tokio::test]
async fn test_registry_failure_skips_state_download() {
    let source = FakeRegistrySource::failing();
    let loads = source.loads.clone();
    let h = harness(StateBody::Json(two_validators()), source, 1000);

    let err = h.service.check(9, 288).await.unwrap_err();

    assert!(matches!(err, StateError::RegistryRefresh(_)), "unexpected error: {err:?}");
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(h.client.state_requests.lock().unwrap().is_empty());
    assert_eq!(h.summary.len(9).await, 0);
}

#[tokio::test]
async fn test_no_active_validators_is_zero_stake() {
    let doc = state_document(&[
        validator_json(0, 1, "exited_unslashed", 32_000_000_000),
        validator_json(1, 2, "withdrawal_done", 0),
        validator_json(2, 3, "some_future_status", 32_000_000_000),
    ]);
    let h = harness(StateBody::Json(doc), FakeRegistrySource::new(), 1000);

    let err = h.service.check(11, 352).await.unwrap_err();

    assert!(matches!(err, StateError::Reward(RewardError::ZeroStake)), "unexpected error: {err:?}");
    assert!(h.summary.get_meta(11).await.is_none());
    assert_eq!(h.summary.get(11, 2).await.unwrap().val_status, Some(ValidatorStatus::Unknown));
}

#[tokio::test]
async fn test_empty_state_is_zero_stake() {
    let h = harness(StateBody::Json(state_document(&[])), FakeRegistrySource::new(), 1000);

    let err = h.service.check(12, 384).await.unwrap_err();

    assert!(matches!(err, StateError::Reward(RewardError::ZeroStake)), "unexpected error: {err:?}");
    assert_eq!(h.summary.len(12).await, 0);
}
