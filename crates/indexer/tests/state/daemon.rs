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

use std::{sync::Arc, time::Duration};

use duties_indexer::{
    daemon::{StateIndexerService, StateIndexerServiceConfig},
    db::{SummaryDb, SummaryIndexerDb},
    registry::KeysRegistry,
    state::StateServiceConfig,
};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use super::common::{
    state_document, validator_json, FakeClient, FakeRegistrySource, StateBody, OPERATOR_NAME,
};

struct TestIndexer {
    client: Arc<FakeClient>,
    db: Arc<SummaryDb>,
    service: StateIndexerService,
    _temp_file: NamedTempFile,
}

fn config(start_epoch: Option<u64>, end_epoch: Option<u64>) -> StateIndexerServiceConfig {
    StateIndexerServiceConfig {
        interval: Duration::from_secs(1),
        retries: 1,
        start_epoch,
        end_epoch,
        check_timeout: Some(Duration::from_secs(30)),
        state: StateServiceConfig::default(),
    }
}

async fn setup(
    body: StateBody,
    finalized_slot: u64,
    start_epoch: Option<u64>,
    end_epoch: Option<u64>,
) -> TestIndexer {
    setup_with(body, finalized_slot, config(start_epoch, end_epoch)).await
}

async fn setup_with(
    body: StateBody,
    finalized_slot: u64,
    config: StateIndexerServiceConfig,
) -> TestIndexer {
    let temp_file = NamedTempFile::new().unwrap();
    let db_url = format!("sqlite:{}", temp_file.path().display());
    let db = Arc::new(SummaryDb::new(&db_url).await.unwrap());
    let client = Arc::new(FakeClient::new(body).with_finalized_slot(finalized_slot));

    let service = StateIndexerService::new(
        client.clone(),
        Arc::new(KeysRegistry::new(Box::new(FakeRegistrySource::new()))),
        db.clone(),
        config,
    );
    TestIndexer { client, db, service, _temp_file: temp_file }
}

fn good_state() -> String {
    state_document(&[
        validator_json(0, 1, "active_ongoing", 32_000_000_000),
        validator_json(1, 2, "active_exiting", 32_000_000_000),
        validator_json(2, 7, "active_slashed", 32_000_000_000),
    ])
}

#[tokio::test]
async fn test_run_persists_finalized_epochs() {
    let t = setup(StateBody::Json(good_state()), 3 * 32 + 5, Some(2), None).await;

    assert_eq!(t.service.run().await.unwrap(), 2);
    assert_eq!(*t.client.state_requests.lock().unwrap(), vec![64, 96]);
    assert_eq!(t.db.get_last_state_epoch().await.unwrap(), Some(3));

    for epoch in [2, 3] {
        let meta = t.db.get_epoch_meta(epoch).await.unwrap().unwrap();
        assert_eq!(meta.active_validators, 3);
        // 64e9 / isqrt(96e9)
        assert_eq!(meta.base_reward, 206_559);
    }
    let duties = t.db.get_validator_duties(3, 0, 10).await.unwrap();
    assert_eq!(duties.len(), 3);
    assert_eq!(duties[0].val_nos_name.as_deref(), Some(OPERATOR_NAME));
    assert_eq!(duties[2].val_nos_id, None);

    // Nothing new is finalized
    assert_eq!(t.service.run().await.unwrap(), 0);
    assert_eq!(t.client.state_requests.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_check_is_not_persisted() {
    let broken = state_document(&[r#"{"index":"0"}"#.to_string()]);
    let t = setup(StateBody::Json(broken), 2 * 32, Some(2), None).await;

    assert!(t.service.run().await.is_err());
    assert_eq!(t.db.get_last_state_epoch().await.unwrap(), None);
    assert!(t.db.get_epoch_meta(2).await.unwrap().is_none());
    assert!(t.db.get_validator_duties(2, 0, 10).await.unwrap().is_empty());

    t.client.set_body(StateBody::Json(good_state()));
    assert_eq!(t.service.run().await.unwrap(), 1);
    assert_eq!(t.db.get_last_state_epoch().await.unwrap(), Some(2));
    assert_eq!(t.db.get_validator_duties(2, 0, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_end_epoch_bounds_run() {
    let t = setup(StateBody::Json(good_state()), 10 * 32, Some(1), Some(2)).await;

    assert_eq!(t.service.run().await.unwrap(), 2);
    assert_eq!(*t.client.state_requests.lock().unwrap(), vec![32, 64]);
    assert_eq!(t.db.get_last_state_epoch().await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_resumes_after_last_state_epoch() {
    let t = setup(StateBody::Json(good_state()), 6 * 32, Some(0), None).await;
    t.db.set_last_state_epoch(4).await.unwrap();

    assert_eq!(t.service.run().await.unwrap(), 2);
    assert_eq!(*t.client.state_requests.lock().unwrap(), vec![160, 192]);
}

#[tokio::test]
async fn test_stalled_state_times_out_and_releases_stream() {
    let prefix = r#"{"data":["#.to_string();
    let mut cfg = config(Some(2), None);
    cfg.check_timeout = Some(Duration::from_millis(200));
    let t = setup_with(StateBody::Stall(prefix), 2 * 32, cfg).await;

    let err = t.service.run().await.unwrap_err();
    assert!(format!("{err:#}").contains("timed out"), "unexpected error: {err:#}");
    assert_eq!(t.db.get_last_state_epoch().await.unwrap(), None);
    assert!(t.db.get_epoch_meta(2).await.unwrap().is_none());

    let mut writer = t.client.stalled.lock().unwrap().pop().unwrap();
    let released = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if writer.write_all(br#"{"index":"0"}"#).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "state stream should be closed after the timeout");
}

#[tokio::test]
async fn test_zero_slots_per_epoch_is_rejected() {
    let mut cfg = config(Some(0), None);
    cfg.state.slots_per_epoch = 0;
    let t = setup_with(StateBody::Json(good_state()), 64, cfg).await;

    let err = t.service.run().await.unwrap_err();
    assert!(err.to_string().contains("Slots per epoch"), "unexpected error: {err:#}");
    assert!(t.client.state_requests.lock().unwrap().is_empty());
}
