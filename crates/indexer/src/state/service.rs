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

use duties_rewards::{EpochStateMeta, RewardError};
use thiserror::Error;

use super::{
    decoder::{
        DecodeError, StateDecoder, DEFAULT_BUFFERED_BATCHES, STATE_BATCH_SIZE, STATE_DATA_FIELD,
    },
    fold::DutyFold,
    types::ValidatorStateRecord,
};
use crate::{
    client::{ClientError, ConsensusClientObj},
    registry::{KeysRegistryObj, RegistryError},
    summary::{EpochMeta, StoreError, SummaryStoreObj},
};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Chain client error: {0}")]
    Client(#[from] ClientError),

    #[error("Registry refresh failed: {0}")]
    RegistryRefresh(#[from] RegistryError),

    #[error("State stream read failed: {0}")]
    StreamIo(std::io::Error),

    #[error("State decoding failed: {0}")]
    Decode(DecodeError),

    #[error("Summary store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reward(#[from] RewardError),

    #[error("First slot of epoch {0} does not fit in u64")]
    SlotOverflow(u64),
}

impl From<DecodeError> for StateError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Io(err) => StateError::StreamIo(err),
            other => StateError::Decode(other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StateServiceConfig {
    /// Slots per epoch, used to locate an epoch's first slot
    pub slots_per_epoch: u64,
    pub batch_size: usize,
    pub buffered_batches: usize,
}

impl Default for StateServiceConfig {
    fn default() -> Self {
        Self {
            slots_per_epoch: 32,
            batch_size: STATE_BATCH_SIZE,
            buffered_batches: DEFAULT_BUFFERED_BATCHES,
        }
    }
}

/// Outcome of a successful state check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCheckReport {
    pub epoch: u64,
    pub state_slot: u64,
    /// Validator records folded into duty records
    pub validators: u64,
    /// Validators whose public key is not controlled by a known operator
    pub operator_misses: u64,
    pub meta: EpochStateMeta,
}

/// Runs the per-epoch validator state check.
pub struct StateService {
    client: ConsensusClientObj,
    registry: KeysRegistryObj,
    summary: SummaryStoreObj,
    decoder: StateDecoder,
    config: StateServiceConfig,
}

impl StateService {
    pub fn new(
        client: ConsensusClientObj,
        registry: KeysRegistryObj,
        summary: SummaryStoreObj,
        config: StateServiceConfig,
    ) -> Self {
        let decoder =
            StateDecoder::new(STATE_DATA_FIELD, config.batch_size, config.buffered_batches);
        Self { client, registry, summary, decoder, config }
    }

    pub fn config(&self) -> &StateServiceConfig {
        &self.config
    }

    /// Fold the validator state snapshot at `state_slot` into duty records for `epoch` and
    /// publish the epoch state metadata.
    ///
    /// Any failure aborts the check before metadata is published. Duty records written before
    /// the failure stay in the summary store; a rerun overwrites them by key.
    pub async fn check(&self, epoch: u64, state_slot: u64) -> Result<StateCheckReport, StateError> {
        let start = std::time::Instant::now();
        tracing::info!("Checking state duties for epoch {} at slot {}", epoch, state_slot);

        let first_slot = epoch
            .checked_mul(self.config.slots_per_epoch)
            .ok_or(StateError::SlotOverflow(epoch))?;
        let slot_time = self.client.get_slot_time(first_slot).await?;
        self.registry.update_keys_registry(slot_time).await?;
        let keys = self.registry.keys().await;

        tracing::info!("Getting all validators state");
        let reader = self.client.get_validators_state(state_slot).await?;

        tracing::info!("Processing all validators state");
        let mut batches = self.decoder.decode::<ValidatorStateRecord, _>(reader);
        let mut fold = DutyFold::new(epoch, &keys, self.summary.as_ref());
        while let Some(batch) = batches.next_batch().await {
            fold.apply_batch(&batch?).await?;
            // Let other work on this runtime make progress between batches.
            tokio::task::yield_now().await;
        }

        let (aggregate, stats) = fold.into_parts();
        let meta = aggregate.finalize()?;
        self.summary.set_meta(epoch, EpochMeta { state: Some(meta.clone()) }).await?;

        if stats.operator_misses > 0 {
            tracing::info!(
                "{} of {} validators in epoch {} are not controlled by a known operator",
                stats.operator_misses,
                stats.validators,
                epoch
            );
        }
        tracing::info!(
            "State check for epoch {} completed in {:.2}s: {} validators, {} active, \
             {} total increments, base reward {}",
            epoch,
            start.elapsed().as_secs_f64(),
            stats.validators,
            meta.active_validators,
            meta.active_validators_total_increments,
            meta.base_reward
        );

        Ok(StateCheckReport {
            epoch,
            state_slot,
            validators: stats.validators,
            operator_misses: stats.operator_misses,
            meta,
        })
    }
}
