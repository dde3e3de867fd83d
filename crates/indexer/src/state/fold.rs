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

//! Folding decoded validator states into duty records and epoch totals.

use duties_rewards::EpochAggregate;

use super::types::ValidatorStateRecord;
use crate::{
    registry::{OperatorKey, RegistryKeys},
    summary::{StoreError, SummaryStore, ValidatorDuty},
};

/// Build the duty record for `record` and count it toward `aggregate` if it is active.
pub fn fold_record(
    epoch: u64,
    record: &ValidatorStateRecord,
    operator: Option<&OperatorKey>,
    aggregate: &mut EpochAggregate,
) -> ValidatorDuty {
    if record.status.is_active() {
        aggregate.add_active(record.validator.effective_balance);
    }

    ValidatorDuty {
        epoch,
        val_id: record.index,
        val_pubkey: Some(record.validator.pubkey),
        val_nos_id: operator.map(|o| o.operator_index),
        val_nos_name: operator.map(|o| o.operator_name.clone()),
        val_slashed: Some(record.validator.slashed),
        val_status: Some(record.status),
        val_balance: Some(record.balance),
        val_effective_balance: Some(record.validator.effective_balance),
        ..Default::default()
    }
}

/// Counters gathered while folding one epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    pub validators: u64,
    /// Validators whose key is not in the registry
    pub operator_misses: u64,
}

/// Fold state for a single check: owns the epoch aggregate for its whole lifetime.
pub struct DutyFold<'a, S: ?Sized> {
    epoch: u64,
    keys: &'a RegistryKeys,
    summary: &'a S,
    aggregate: EpochAggregate,
    stats: FoldStats,
}

impl<'a, S: SummaryStore + Send + Sync + ?Sized> DutyFold<'a, S> {
    pub fn new(epoch: u64, keys: &'a RegistryKeys, summary: &'a S) -> Self {
        Self { epoch, keys, summary, aggregate: EpochAggregate::new(), stats: FoldStats::default() }
    }

    /// Fold every record of a batch, in order, writing each duty record to the summary store.
    pub async fn apply_batch(&mut self, batch: &[ValidatorStateRecord]) -> Result<(), StoreError> {
        for record in batch {
            let operator = self.keys.get_operator_key(&record.validator.pubkey);
            if operator.is_none() {
                self.stats.operator_misses += 1;
            }
            let duty = fold_record(self.epoch, record, operator, &mut self.aggregate);
            self.summary.set(duty).await?;
            self.stats.validators += 1;
        }
        Ok(())
    }

    pub fn into_parts(self) -> (EpochAggregate, FoldStats) {
        (self.aggregate, self.stats)
    }
}
