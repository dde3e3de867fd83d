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

//! Per-validator, per-epoch duty summaries assembled by independent collectors.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use duties_rewards::EpochStateMeta;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::state::{BlsPublicKey, ValidatorStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Summary store unavailable: {0}")]
    Unavailable(String),
}

/// Partial duty record for one validator in one epoch.
///
/// Collectors fill in the fields they own and leave the rest as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorDuty {
    pub epoch: u64,
    pub val_id: u64,
    pub val_pubkey: Option<BlsPublicKey>,
    pub val_nos_id: Option<u64>,
    pub val_nos_name: Option<String>,
    pub val_slashed: Option<bool>,
    pub val_status: Option<ValidatorStatus>,
    pub val_balance: Option<u64>,
    pub val_effective_balance: Option<u64>,
    pub val_balance_withdrawn: Option<u64>,
}

impl ValidatorDuty {
    /// Overwrite every field that `other` has set.
    pub fn merge(&mut self, other: ValidatorDuty) {
        fn take<T>(dst: &mut Option<T>, src: Option<T>) {
            if src.is_some() {
                *dst = src;
            }
        }
        take(&mut self.val_pubkey, other.val_pubkey);
        take(&mut self.val_nos_id, other.val_nos_id);
        take(&mut self.val_nos_name, other.val_nos_name);
        take(&mut self.val_slashed, other.val_slashed);
        take(&mut self.val_status, other.val_status);
        take(&mut self.val_balance, other.val_balance);
        take(&mut self.val_effective_balance, other.val_effective_balance);
        take(&mut self.val_balance_withdrawn, other.val_balance_withdrawn);
    }
}

/// Epoch-level metadata sections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochMeta {
    pub state: Option<EpochStateMeta>,
}

pub type SummaryStoreObj = Arc<dyn SummaryStore + Send + Sync>;

#[async_trait]
pub trait SummaryStore {
    /// Merge a partial record into the (epoch, val_id) entry.
    async fn set(&self, duty: ValidatorDuty) -> Result<(), StoreError>;

    /// Replace the epoch metadata. Last write wins.
    async fn set_meta(&self, epoch: u64, meta: EpochMeta) -> Result<(), StoreError>;
}

/// Everything collected for one epoch
#[derive(Debug, Clone, Default)]
pub struct EpochSummary {
    pub validators: HashMap<u64, ValidatorDuty>,
    pub meta: Option<EpochMeta>,
}

/// In-memory summary store keyed by epoch.
#[derive(Debug, Default)]
pub struct SummaryService {
    epochs: Mutex<BTreeMap<u64, EpochSummary>>,
}

impl SummaryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, epoch: u64, val_id: u64) -> Option<ValidatorDuty> {
        self.epochs.lock().await.get(&epoch)?.validators.get(&val_id).cloned()
    }

    /// `None` means the metadata has not been computed for this epoch.
    pub async fn get_meta(&self, epoch: u64) -> Option<EpochMeta> {
        self.epochs.lock().await.get(&epoch)?.meta.clone()
    }

    pub async fn len(&self, epoch: u64) -> usize {
        self.epochs.lock().await.get(&epoch).map_or(0, |s| s.validators.len())
    }

    /// Validator records of an epoch ordered by validator id.
    pub async fn values(&self, epoch: u64) -> Vec<ValidatorDuty> {
        let epochs = self.epochs.lock().await;
        let Some(summary) = epochs.get(&epoch) else {
            return vec![];
        };
        let mut values: Vec<_> = summary.validators.values().cloned().collect();
        values.sort_by_key(|d| d.val_id);
        values
    }

    /// Remove and return an epoch, typically once it has been persisted.
    pub async fn take_epoch(&self, epoch: u64) -> Option<EpochSummary> {
        self.epochs.lock().await.remove(&epoch)
    }

    /// Drop all epochs older than `epoch`.
    pub async fn prune_before(&self, epoch: u64) {
        let mut epochs = self.epochs.lock().await;
        *epochs = epochs.split_off(&epoch);
    }
}

#[async_trait]
impl SummaryStore for SummaryService {
    async fn set(&self, duty: ValidatorDuty) -> Result<(), StoreError> {
        let mut epochs = self.epochs.lock().await;
        let validators = &mut epochs.entry(duty.epoch).or_default().validators;
        match validators.get_mut(&duty.val_id) {
            Some(existing) => existing.merge(duty),
            None => {
                validators.insert(duty.val_id, duty);
            }
        }
        Ok(())
    }

    async fn set_meta(&self, epoch: u64, meta: EpochMeta) -> Result<(), StoreError> {
        self.epochs.lock().await.entry(epoch).or_default().meta = Some(meta);
        Ok(())
    }
}
