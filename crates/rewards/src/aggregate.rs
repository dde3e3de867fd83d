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

//! Running epoch totals over the active validator set.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::{base_reward::compute_base_reward, RewardError, EFFECTIVE_BALANCE_INCREMENT};

/// Totals accumulated while folding one epoch's validator state snapshot.
///
/// Owned by a single in-flight check and consumed by [EpochAggregate::finalize].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochAggregate {
    /// Number of validators counted as active
    pub active_validators: u64,
    /// Sum of `effective_balance / EFFECTIVE_BALANCE_INCREMENT` over active validators
    pub total_increments: BigInt,
}

impl EpochAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one active validator with the given effective balance (gwei).
    pub fn add_active(&mut self, effective_balance: u64) {
        self.active_validators += 1;
        self.total_increments += effective_balance / EFFECTIVE_BALANCE_INCREMENT;
    }

    /// Compute the base reward and produce the epoch state metadata.
    ///
    /// Fails with [RewardError::ZeroStake] for an epoch with no active stake.
    pub fn finalize(self) -> Result<EpochStateMeta, RewardError> {
        let base_reward = compute_base_reward(&self)?;
        Ok(EpochStateMeta {
            active_validators: self.active_validators,
            active_validators_total_increments: self.total_increments,
            base_reward,
        })
    }
}

/// Finalized per-epoch state metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochStateMeta {
    pub active_validators: u64,
    #[serde(with = "bigint_string")]
    pub active_validators_total_increments: BigInt,
    pub base_reward: u64,
}

mod bigint_string {
    use num_bigint::BigInt;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
