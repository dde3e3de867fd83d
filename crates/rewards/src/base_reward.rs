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

//! Epoch base reward computation.

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::{
    aggregate::EpochAggregate, sqrt::integer_sqrt, RewardError, BASE_REWARD_NUMERATOR,
    INCREMENTS_SCALE,
};

/// `floor(BASE_REWARD_NUMERATOR / isqrt(total_increments * INCREMENTS_SCALE))`
///
/// The increments were already divided by the effective balance increment, and are scaled back
/// up by [INCREMENTS_SCALE] here. Both constants are applied separately even though they are
/// currently equal.
pub fn compute_base_reward(aggregate: &EpochAggregate) -> Result<u64, RewardError> {
    if aggregate.active_validators == 0 || aggregate.total_increments.is_zero() {
        return Err(RewardError::ZeroStake);
    }

    let total_balance = &aggregate.total_increments * BigInt::from(INCREMENTS_SCALE);
    let root = integer_sqrt(&total_balance)?;
    // total_balance >= INCREMENTS_SCALE when increments are positive, so root is non-zero
    if root.is_zero() {
        return Err(RewardError::ZeroStake);
    }

    let reward = BigInt::from(BASE_REWARD_NUMERATOR) / root;
    reward.to_u64().ok_or(RewardError::Overflow(reward))
}
