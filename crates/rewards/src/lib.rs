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

//! Epoch aggregate and base reward computation for validator duty summaries.

pub mod aggregate;
pub mod base_reward;
pub mod sqrt;

use num_bigint::BigInt;
use thiserror::Error;

pub use aggregate::{EpochAggregate, EpochStateMeta};
pub use base_reward::compute_base_reward;
pub use sqrt::{integer_sqrt, SqrtError};

/// Gwei per effective balance increment
pub const EFFECTIVE_BALANCE_INCREMENT: u64 = 1_000_000_000;
/// Scale applied to the summed increments before taking the square root
pub const INCREMENTS_SCALE: u64 = 1_000_000_000;
/// Base reward numerator (64 * 10^9)
pub const BASE_REWARD_NUMERATOR: u64 = 64 * 1_000_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewardError {
    #[error("Cannot compute base reward for an epoch with no active stake")]
    ZeroStake,

    #[error(transparent)]
    InvalidArgument(#[from] SqrtError),

    #[error("Base reward {0} does not fit in u64")]
    Overflow(BigInt),
}
