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

//! Exact integer square root over arbitrary-precision integers.

use num_bigint::{BigInt, Sign};
use num_traits::{One, Zero};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqrtError {
    #[error("Invalid argument: square root of negative value {0}")]
    InvalidArgument(BigInt),
}

/// Returns `floor(sqrt(n))`, i.e. the unique `r >= 0` with `r*r <= n < (r+1)*(r+1)`.
///
/// Newton's iteration `x' = (x + n / x) / 2` in integer arithmetic, seeded with a power of two
/// that is strictly above the root so the sequence decreases monotonically until it converges.
pub fn integer_sqrt(n: &BigInt) -> Result<BigInt, SqrtError> {
    match n.sign() {
        Sign::Minus => return Err(SqrtError::InvalidArgument(n.clone())),
        Sign::NoSign => return Ok(BigInt::zero()),
        Sign::Plus => {}
    }
    if n < &BigInt::from(4u8) {
        return Ok(BigInt::one());
    }

    // 2^ceil(bits/2) > sqrt(n)
    let mut x = BigInt::one() << n.bits().div_ceil(2);
    loop {
        let next = (&x + n / &x) >> 1u32;
        if next >= x {
            return Ok(x);
        }
        x = next;
    }
}
