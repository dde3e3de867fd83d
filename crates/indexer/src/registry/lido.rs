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

use std::future::Future;

use alloy::{
    eips::{BlockId, BlockNumberOrTag},
    primitives::{Address, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::client::RpcClient,
    sol,
    transports::layers::RetryBackoffLayer,
};
use async_trait::async_trait;
use url::Url;

use super::{ContractSource, RegistryError, RegistryOperator, RegistrySnapshot, RegistrySource};
use crate::state::BlsPublicKey;

/// Keys fetched per `getSigningKeys` call
const KEYS_CHUNK_SIZE: u64 = 200;
const PUBKEY_LENGTH: usize = 48;

sol! {
    #[sol(rpc)]
    interface INodeOperatorsRegistry {
        function getNodeOperatorsCount() external view returns (uint256);
        function getNodeOperator(uint256 _nodeOperatorId, bool _fullInfo) external view returns (
            bool active,
            string name,
            address rewardAddress,
            uint64 totalVettedValidators,
            uint64 totalExitedValidators,
            uint64 totalAddedValidators,
            uint64 totalDepositedValidators
        );
        function getSigningKeys(
            uint256 _nodeOperatorId,
            uint256 _offset,
            uint256 _limit
        ) external view returns (
            bytes pubkeys,
            bytes signatures,
            bool[] used
        );
    }

    #[sol(rpc)]
    interface ILido {
        function getBufferedEther() external view returns (uint256);
    }
}

/// Binary search over `0..=latest` for the highest block whose time is at or before
/// `timestamp`. Block times are non-decreasing. `None` if even block 0 is later.
async fn block_at_or_before<F, Fut, E>(
    latest: u64,
    timestamp: u64,
    block_time: F,
) -> Result<Option<u64>, E>
where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = Result<u64, E>>,
{
    if block_time(0).await? > timestamp {
        return Ok(None);
    }

    let (mut low, mut high) = (0, latest);
    while low < high {
        let mid = low + (high - low).div_ceil(2);
        if block_time(mid).await? <= timestamp {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    Ok(Some(low))
}

/// Registry read from a Lido node operators registry contract.
///
/// Operators and keys are read at the last block produced at or before the requested
/// timestamp. Buffered ether is read at the latest block.
pub struct LidoRegistrySource {
    provider: DynProvider,
    registry_address: Address,
    lido_address: Address,
}

impl LidoRegistrySource {
    pub fn new(rpc_url: Url, registry_address: Address, lido_address: Address) -> Self {
        let provider = ProviderBuilder::new()
            .connect_client(
                RpcClient::builder().layer(RetryBackoffLayer::new(3, 1000, 200)).http(rpc_url),
            )
            .erased();
        Self { provider, registry_address, lido_address }
    }

    /// Last block whose timestamp is not after `timestamp`.
    async fn block_at(&self, timestamp: u64) -> Result<BlockId, RegistryError> {
        let latest = self.provider.get_block_number().await?;
        let number = block_at_or_before(latest, timestamp, |number| async move {
            let block = self.provider.get_block_by_number(BlockNumberOrTag::Number(number)).await?;
            block
                .map(|block| block.header.timestamp)
                .ok_or_else(|| RegistryError::Invalid(format!("block {number} not found")))
        })
        .await?
        .ok_or_else(|| {
            RegistryError::Invalid(format!("no block at or before timestamp {timestamp}"))
        })?;
        Ok(BlockId::number(number))
    }

    async fn load_operator_keys(
        &self,
        block: BlockId,
        operator_index: u64,
        total_keys: u64,
    ) -> Result<Vec<(BlsPublicKey, u64)>, RegistryError> {
        let registry = INodeOperatorsRegistry::new(self.registry_address, &self.provider);
        let mut keys = Vec::with_capacity(total_keys as usize);

        let mut offset = 0;
        while offset < total_keys {
            let limit = KEYS_CHUNK_SIZE.min(total_keys - offset);
            let chunk = registry
                .getSigningKeys(U256::from(operator_index), U256::from(offset), U256::from(limit))
                .block(block)
                .call()
                .await?;

            if chunk.pubkeys.len() % PUBKEY_LENGTH != 0 {
                return Err(RegistryError::Invalid(format!(
                    "operator {} returned {} key bytes, not a multiple of {}",
                    operator_index,
                    chunk.pubkeys.len(),
                    PUBKEY_LENGTH
                )));
            }
            keys.extend(
                chunk
                    .pubkeys
                    .chunks_exact(PUBKEY_LENGTH)
                    .map(|key| (BlsPublicKey::from_slice(key), operator_index)),
            );
            offset += limit;
        }

        Ok(keys)
    }
}

#[async_trait]
impl RegistrySource for LidoRegistrySource {
    async fn load(&self, timestamp: u64) -> Result<RegistrySnapshot, RegistryError> {
        let block = self.block_at(timestamp).await?;
        tracing::debug!("Loading Lido registry for timestamp {} at {:?}", timestamp, block);
        let registry = INodeOperatorsRegistry::new(self.registry_address, &self.provider);

        let count = registry.getNodeOperatorsCount().block(block).call().await?;
        let count = u64::try_from(count)
            .map_err(|_| RegistryError::Invalid(format!("operator count {count} overflows")))?;

        let mut snapshot = RegistrySnapshot::default();
        for index in 0..count {
            let operator =
                registry.getNodeOperator(U256::from(index), true).block(block).call().await?;
            let keys = self.load_operator_keys(block, index, operator.totalAddedValidators).await?;
            tracing::debug!(
                "Loaded {} keys for operator {} ({})",
                keys.len(),
                index,
                operator.name
            );

            snapshot.keys.extend(keys);
            snapshot.operators.push(RegistryOperator {
                index,
                name: operator.name,
                total_signing_keys: operator.totalAddedValidators,
                used_signing_keys: operator.totalDepositedValidators,
            });
        }

        Ok(snapshot)
    }

    fn contract(&self) -> Option<&dyn ContractSource> {
        Some(self)
    }
}

#[async_trait]
impl ContractSource for LidoRegistrySource {
    async fn buffered_ether(&self) -> Result<U256, RegistryError> {
        let lido = ILido::new(self.lido_address, &self.provider);
        Ok(lido.getBufferedEther().call().await?)
    }
}
