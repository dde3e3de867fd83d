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

//! Validator key registry mapping public keys to node operators.

pub mod file;
pub mod lido;

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::U256;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::state::BlsPublicKey;

pub use file::FileRegistrySource;
pub use lido::LidoRegistrySource;

const GWEI_WEI_RATIO: u64 = 1_000_000_000;
const ETH_GWEI_RATIO: u64 = 1_000_000_000;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Failed to read registry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid registry file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Registry contract call failed: {0}")]
    Contract(#[from] alloy::contract::Error),

    #[error("Execution client request failed: {0}")]
    Rpc(#[from] alloy::transports::TransportError),

    #[error("Invalid registry data: {0}")]
    Invalid(String),
}

/// Node operator as known to the registry source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOperator {
    pub index: u64,
    pub name: String,
    pub total_signing_keys: u64,
    pub used_signing_keys: u64,
}

/// Operator controlling a validator key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorKey {
    pub operator_index: u64,
    pub operator_name: String,
}

/// Full registry contents as loaded from a source
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub operators: Vec<RegistryOperator>,
    /// (validator public key, operator index)
    pub keys: Vec<(BlsPublicKey, u64)>,
}

/// Where operator and key data comes from.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Load the registry as of the given unix timestamp.
    async fn load(&self, timestamp: u64) -> Result<RegistrySnapshot, RegistryError>;

    /// On-chain query capability, for sources that are backed by a contract.
    fn contract(&self) -> Option<&dyn ContractSource> {
        None
    }
}

#[async_trait]
pub trait ContractSource: Send + Sync {
    /// Ether buffered in the staking contract, in wei.
    async fn buffered_ether(&self) -> Result<U256, RegistryError>;
}

/// Immutable pubkey index handed out for the duration of a check
#[derive(Debug, Default)]
pub struct RegistryKeys {
    timestamp: Option<u64>,
    operators: Vec<RegistryOperator>,
    keys: HashMap<BlsPublicKey, OperatorKey>,
}

impl RegistryKeys {
    fn from_snapshot(timestamp: u64, snapshot: RegistrySnapshot) -> Result<Self, RegistryError> {
        let names: HashMap<u64, &str> =
            snapshot.operators.iter().map(|o| (o.index, o.name.as_str())).collect();

        let mut keys = HashMap::with_capacity(snapshot.keys.len());
        for (pubkey, operator_index) in snapshot.keys {
            let Some(name) = names.get(&operator_index) else {
                return Err(RegistryError::Invalid(format!(
                    "key {pubkey} references unknown operator {operator_index}"
                )));
            };
            keys.insert(pubkey, OperatorKey { operator_index, operator_name: name.to_string() });
        }

        Ok(Self { timestamp: Some(timestamp), operators: snapshot.operators, keys })
    }

    pub fn get_operator_key(&self, pubkey: &BlsPublicKey) -> Option<&OperatorKey> {
        self.keys.get(pubkey)
    }

    pub fn operators(&self) -> &[RegistryOperator] {
        &self.operators
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Contract-derived registry figures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractReport {
    pub total_signing_keys: u64,
    pub used_signing_keys: u64,
    /// Buffered ether, whole ether units
    pub buffered_ether: U256,
}

pub type KeysRegistryObj = Arc<KeysRegistry>;

pub struct KeysRegistry {
    source: Box<dyn RegistrySource>,
    keys: RwLock<Arc<RegistryKeys>>,
}

impl KeysRegistry {
    pub fn new(source: Box<dyn RegistrySource>) -> Self {
        Self { source, keys: RwLock::new(Arc::new(RegistryKeys::default())) }
    }

    pub fn source(&self) -> &dyn RegistrySource {
        self.source.as_ref()
    }

    /// Reload the registry so that key mappings reflect the chain as of `timestamp`.
    ///
    /// The previous index stays in place if loading fails.
    pub async fn update_keys_registry(&self, timestamp: u64) -> Result<(), RegistryError> {
        let start = std::time::Instant::now();
        let snapshot = self.source.load(timestamp).await?;
        let keys = RegistryKeys::from_snapshot(timestamp, snapshot)?;
        if keys.is_empty() {
            tracing::warn!("Keys registry for timestamp {} has no signing keys", timestamp);
        }
        tracing::info!(
            "Keys registry updated for timestamp {}: {} operators, {} keys in {:.2}s",
            timestamp,
            keys.operators.len(),
            keys.len(),
            start.elapsed().as_secs_f64()
        );
        *self.keys.write().await = Arc::new(keys);
        Ok(())
    }

    /// Current key index.
    pub async fn keys(&self) -> Arc<RegistryKeys> {
        self.keys.read().await.clone()
    }

    pub async fn get_operator_key(&self, pubkey: &BlsPublicKey) -> Option<OperatorKey> {
        self.keys.read().await.get_operator_key(pubkey).cloned()
    }

    /// Signing key totals and buffered ether, or `None` when the source has no contract.
    pub async fn contract_report(&self) -> Result<Option<ContractReport>, RegistryError> {
        let Some(contract) = self.source.contract() else {
            return Ok(None);
        };

        let keys = self.keys().await;
        let total_signing_keys = keys.operators.iter().map(|o| o.total_signing_keys).sum();
        let used_signing_keys = keys.operators.iter().map(|o| o.used_signing_keys).sum();
        let buffered_wei = contract.buffered_ether().await?;
        let buffered_ether =
            buffered_wei / U256::from(GWEI_WEI_RATIO) / U256::from(ETH_GWEI_RATIO);

        Ok(Some(ContractReport { total_signing_keys, used_signing_keys, buffered_ether }))
    }
}
