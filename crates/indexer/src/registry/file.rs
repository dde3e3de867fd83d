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

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use super::{RegistryError, RegistryOperator, RegistrySnapshot, RegistrySource};
use crate::state::BlsPublicKey;

/// Registry loaded from a YAML file:
///
/// ```yaml
/// operators:
///   - index: 0
///     name: Operator A
///     keys:
///       - "0xa1d1ad07..."
/// ```
///
/// The file is re-read on every update, so edits are picked up by the next check.
pub struct FileRegistrySource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    operators: Vec<FileOperator>,
}

#[derive(Debug, Deserialize)]
struct FileOperator {
    index: u64,
    name: String,
    #[serde(default)]
    keys: Vec<BlsPublicKey>,
}

impl FileRegistrySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(contents: &str) -> Result<RegistrySnapshot, RegistryError> {
        let file: RegistryFile = serde_yaml::from_str(contents)?;

        let mut snapshot = RegistrySnapshot::default();
        for operator in file.operators {
            let key_count = operator.keys.len() as u64;
            snapshot.keys.extend(operator.keys.into_iter().map(|key| (key, operator.index)));
            snapshot.operators.push(RegistryOperator {
                index: operator.index,
                name: operator.name,
                total_signing_keys: key_count,
                used_signing_keys: key_count,
            });
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl RegistrySource for FileRegistrySource {
    async fn load(&self, _timestamp: u64) -> Result<RegistrySnapshot, RegistryError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Self::parse(&contents)
    }
}
