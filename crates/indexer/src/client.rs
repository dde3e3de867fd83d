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

//! Consensus layer (beacon node) client.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header::ACCEPT, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tokio::{io::AsyncRead, sync::OnceCell};
use tokio_util::io::StreamReader;
use url::Url;

use crate::state::types::quoted_u64;

/// Raw body of a validator state snapshot
pub type StateReader = Box<dyn AsyncRead + Send + Unpin>;

pub type ConsensusClientObj = Arc<dyn ConsensusClient + Send + Sync>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error {0:?}")]
    Http(#[from] reqwest::Error),

    #[error("Beacon node returned {status} for {url}: {body}")]
    Status { status: StatusCode, url: String, body: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait ConsensusClient {
    /// Unix timestamp of the start of `slot`.
    async fn get_slot_time(&self, slot: u64) -> Result<u64, ClientError>;

    /// Open the `GET /eth/v1/beacon/states/{slot}/validators` response body as a byte stream.
    async fn get_validators_state(&self, slot: u64) -> Result<StateReader, ClientError>;

    /// Slot of the latest finalized block header.
    async fn get_finalized_slot(&self) -> Result<u64, ClientError>;
}

#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct GenesisData {
    #[serde(with = "quoted_u64")]
    genesis_time: u64,
}

#[derive(Debug, Deserialize)]
struct HeaderData {
    header: SignedHeader,
}

#[derive(Debug, Deserialize)]
struct SignedHeader {
    message: HeaderMessage,
}

#[derive(Debug, Deserialize)]
struct HeaderMessage {
    #[serde(with = "quoted_u64")]
    slot: u64,
}

/// Beacon node HTTP API client
pub struct BeaconClient {
    client: reqwest::Client,
    server: Url,
    seconds_per_slot: u64,
    genesis_time: OnceCell<u64>,
}

impl BeaconClient {
    pub fn new(server: Url, seconds_per_slot: u64, timeout: Duration) -> Result<Self, ClientError> {
        // Only the connection phase is bounded; the state body can take minutes to stream.
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self { client, server, seconds_per_slot, genesis_time: OnceCell::new() })
    }

    fn eth_path(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut path = self.server.clone();
        path.path_segments_mut()
            .map_err(|()| ClientError::InvalidUrl(self.server.to_string()))?
            .pop_if_empty()
            .push("eth")
            .push("v1")
            .extend(segments);
        Ok(path)
    }

    async fn get_response(&self, url: Url) -> Result<Response, ClientError> {
        let response =
            self.client.get(url.clone()).header(ACCEPT, "application/json").send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status { status, url: url.to_string(), body })
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        Ok(self.get_response(url).await?.json().await?)
    }

    async fn genesis_time(&self) -> Result<u64, ClientError> {
        self.genesis_time
            .get_or_try_init(|| async {
                let url = self.eth_path(&["beacon", "genesis"])?;
                let genesis: DataResponse<GenesisData> = self.get(url).await?;
                tracing::debug!("Beacon genesis time: {}", genesis.data.genesis_time);
                Ok::<_, ClientError>(genesis.data.genesis_time)
            })
            .await
            .copied()
    }
}

#[async_trait]
impl ConsensusClient for BeaconClient {
    async fn get_slot_time(&self, slot: u64) -> Result<u64, ClientError> {
        Ok(self.genesis_time().await? + slot * self.seconds_per_slot)
    }

    async fn get_validators_state(&self, slot: u64) -> Result<StateReader, ClientError> {
        let url = self.eth_path(&["beacon", "states", &slot.to_string(), "validators"])?;
        let response = self.get_response(url).await?;
        let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
        Ok(Box::new(StreamReader::new(Box::pin(body))))
    }

    async fn get_finalized_slot(&self) -> Result<u64, ClientError> {
        let url = self.eth_path(&["beacon", "headers", "finalized"])?;
        let header: DataResponse<HeaderData> = self.get(url).await?;
        Ok(header.data.header.message.slot)
    }
}
