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

use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use duties_indexer::{
    client::{ClientError, ConsensusClient, StateReader},
    registry::{
        KeysRegistry, RegistryError, RegistryOperator, RegistrySnapshot, RegistrySource,
    },
    state::{BlsPublicKey, StateService, StateServiceConfig},
    summary::SummaryService,
};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};

pub const GENESIS_TIME: u64 = 1_606_824_023;
pub const SECONDS_PER_SLOT: u64 = 12;
pub const OPERATOR_NAME: &str = "Staking Facilities";

pub fn pubkey(n: u8) -> BlsPublicKey {
    BlsPublicKey::repeat_byte(n)
}

/// One entry of the validators state array
pub fn validator_json(index: u64, key: u8, status: &str, effective_balance: u64) -> String {
    format!(
        r#"{{"index":"{index}","balance":"{}","status":"{status}","validator":{{"pubkey":"{}","withdrawal_credentials":"0x00","effective_balance":"{effective_balance}","slashed":false,"activation_eligibility_epoch":"0","activation_epoch":"0","exit_epoch":"18446744073709551615","withdrawable_epoch":"18446744073709551615"}}}}"#,
        effective_balance + 12_345,
        pubkey(key)
    )
}

pub fn state_document(entries: &[String]) -> String {
    format!(r#"{{"execution_optimistic":false,"finalized":true,"data":[{}]}}"#, entries.join(","))
}

#[derive(Clone)]
pub enum StateBody {
    Json(String),
    /// Serves the bytes, then fails the read as a dropped connection would
    FailAfter(String),
    /// Serves the bytes, then never sends more nor closes
    Stall(String),
}

/// Reader that errors once its bytes are exhausted
struct FailingReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )));
        }
        let n = buf.remaining().min(self.data.len() - self.pos);
        let pos = self.pos;
        buf.put_slice(&self.data[pos..pos + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

pub struct FakeClient {
    pub body: Mutex<StateBody>,
    pub finalized_slot: u64,
    pub slot_time_requests: Mutex<Vec<u64>>,
    pub state_requests: Mutex<Vec<u64>>,
    /// Writer halves of stalled state bodies
    pub stalled: Mutex<Vec<DuplexStream>>,
}

impl FakeClient {
    pub fn new(body: StateBody) -> Self {
        Self {
            body: Mutex::new(body),
            finalized_slot: 0,
            slot_time_requests: Mutex::default(),
            state_requests: Mutex::default(),
            stalled: Mutex::default(),
        }
    }

    pub fn with_finalized_slot(mut self, slot: u64) -> Self {
        self.finalized_slot = slot;
        self
    }

    pub fn set_body(&self, body: StateBody) {
        *self.body.lock().unwrap() = body;
    }
}

#[async_trait]
impl ConsensusClient for FakeClient {
    async fn get_slot_time(&self, slot: u64) -> Result<u64, ClientError> {
        self.slot_time_requests.lock().unwrap().push(slot);
        Ok(GENESIS_TIME + slot * SECONDS_PER_SLOT)
    }

    async fn get_validators_state(&self, slot: u64) -> Result<StateReader, ClientError> {
        self.state_requests.lock().unwrap().push(slot);
        let body = self.body.lock().unwrap().clone();
        Ok(match body {
            StateBody::Json(doc) => Box::new(io::Cursor::new(doc.into_bytes())),
            StateBody::FailAfter(doc) => Box::new(FailingReader { data: doc.into_bytes(), pos: 0 }),
            StateBody::Stall(doc) => {
                let (mut writer, reader) = tokio::io::duplex(doc.len() + 1024);
                writer.write_all(doc.as_bytes()).await.unwrap();
                self.stalled.lock().unwrap().push(writer);
                Box::new(reader)
            }
        })
    }

    async fn get_finalized_slot(&self) -> Result<u64, ClientError> {
        Ok(self.finalized_slot)
    }
}

/// Registry with operator 3 controlling keys 1 and 2
pub struct FakeRegistrySource {
    pub fail: bool,
    pub loads: Arc<AtomicU64>,
    pub timestamps: Arc<Mutex<Vec<u64>>>,
}

impl FakeRegistrySource {
    pub fn new() -> Self {
        Self { fail: false, loads: Arc::default(), timestamps: Arc::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::new() }
    }
}

#[async_trait]
impl RegistrySource for FakeRegistrySource {
    async fn load(&self, timestamp: u64) -> Result<RegistrySnapshot, RegistryError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.timestamps.lock().unwrap().push(timestamp);
        if self.fail {
            return Err(RegistryError::Invalid("registry unavailable".into()));
        }
        Ok(RegistrySnapshot {
            operators: vec![RegistryOperator {
                index: 3,
                name: OPERATOR_NAME.into(),
                total_signing_keys: 2,
                used_signing_keys: 2,
            }],
            keys: vec![(pubkey(1), 3), (pubkey(2), 3)],
        })
    }
}

pub struct Harness {
    pub client: Arc<FakeClient>,
    pub summary: Arc<SummaryService>,
    pub service: StateService,
}

pub fn harness(body: StateBody, source: FakeRegistrySource, batch_size: usize) -> Harness {
    let client = Arc::new(FakeClient::new(body));
    let summary = Arc::new(SummaryService::new());
    let service = StateService::new(
        client.clone(),
        Arc::new(KeysRegistry::new(Box::new(source))),
        summary.clone(),
        StateServiceConfig { batch_size, ..Default::default() },
    );
    Harness { client, summary, service }
}
