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

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::time::Duration;

use crate::{
    client::ConsensusClientObj,
    db::SummaryDbObj,
    registry::KeysRegistryObj,
    state::{StateCheckReport, StateService, StateServiceConfig},
    summary::SummaryService,
};

#[derive(Clone)]
pub struct StateIndexerServiceConfig {
    pub interval: Duration,
    pub retries: u32,
    /// First epoch to check when nothing has been persisted yet
    pub start_epoch: Option<u64>,
    /// Last epoch to check. Without it the indexer follows finality.
    pub end_epoch: Option<u64>,
    /// Upper bound on one epoch check. The state stream is released when it runs out.
    pub check_timeout: Option<Duration>,
    pub state: StateServiceConfig,
}

pub struct StateIndexerService {
    client: ConsensusClientObj,
    registry: KeysRegistryObj,
    summary: Arc<SummaryService>,
    state: StateService,
    db: SummaryDbObj,
    config: StateIndexerServiceConfig,
}

impl StateIndexerService {
    pub fn new(
        client: ConsensusClientObj,
        registry: KeysRegistryObj,
        db: SummaryDbObj,
        config: StateIndexerServiceConfig,
    ) -> Self {
        let summary = Arc::new(SummaryService::new());
        let state = StateService::new(
            client.clone(),
            registry.clone(),
            summary.clone(),
            config.state.clone(),
        );
        Self { client, registry, summary, state, db, config }
    }

    pub fn config(&self) -> &StateIndexerServiceConfig {
        &self.config
    }

    /// Check every finalized epoch after the last persisted one. Returns the number of epochs
    /// persisted by this run.
    pub async fn run(&self) -> Result<u64> {
        let start_time = std::time::Instant::now();
        tracing::info!("Starting state indexer run");

        let Some((start, end)) = self.epoch_range().await? else {
            tracing::info!("No new finalized epoch to check");
            return Ok(0);
        };

        let mut processed = 0;
        for epoch in start..=end {
            self.process_epoch(epoch).await?;
            processed += 1;
        }

        tracing::info!(
            "State indexer run completed {} epochs ({}..={}) in {:.2}s",
            processed,
            start,
            end,
            start_time.elapsed().as_secs_f64()
        );
        Ok(processed)
    }

    async fn epoch_range(&self) -> Result<Option<(u64, u64)>> {
        let slots_per_epoch = self.config.state.slots_per_epoch;
        if slots_per_epoch == 0 {
            bail!("Slots per epoch must be positive");
        }
        let finalized_slot =
            self.client.get_finalized_slot().await.context("Failed to get finalized slot")?;
        let finalized_epoch = finalized_slot / slots_per_epoch;
        let end = match self.config.end_epoch {
            Some(end_epoch) => end_epoch.min(finalized_epoch),
            None => finalized_epoch,
        };

        let start = match self.db.get_last_state_epoch().await? {
            Some(last) => last + 1,
            None => self.config.start_epoch.unwrap_or(end),
        };

        tracing::debug!(
            "Finalized slot {} (epoch {}), next epoch to check {}",
            finalized_slot,
            finalized_epoch,
            start
        );
        Ok((start <= end).then_some((start, end)))
    }

    /// Run the state check for one epoch and persist its summary.
    pub async fn process_epoch(&self, epoch: u64) -> Result<StateCheckReport> {
        let state_slot = epoch
            .checked_mul(self.config.state.slots_per_epoch)
            .with_context(|| format!("State slot of epoch {epoch} overflows"))?;
        let check = self.state.check(epoch, state_slot);
        let result = match self.config.check_timeout {
            Some(limit) => match tokio::time::timeout(limit, check).await {
                Ok(result) => result.map_err(anyhow::Error::new),
                Err(_) => Err(anyhow::anyhow!("timed out after {limit:?}")),
            },
            None => check.await.map_err(anyhow::Error::new),
        };
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                // Partial records of a failed check are rebuilt by the next attempt.
                self.summary.take_epoch(epoch).await;
                return Err(err.context(format!("State check failed for epoch {epoch}")));
            }
        };

        let flushed = self.flush_epoch(epoch).await?;
        tracing::info!("Persisted {} duty records for epoch {}", flushed, epoch);

        match self.registry.contract_report().await {
            Ok(Some(contract)) => tracing::info!(
                "Registry contract: {} total signing keys, {} used signing keys, {} buffered ether",
                contract.total_signing_keys,
                contract.used_signing_keys,
                contract.buffered_ether
            ),
            Ok(None) => {}
            Err(err) => tracing::warn!("Failed to read registry contract: {}", err),
        }

        self.db.set_last_state_epoch(epoch).await?;
        Ok(report)
    }

    async fn flush_epoch(&self, epoch: u64) -> Result<usize> {
        let Some(summary) = self.summary.take_epoch(epoch).await else {
            return Ok(0);
        };

        let mut duties: Vec<_> = summary.validators.into_values().collect();
        duties.sort_by_key(|d| d.val_id);
        self.db.upsert_validator_duties(&duties).await?;

        if let Some(state) = summary.meta.and_then(|meta| meta.state) {
            self.db.set_epoch_meta(epoch, &state).await?;
        }
        Ok(duties.len())
    }
}
