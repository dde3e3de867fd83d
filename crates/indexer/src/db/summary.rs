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

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use duties_rewards::EpochStateMeta;
use num_bigint::BigInt;
use sqlx::{any::AnyPoolOptions, any::AnyRow, AnyPool, Row};

use super::DbError;
use crate::{
    state::{BlsPublicKey, ValidatorStatus},
    summary::ValidatorDuty,
};

pub type SummaryDbObj = Arc<dyn SummaryIndexerDb + Send + Sync>;

// Ten columns per row keeps a chunk well under SQLite's parameter limit
const BATCH_INSERT_CHUNK_SIZE: usize = 75;

const LAST_STATE_EPOCH_KEY: &str = "last_state_epoch";

fn to_db_int(value: u64, column: &str) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|_| DbError::BadValue(format!("{column} out of range: {value}")))
}

fn from_db_int(value: i64, column: &str) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::BadValue(format!("{column} is negative: {value}")))
}

fn opt_to_db_int(value: Option<u64>, column: &str) -> Result<Option<i64>, DbError> {
    value.map(|v| to_db_int(v, column)).transpose()
}

fn opt_from_db_int(row: &AnyRow, column: &str) -> Result<Option<u64>, DbError> {
    row.try_get::<Option<i64>, _>(column)?.map(|v| from_db_int(v, column)).transpose()
}

fn duty_from_row(row: &AnyRow) -> Result<ValidatorDuty, DbError> {
    let val_pubkey = row
        .try_get::<Option<String>, _>("val_pubkey")?
        .map(|s| BlsPublicKey::from_str(&s).map_err(|_| DbError::BadValue(s)))
        .transpose()?;
    let val_status = row
        .try_get::<Option<String>, _>("val_status")?
        .map(|s| ValidatorStatus::from_str(&s).map_err(DbError::BadValue))
        .transpose()?;

    Ok(ValidatorDuty {
        epoch: from_db_int(row.try_get("epoch")?, "epoch")?,
        val_id: from_db_int(row.try_get("val_id")?, "val_id")?,
        val_pubkey,
        val_nos_id: opt_from_db_int(row, "val_nos_id")?,
        val_nos_name: row.try_get("val_nos_name")?,
        val_slashed: row.try_get::<Option<i32>, _>("val_slashed")?.map(|v| v != 0),
        val_status,
        val_balance: opt_from_db_int(row, "val_balance")?,
        val_effective_balance: opt_from_db_int(row, "val_effective_balance")?,
        val_balance_withdrawn: opt_from_db_int(row, "val_balance_withdrawn")?,
    })
}

#[async_trait]
pub trait SummaryIndexerDb {
    /// Merge duty records into storage. Present fields overwrite, absent fields keep the
    /// stored value.
    async fn upsert_validator_duties(&self, duties: &[ValidatorDuty]) -> Result<(), DbError>;

    /// Get duty records for an epoch ordered by validator index, with pagination
    async fn get_validator_duties(
        &self,
        epoch: u64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ValidatorDuty>, DbError>;

    async fn get_validator_duty(
        &self,
        epoch: u64,
        val_id: u64,
    ) -> Result<Option<ValidatorDuty>, DbError>;

    /// Replace the state metadata of an epoch
    async fn set_epoch_meta(&self, epoch: u64, meta: &EpochStateMeta) -> Result<(), DbError>;

    /// Get the state metadata of an epoch, None if it was never computed
    async fn get_epoch_meta(&self, epoch: u64) -> Result<Option<EpochStateMeta>, DbError>;

    /// Get the last epoch whose state check was persisted
    async fn get_last_state_epoch(&self) -> Result<Option<u64>, DbError>;

    async fn set_last_state_epoch(&self, epoch: u64) -> Result<(), DbError>;
}

pub struct SummaryDb {
    pool: AnyPool,
}

impl SummaryDb {
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(20).connect(database_url).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl SummaryIndexerDb for SummaryDb {
    async fn upsert_validator_duties(&self, duties: &[ValidatorDuty]) -> Result<(), DbError> {
        if duties.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        // Process in chunks to avoid parameter limits
        for chunk in duties.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let mut values_clauses = Vec::new();
            let mut param_idx = 1;

            for _ in chunk {
                let params: Vec<String> =
                    (param_idx..param_idx + 10).map(|i| format!("${i}")).collect();
                values_clauses.push(format!("({},CURRENT_TIMESTAMP)", params.join(",")));
                param_idx += 10;
            }

            let query = format!(
                r#"INSERT INTO validator_duties
                (epoch, val_id, val_pubkey, val_nos_id, val_nos_name, val_slashed, val_status,
                 val_balance, val_effective_balance, val_balance_withdrawn, updated_at)
                VALUES {}
                ON CONFLICT (epoch, val_id) DO UPDATE SET
                    val_pubkey = COALESCE(EXCLUDED.val_pubkey, validator_duties.val_pubkey),
                    val_nos_id = COALESCE(EXCLUDED.val_nos_id, validator_duties.val_nos_id),
                    val_nos_name = COALESCE(EXCLUDED.val_nos_name, validator_duties.val_nos_name),
                    val_slashed = COALESCE(EXCLUDED.val_slashed, validator_duties.val_slashed),
                    val_status = COALESCE(EXCLUDED.val_status, validator_duties.val_status),
                    val_balance = COALESCE(EXCLUDED.val_balance, validator_duties.val_balance),
                    val_effective_balance = COALESCE(EXCLUDED.val_effective_balance, validator_duties.val_effective_balance),
                    val_balance_withdrawn = COALESCE(EXCLUDED.val_balance_withdrawn, validator_duties.val_balance_withdrawn),
                    updated_at = CURRENT_TIMESTAMP"#,
                values_clauses.join(",")
            );

            let mut q = sqlx::query(&query);
            for duty in chunk {
                q = q
                    .bind(to_db_int(duty.epoch, "epoch")?)
                    .bind(to_db_int(duty.val_id, "val_id")?)
                    .bind(duty.val_pubkey.map(|k| format!("{:#x}", k)))
                    .bind(opt_to_db_int(duty.val_nos_id, "val_nos_id")?)
                    .bind(duty.val_nos_name.clone())
                    .bind(duty.val_slashed.map(|s| if s { 1i32 } else { 0i32 }))
                    .bind(duty.val_status.map(|s| s.as_str().to_string()))
                    .bind(opt_to_db_int(duty.val_balance, "val_balance")?)
                    .bind(opt_to_db_int(duty.val_effective_balance, "val_effective_balance")?)
                    .bind(opt_to_db_int(duty.val_balance_withdrawn, "val_balance_withdrawn")?);
            }
            q.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_validator_duties(
        &self,
        epoch: u64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ValidatorDuty>, DbError> {
        let rows = sqlx::query(
            "SELECT epoch, val_id, val_pubkey, val_nos_id, val_nos_name, val_slashed, val_status,
                    val_balance, val_effective_balance, val_balance_withdrawn
             FROM validator_duties
             WHERE epoch = $1
             ORDER BY val_id ASC
             LIMIT $2 OFFSET $3",
        )
        .bind(to_db_int(epoch, "epoch")?)
        .bind(to_db_int(limit, "limit")?)
        .bind(to_db_int(offset, "offset")?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(duty_from_row).collect()
    }

    async fn get_validator_duty(
        &self,
        epoch: u64,
        val_id: u64,
    ) -> Result<Option<ValidatorDuty>, DbError> {
        let row = sqlx::query(
            "SELECT epoch, val_id, val_pubkey, val_nos_id, val_nos_name, val_slashed, val_status,
                    val_balance, val_effective_balance, val_balance_withdrawn
             FROM validator_duties
             WHERE epoch = $1 AND val_id = $2",
        )
        .bind(to_db_int(epoch, "epoch")?)
        .bind(to_db_int(val_id, "val_id")?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(duty_from_row).transpose()
    }

    async fn set_epoch_meta(&self, epoch: u64, meta: &EpochStateMeta) -> Result<(), DbError> {
        let query = r#"
            INSERT INTO epoch_state_meta
            (epoch, active_validators, active_validators_total_increments, base_reward, updated_at)
            VALUES ($1, $2, $3, $4, CURRENT_TIMESTAMP)
            ON CONFLICT (epoch) DO UPDATE SET
                active_validators = EXCLUDED.active_validators,
                active_validators_total_increments = EXCLUDED.active_validators_total_increments,
                base_reward = EXCLUDED.base_reward,
                updated_at = CURRENT_TIMESTAMP
        "#;

        sqlx::query(query)
            .bind(to_db_int(epoch, "epoch")?)
            .bind(to_db_int(meta.active_validators, "active_validators")?)
            .bind(meta.active_validators_total_increments.to_string())
            .bind(to_db_int(meta.base_reward, "base_reward")?)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_epoch_meta(&self, epoch: u64) -> Result<Option<EpochStateMeta>, DbError> {
        let row = sqlx::query(
            "SELECT active_validators, active_validators_total_increments, base_reward
             FROM epoch_state_meta
             WHERE epoch = $1",
        )
        .bind(to_db_int(epoch, "epoch")?)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let increments: String = row.try_get("active_validators_total_increments")?;
        Ok(Some(EpochStateMeta {
            active_validators: from_db_int(row.try_get("active_validators")?, "active_validators")?,
            active_validators_total_increments: BigInt::from_str(&increments)
                .map_err(|_| DbError::BadValue(increments.clone()))?,
            base_reward: from_db_int(row.try_get("base_reward")?, "base_reward")?,
        }))
    }

    async fn get_last_state_epoch(&self) -> Result<Option<u64>, DbError> {
        let query = "SELECT value FROM indexer_state WHERE key = $1";
        let result =
            sqlx::query(query).bind(LAST_STATE_EPOCH_KEY).fetch_optional(&self.pool).await?;

        match result {
            Some(row) => {
                let value: String = row.try_get("value")?;
                Ok(Some(value.parse().map_err(|_| DbError::BadEpoch(value))?))
            }
            None => Ok(None),
        }
    }

    async fn set_last_state_epoch(&self, epoch: u64) -> Result<(), DbError> {
        let query = r#"
            INSERT INTO indexer_state (key, value, updated_at)
            VALUES ($1, $2, CURRENT_TIMESTAMP)
            ON CONFLICT (key)
            DO UPDATE SET value = $2, updated_at = CURRENT_TIMESTAMP
        "#;

        sqlx::query(query)
            .bind(LAST_STATE_EPOCH_KEY)
            .bind(epoch.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
