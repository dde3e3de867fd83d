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

use std::{path::PathBuf, sync::Arc, time::Duration};

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use clap::Parser;
use duties_indexer::{
    client::BeaconClient,
    daemon::{StateIndexerService, StateIndexerServiceConfig},
    db::SummaryDb,
    registry::{file::FileRegistrySource, lido::LidoRegistrySource, KeysRegistry, RegistrySource},
    state::StateServiceConfig,
};
use url::Url;

/// Arguments for the validator state indexer.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct StateIndexerArgs {
    /// URL of the beacon node REST API.
    #[clap(long, env)]
    beacon_url: Url,

    /// YAML file listing node operators and their validator keys.
    #[clap(long, env, conflicts_with = "lido_rpc_url", required_unless_present = "lido_rpc_url")]
    registry_file: Option<PathBuf>,

    /// URL of the execution RPC endpoint used to read the node operators registry.
    #[clap(long, env, requires_all = ["registry_address", "lido_address"])]
    lido_rpc_url: Option<Url>,

    /// Address of the node operators registry contract.
    #[clap(long, env)]
    registry_address: Option<Address>,

    /// Address of the Lido contract.
    #[clap(long, env)]
    lido_address: Option<Address>,

    /// DB connection string.
    #[clap(long, env = "DATABASE_URL")]
    db: String,

    /// Number of slots per epoch.
    #[clap(
        long,
        env = "FETCH_INTERVAL_SLOTS",
        default_value = "32",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    slots_per_epoch: u64,

    /// Slot duration in seconds.
    #[clap(long, env, default_value = "12")]
    seconds_per_slot: u64,

    /// Connect timeout in seconds for beacon node requests.
    #[clap(long, default_value = "30")]
    request_timeout: u64,

    /// First epoch to check when the database holds no progress.
    #[clap(long)]
    start_epoch: Option<u64>,

    /// Last epoch to check. When set, the indexer runs once and exits.
    #[clap(long)]
    end_epoch: Option<u64>,

    /// Maximum duration in seconds of a single epoch check.
    #[clap(long, default_value = "1800")]
    check_timeout: u64,

    /// Interval in seconds between checking for newly finalized epochs.
    #[clap(long, default_value = "384")]
    interval: u64,

    /// Number of retries before quitting after an error.
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
}

fn registry_source(args: &StateIndexerArgs) -> Result<Box<dyn RegistrySource>> {
    if let Some(path) = &args.registry_file {
        return Ok(Box::new(FileRegistrySource::new(path.clone())));
    }

    let (Some(rpc_url), Some(registry_address), Some(lido_address)) =
        (args.lido_rpc_url.clone(), args.registry_address, args.lido_address)
    else {
        bail!("Either --registry-file or --lido-rpc-url with contract addresses is required");
    };
    Ok(Box::new(LidoRegistrySource::new(rpc_url, registry_address, lido_address)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = StateIndexerArgs::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    let client = BeaconClient::new(
        args.beacon_url.clone(),
        args.seconds_per_slot,
        Duration::from_secs(args.request_timeout),
    )
    .context("Failed to build beacon client")?;
    let registry = KeysRegistry::new(registry_source(&args)?);
    let db = SummaryDb::new(&args.db).await.context("Failed to open database")?;

    let config = StateIndexerServiceConfig {
        interval: Duration::from_secs(args.interval),
        retries: args.retries,
        start_epoch: args.start_epoch,
        end_epoch: args.end_epoch,
        check_timeout: Some(Duration::from_secs(args.check_timeout)),
        state: StateServiceConfig { slots_per_epoch: args.slots_per_epoch, ..Default::default() },
    };

    let service =
        StateIndexerService::new(Arc::new(client), Arc::new(registry), Arc::new(db), config);

    // If an end epoch is specified, run once and exit
    if args.end_epoch.is_some() {
        tracing::info!("Running indexer once (end-epoch specified)");
        service.run().await?;
        tracing::info!("Indexer completed successfully");
        return Ok(());
    }

    // Otherwise, run in a loop
    let interval = service.config().interval;
    let retries = service.config().retries;
    let mut failures = 0u32;
    loop {
        match service.run().await {
            Ok(_) => {
                failures = 0;
                tracing::info!("Sleeping for {} seconds", interval.as_secs());
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                failures += 1;
                tracing::error!("Error running state indexer: {:?}", e);
                if failures >= retries {
                    bail!("Maximum retries reached");
                }
                tracing::info!("Retrying in {} seconds", interval.as_secs());
                tokio::time::sleep(interval).await;
            }
        }
    }
}
