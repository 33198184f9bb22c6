//! Operator CLI of the GPU DRA driver core: allocation dry-runs against an
//! inventory snapshot, and checkpoint inspection on a node.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use dra_core::allocator::{AllocationInput, Allocator, Request};
use dra_core::device::{AllocatedDeviceInfo, DeviceKey};
use dra_core::inventory::{build_candidates, PoolSlice};
use dra_core::selector::{CelSelector, DeviceSelector};
use dra_node::checkpoint::{CheckpointStore, FsCheckpointStore};
use serde::Deserialize;
use structopt::StructOpt;
use tracing::info;

#[derive(StructOpt)]
#[structopt(
    name = "gpu-dra-driver",
    about = "Utilities around the GPU DRA allocation and preparation core"
)]
enum Command {
    /// Dry-run the allocator: explain which devices a claim would get.
    Allocate {
        /// JSON file holding the raw resource slices of the cluster.
        #[structopt(long, parse(from_os_str))]
        inventory: PathBuf,
        /// JSON file describing the claim's requests.
        #[structopt(long, parse(from_os_str))]
        claim: PathBuf,
        /// Driver whose slices participate in the allocation.
        #[structopt(long, default_value = "gpu.example.com")]
        driver: String,
    },
    /// Inspect the checkpoint directory of a node.
    Checkpoints {
        /// Checkpoint directory, one JSON file per claim UID.
        #[structopt(long, parse(from_os_str))]
        dir: PathBuf,
        /// Dump one claim in full instead of listing all of them.
        #[structopt(long)]
        claim: Option<String>,
    },
}

/// On-disk shape of the claim file fed to `allocate`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimFile {
    requests: Vec<RequestSpec>,
    #[serde(default)]
    allocated: Vec<PriorAllocation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestSpec {
    name: String,
    count: usize,
    #[serde(default)]
    capacity: BTreeMap<String, i64>,
    /// CEL expressions over the `device` variable, combined by AND.
    #[serde(default)]
    selectors: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriorAllocation {
    driver: String,
    pool: String,
    device: String,
    #[serde(default)]
    exclusive: bool,
    #[serde(default)]
    consumed: BTreeMap<String, i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    match Command::from_args() {
        Command::Allocate {
            inventory,
            claim,
            driver,
        } => allocate(&inventory, &claim, &driver).await,
        Command::Checkpoints { dir, claim } => checkpoints(&dir, claim).await,
    }
}

async fn allocate(inventory: &Path, claim: &Path, driver: &str) -> anyhow::Result<()> {
    let slices: Vec<PoolSlice> = read_json(inventory).await.context("reading inventory")?;
    let claim_file: ClaimFile = read_json(claim).await.context("reading claim")?;

    let (candidates, counter_sets) = build_candidates(driver, slices);
    info!(candidates = candidates.len(), "built candidate devices");

    let mut requests = Vec::new();
    for spec in claim_file.requests {
        let mut request = Request::new(spec.name, spec.count);
        request.capacity = spec.capacity;
        for expression in spec.selectors {
            let selector = CelSelector::new(&expression)?;
            request
                .selectors
                .push(Arc::new(selector) as Arc<dyn DeviceSelector>);
        }
        requests.push(request);
    }
    let allocated = claim_file
        .allocated
        .into_iter()
        .map(|prior| {
            (
                DeviceKey::new(prior.driver, prior.pool, prior.device),
                AllocatedDeviceInfo {
                    exclusive: prior.exclusive,
                    consumed: prior.consumed,
                },
            )
        })
        .collect();

    let input = AllocationInput {
        requests,
        candidates,
        allocated,
        counter_sets,
    };
    match Allocator::new().allocate(&input)? {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => {
            println!("claim is not allocatable: no node satisfies all requests");
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn checkpoints(dir: &Path, claim: Option<String>) -> anyhow::Result<()> {
    let store = FsCheckpointStore::new(dir);
    match claim {
        Some(claim_uid) => match store.load(&claim_uid).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => {
                println!("no checkpoint for claim {}", claim_uid);
                std::process::exit(1);
            }
        },
        None => {
            for claim_uid in store.list().await? {
                match store.load(&claim_uid).await {
                    Ok(Some(record)) => println!(
                        "{}\t{}\t{} device(s)",
                        claim_uid,
                        record.created,
                        record.devices.len()
                    ),
                    Ok(None) => {}
                    Err(e) => println!("{}\tunreadable: {}", claim_uid, e),
                }
            }
        }
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}
