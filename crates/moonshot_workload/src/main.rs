//! Demo driver for the moonshot checkpoint store.
//!
//! Runs the trainer and inferencer roles inside one process over the
//! loopback transfer substrate: the trainer registers patterned buffers as
//! a checkpoint, the inferencer replicates them into its own buffers and
//! verifies the bytes, then both sides retire their participation. The
//! metadata plane is an embedded in-memory store by default, or a real
//! etcd cluster via `--metadata-uri`.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use moonshot_store::{
    CheckpointEngine, EngineConfig, EtcdMetadataStore, LoopbackCluster, MemoryMetadataStore,
    MetadataStore,
};
use rand::RngCore;
use tracing::info;

/// CLI options for the demo workload.
#[derive(Parser, Debug)]
#[command(name = "moonshot-workload")]
struct Args {
    /// Checkpoint name to publish.
    #[arg(long, default_value = "demo/checkpoint")]
    name: String,

    /// Number of regions the trainer registers.
    #[arg(long, default_value_t = 2)]
    regions: usize,

    /// Size of each region in MiB.
    #[arg(long, default_value_t = 64)]
    region_mib: u64,

    /// Shard size in MiB; a power of two dividing the chunk size.
    #[arg(long, default_value_t = 16)]
    shard_mib: u64,

    /// Registration chunk size in MiB; a power of two.
    #[arg(long, default_value_t = 64)]
    chunk_mib: u64,

    /// etcd endpoint for the metadata plane. Defaults to an embedded
    /// in-memory store shared by both roles.
    #[arg(long)]
    metadata_uri: Option<String>,

    /// How long the trainer lingers with the checkpoint registered before
    /// the teardown phase, e.g. `5s`.
    #[arg(long, default_value = "0s")]
    linger: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let region_len = args.region_mib * 1024 * 1024;
    let max_shard_size = args.shard_mib * 1024 * 1024;

    let fabric = LoopbackCluster::new();
    let metadata: Arc<dyn MetadataStore> = match &args.metadata_uri {
        Some(uri) => Arc::new(
            EtcdMetadataStore::connect(uri)
                .await
                .with_context(|| format!("connecting metadata store at {uri}"))?,
        ),
        None => Arc::new(MemoryMetadataStore::new()),
    };

    let trainer = engine(&args, "trainer", &fabric, Arc::clone(&metadata))?;
    let inferencer = engine(&args, "inferencer", &fabric, Arc::clone(&metadata))?;

    // Trainer: publish patterned source regions.
    let mut rng = rand::thread_rng();
    let mut sources: Vec<Vec<u8>> = Vec::with_capacity(args.regions);
    for _ in 0..args.regions {
        let mut buffer = vec![0u8; region_len as usize];
        rng.fill_bytes(&mut buffer);
        sources.push(buffer);
    }
    let addr_list: Vec<u64> = sources.iter().map(|b| b.as_ptr() as u64).collect();
    let size_list: Vec<u64> = sources.iter().map(|b| b.len() as u64).collect();

    let started = Instant::now();
    trainer
        .register(&args.name, &addr_list, &size_list, max_shard_size)
        .await
        .context("register")?;
    info!(
        name = %args.name,
        regions = args.regions,
        total_mib = args.regions as u64 * args.region_mib,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "checkpoint registered"
    );

    for info in trainer.list("").await.context("list")? {
        info!(
            name = %info.name,
            total_size = info.total_size,
            max_shard_size = info.max_shard_size,
            "listed checkpoint"
        );
    }

    if args.linger.as_secs() > 0 {
        info!(linger = %args.linger, "trainer lingering before replication");
        tokio::time::sleep(*args.linger).await;
    }

    // Inferencer: replicate into fresh buffers and verify.
    let dests: Vec<Vec<u8>> = (0..args.regions)
        .map(|_| vec![0u8; region_len as usize])
        .collect();
    let dest_addrs: Vec<u64> = dests.iter().map(|b| b.as_ptr() as u64).collect();
    let dest_sizes: Vec<u64> = dests.iter().map(|b| b.len() as u64).collect();

    let started = Instant::now();
    inferencer
        .get_replica(&args.name, &dest_addrs, &dest_sizes)
        .await
        .context("get_replica")?;
    let elapsed = started.elapsed();
    let total_bytes = args.regions as u64 * region_len;
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        mib_per_s = (total_bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()) as u64,
        "replica pulled"
    );

    for (index, (source, dest)) in sources.iter().zip(&dests).enumerate() {
        anyhow::ensure!(source == dest, "region {index} content mismatch");
    }
    info!("replica content verified");

    // Teardown: replica first, then the gold copy, which deletes the key.
    inferencer
        .delete_replica(&args.name)
        .await
        .context("delete_replica")?;
    trainer.unregister(&args.name).await.context("unregister")?;
    anyhow::ensure!(
        trainer.list(&args.name).await.context("list")?.is_empty(),
        "checkpoint entry must be gone after unregister"
    );
    info!("checkpoint retired");

    inferencer.close().await.context("close inferencer")?;
    trainer.close().await.context("close trainer")?;
    Ok(())
}

fn engine(
    args: &Args,
    segment_name: &str,
    fabric: &LoopbackCluster,
    metadata: Arc<dyn MetadataStore>,
) -> anyhow::Result<CheckpointEngine> {
    let mut config = EngineConfig::new(
        args.metadata_uri.as_deref().unwrap_or("memory://embedded"),
        segment_name,
    );
    config.chunk_size = args.chunk_mib * 1024 * 1024;
    let engine = CheckpointEngine::with_metadata_store(
        &config,
        metadata,
        Arc::new(fabric.node(segment_name)),
    )?;
    Ok(engine)
}
