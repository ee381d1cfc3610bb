//! driftfsd - the driftfs daemon.
//!
//! `serve` exposes a local directory as one partition over TCP (and
//! optionally HTTP); `gateway` exposes a whole cluster composed of remote
//! partitions described in a TOML config.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use driftfs::{ClusterConfig, ClusterFs, FileSystem, LocalFs, Partitions, RemoteFs};

#[derive(Parser)]
#[command(name = "driftfsd", version, about = "Replicated remote filesystem daemon")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Serve a local directory as one partition
    Serve {
        /// Storage root
        root: PathBuf,

        /// TCP listen address
        #[arg(long, default_value = "127.0.0.1:4700")]
        tcp: SocketAddr,

        /// Optional HTTP listen address
        #[arg(long)]
        http: Option<SocketAddr>,
    },
    /// Serve a cluster gateway over remote partitions
    Gateway {
        /// TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Deserialize)]
struct GatewayConfig {
    tcp_listen: SocketAddr,
    http_listen: Option<SocketAddr>,

    /// Convenience: R-way replication
    replication_count: Option<u32>,
    dead_threshold: Option<u32>,
    upload_min: Option<u32>,
    upload_max: Option<u32>,

    /// Seconds between dead-partition recheck sweeps
    recheck_interval: Option<u64>,

    /// id -> TCP endpoint
    partitions: HashMap<String, String>,
}

impl GatewayConfig {
    fn cluster_config(&self) -> Result<ClusterConfig> {
        if let Some(count) = self.replication_count {
            if self.dead_threshold.is_some() || self.upload_min.is_some() || self.upload_max.is_some()
            {
                bail!("replication_count excludes dead_threshold/upload_min/upload_max");
            }
            return Ok(ClusterConfig::replication(count));
        }
        Ok(ClusterConfig {
            dead_threshold: self.dead_threshold.unwrap_or(0),
            upload_min: self.upload_min.unwrap_or(1),
            upload_max: self.upload_max.unwrap_or(1),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Cmd::Serve { root, tcp, http } => {
            let fs: Arc<dyn FileSystem> = Arc::new(
                LocalFs::new(&root)
                    .await
                    .with_context(|| format!("opening store at {}", root.display()))?,
            );
            info!(root = %root.display(), "serving local store");
            run(fs, tcp, http).await
        }
        Cmd::Gateway { config } => {
            let raw = std::fs::read_to_string(&config)
                .with_context(|| format!("reading {}", config.display()))?;
            let config: GatewayConfig = toml::from_str(&raw).context("parsing gateway config")?;
            if config.partitions.is_empty() {
                bail!("gateway config lists no partitions");
            }
            let cluster_config = config.cluster_config()?;

            let handles: HashMap<String, Arc<dyn FileSystem>> = config
                .partitions
                .iter()
                .map(|(id, addr)| {
                    (id.clone(), Arc::new(RemoteFs::new(addr)) as Arc<dyn FileSystem>)
                })
                .collect();
            let partitions = Arc::new(Partitions::new(handles));

            // Make liveness reflect reality before taking traffic.
            partitions.check_all_partitions().await;
            info!(
                total = partitions.len(),
                dead = partitions.dead_count(),
                "gateway partitions checked"
            );

            if let Some(secs) = config.recheck_interval {
                let partitions = Arc::clone(&partitions);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        partitions.check_dead_partitions().await;
                    }
                });
            }

            let cluster = ClusterFs::new(partitions, cluster_config);
            run(Arc::new(cluster), config.tcp_listen, config.http_listen).await
        }
    }
}

async fn run(fs: Arc<dyn FileSystem>, tcp: SocketAddr, http: Option<SocketAddr>) -> Result<()> {
    let listener = TcpListener::bind(tcp)
        .await
        .with_context(|| format!("binding {tcp}"))?;
    info!(%tcp, "tcp listener bound");
    let tcp_task = tokio::spawn(driftfs::net::serve(Arc::clone(&fs), listener));

    let http_task = match http {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            info!(%addr, "http listener bound");
            let router = driftfs::http::router(fs);
            Some(tokio::spawn(async move {
                axum::serve(listener, router).await
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    tcp_task.abort();
    if let Some(task) = http_task {
        task.abort();
    }
    Ok(())
}
