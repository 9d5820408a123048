//! Bidloop node runtime
//!
//! Owns the store, the wired services and every background task, and keeps
//! the store snapshot on disk current.

use crate::api::ApiHandlers;
use crate::config::NodeConfig;
use crate::metrics::{MetricsServer, NodeMetrics};
use crate::rpc_server::RpcServer;
use crate::scheduler::Scheduler;

use bidloop_core::prelude::*;
use bidloop_cycle::CycleServices;
use bidloop_storage::{MemoryStore, Store};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE: &str = "bidloop.json";

/// Node state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Node is starting up
    Starting,
    /// Node is running normally
    Running,
    /// Node is shutting down
    Stopping,
    /// Node has stopped
    Stopped,
}

/// Bidloop node
pub struct BidloopNode {
    /// Configuration
    config: NodeConfig,
    /// Data directory
    data_dir: PathBuf,
    /// Node state
    state: Arc<RwLock<NodeState>>,
    store: Arc<MemoryStore>,
    services: CycleServices,
    metrics: Arc<NodeMetrics>,
}

impl BidloopNode {
    /// Open the snapshot in `data_dir` (or start empty) and wire the services
    pub fn new(config: NodeConfig, data_dir: PathBuf) -> anyhow::Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&data_dir)?;

        let store = Arc::new(MemoryStore::open(&data_dir.join(SNAPSHOT_FILE))?);
        let shared: Arc<dyn Store> = store.clone();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let gateway = config.gateway.build()?;
        let services = CycleServices::build(shared, clock, gateway, config.core_settings())?;
        services.transport.recover_interrupted();
        let metrics = Arc::new(NodeMetrics::new()?);
        metrics.observe(&services);

        Ok(Self {
            config,
            data_dir,
            state: Arc::new(RwLock::new(NodeState::Starting)),
            store,
            services,
            metrics,
        })
    }

    /// Get current state
    pub fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    pub fn services(&self) -> &CycleServices {
        &self.services
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    pub fn save_snapshot(&self) -> anyhow::Result<()> {
        self.store.save_snapshot(&self.snapshot_path())?;
        Ok(())
    }

    /// Run the node until Ctrl+C or SIGTERM
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!("Starting bidloop node...");
        *self.state.write() = NodeState::Starting;

        let cycle = self.services.manager.tick()?;
        tracing::info!(
            cycle_id = %cycle.id,
            status = %cycle.status,
            capacity = cycle.capacity,
            filled = cycle.filled,
            "Current cycle"
        );
        let report = self.services.pipeline.run_catch_up();
        if report.failures() > 0 {
            tracing::warn!("Startup catch-up left {} failures", report.failures());
        }

        // Start RPC server
        let rpc_handle = if self.config.rpc.enabled {
            let api = ApiHandlers::new(self.services.clone(), self.metrics.clone());
            let rpc_server = RpcServer::new(&self.config.rpc, &self.config.node.name, api);
            Some(tokio::spawn(async move {
                if let Err(e) = rpc_server.run().await {
                    tracing::error!("RPC server error: {}", e);
                }
            }))
        } else {
            None
        };

        // Start metrics server
        let metrics_handle = if self.config.metrics.enabled {
            let metrics_server = MetricsServer::new(&self.config.metrics, self.metrics.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = metrics_server.run().await {
                    tracing::error!("Metrics server error: {}", e);
                }
            }))
        } else {
            None
        };

        // Start scheduler
        let (scheduler_tx, scheduler_rx) = mpsc::channel(1);
        let scheduler = Scheduler::new(
            self.services.clone(),
            self.metrics.clone(),
            self.config.scheduler.clone(),
        )?;
        let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

        let snapshot_handle = self.start_snapshot_job();

        *self.state.write() = NodeState::Running;
        self.print_startup_banner();

        wait_for_shutdown().await;

        *self.state.write() = NodeState::Stopping;
        tracing::info!("Shutting down...");

        let _ = scheduler_tx.send(()).await;
        if tokio::time::timeout(Duration::from_secs(10), scheduler_handle)
            .await
            .is_err()
        {
            tracing::warn!("Scheduler did not stop within 10s");
        }

        snapshot_handle.abort();
        if let Some(handle) = rpc_handle {
            handle.abort();
        }
        if let Some(handle) = metrics_handle {
            handle.abort();
        }

        self.save_snapshot()?;
        tracing::info!("Final snapshot written to {:?}", self.snapshot_path());

        *self.state.write() = NodeState::Stopped;
        tracing::info!("Node stopped");
        Ok(())
    }

    fn start_snapshot_job(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let path = self.snapshot_path();
        let every = Duration::from_secs(self.config.node.snapshot_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                write_snapshot(&store, &path);
            }
        })
    }

    fn print_startup_banner(&self) {
        let settings = &self.services.settings;
        tracing::info!("╔══════════════════════════════════════════════════════════════╗");
        tracing::info!("║                  BIDLOOP NODE IS RUNNING                     ║");
        tracing::info!("╚══════════════════════════════════════════════════════════════╝");
        tracing::info!("");
        tracing::info!("Name: {}", self.config.node.name);
        tracing::info!("Data: {:?}", self.data_dir);
        tracing::info!("Unit price: {}", settings.purchase.unit_price);
        tracing::info!("Cycle open time: {} (UTC{:+} min)", settings.cycle.open_time, settings.cycle.utc_offset_minutes);
        tracing::info!("Gateway: {}", self.services.transport.gateway_name());

        if self.config.rpc.enabled {
            tracing::info!("JSON-RPC: http://{}", self.config.rpc.listen_addr);
        }
        if self.config.metrics.enabled {
            tracing::info!("Metrics: http://{}/metrics", self.config.metrics.prometheus_addr);
        }

        tracing::info!("");
        tracing::info!("Press Ctrl+C to stop the node");
    }
}

fn write_snapshot(store: &MemoryStore, path: &Path) {
    if let Err(e) = store.save_snapshot(path) {
        tracing::error!("Snapshot to {:?} failed: {}", path, e);
    }
}

/// Wait for shutdown signal
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
