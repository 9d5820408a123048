//! # Bidloop Node
//!
//! Long-running process around the cycle services: layered configuration,
//! a JSON-RPC API, scheduled jobs, Prometheus metrics and periodic
//! snapshots of the store.

pub mod api;
pub mod config;
pub mod metrics;
pub mod node;
pub mod rpc_server;
pub mod scheduler;

pub use api::{ApiError, ApiHandlers};
pub use config::{GatewayKind, LogFormat, LoggingConfig, NodeConfig};
pub use metrics::{MetricsServer, NodeMetrics};
pub use node::{BidloopNode, NodeState};
pub use rpc_server::{RpcHandlers, RpcServer};
pub use scheduler::Scheduler;
