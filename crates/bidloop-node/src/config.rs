//! Node configuration types

use anyhow::Context;
use bidloop_bridge::{DryRunGateway, HttpGateway, HttpGatewayConfig, SettlementSettings, TransferGateway};
use bidloop_cycle::{CoreSettings, CycleSettings, DistributionSettings, PurchaseSettings};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variables prefixed with this override file values,
/// e.g. `BIDLOOP__PURCHASE__UNIT_PRICE=25`
pub const ENV_PREFIX: &str = "BIDLOOP";

/// Complete node configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node operation settings
    #[serde(default)]
    pub node: NodeSettings,

    /// Cycle schedule and growth
    #[serde(default)]
    pub cycle: CycleSettings,

    /// Pricing and purchase limits
    #[serde(default)]
    pub purchase: PurchaseSettings,

    /// Fees, returns, referral and team rewards
    #[serde(default)]
    pub distribution: DistributionSettings,

    /// Outbox retries and retention
    #[serde(default)]
    pub settlement: SettlementSettings,

    /// Where payouts are submitted
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Background jobs
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// JSON-RPC API settings
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Layer an optional TOML file and `BIDLOOP__*` environment variables
    /// over the defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let layered = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let config: NodeConfig = layered
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.core_settings().validate()?;
        self.scheduler.validate()?;
        self.gateway.validate()?;
        if self.node.snapshot_interval_secs == 0 {
            anyhow::bail!("node.snapshot_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Settings handed to the cycle services
    pub fn core_settings(&self) -> CoreSettings {
        CoreSettings {
            cycle: self.cycle.clone(),
            purchase: self.purchase.clone(),
            distribution: self.distribution.clone(),
            settlement: self.settlement.clone(),
        }
    }
}

/// Basic node settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node name
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Seconds between store snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

fn default_node_name() -> String {
    "bidloop-node".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_snapshot_interval() -> u64 {
    60
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            data_dir: default_data_dir(),
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

/// Payout gateway flavour
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    #[default]
    DryRun,
    Http,
}

/// Gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub kind: GatewayKind,

    /// Payout service endpoint, required for `http`
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_gateway_timeout_ms() -> u64 {
    10_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            kind: GatewayKind::DryRun,
            url: None,
            api_key: None,
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kind == GatewayKind::Http
            && self.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            anyhow::bail!("gateway.url is required when gateway.kind = \"http\"");
        }
        Ok(())
    }

    pub fn build(&self) -> anyhow::Result<Arc<dyn TransferGateway>> {
        match self.kind {
            GatewayKind::DryRun => Ok(Arc::new(DryRunGateway)),
            GatewayKind::Http => {
                let url = self
                    .url
                    .clone()
                    .context("gateway.url is required for the http gateway")?;
                let gateway = HttpGateway::new(HttpGatewayConfig {
                    url,
                    api_key: self.api_key.clone(),
                    timeout_ms: self.timeout_ms,
                })?;
                Ok(Arc::new(gateway))
            }
        }
    }
}

/// Background job intervals
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Open/close housekeeping
    #[serde(default = "default_cycle_check_secs")]
    pub cycle_check_secs: u64,

    /// Outbox drain and archive
    #[serde(default = "default_transfer_interval_secs")]
    pub transfer_interval_secs: u64,

    /// Local wall-clock time of the daily catch-up distribution, `HH:MM:SS`
    #[serde(default = "default_daily_distribution_time")]
    pub daily_distribution_time: String,
}

fn default_cycle_check_secs() -> u64 {
    300
}

fn default_transfer_interval_secs() -> u64 {
    900
}

fn default_daily_distribution_time() -> String {
    "03:00:00".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_check_secs: default_cycle_check_secs(),
            transfer_interval_secs: default_transfer_interval_secs(),
            daily_distribution_time: default_daily_distribution_time(),
        }
    }
}

impl SchedulerConfig {
    pub fn cycle_check_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_check_secs)
    }

    pub fn transfer_interval(&self) -> Duration {
        Duration::from_secs(self.transfer_interval_secs)
    }

    pub fn daily_time(&self) -> anyhow::Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.daily_distribution_time, "%H:%M:%S").with_context(|| {
            format!(
                "invalid scheduler.daily_distribution_time {:?}",
                self.daily_distribution_time
            )
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cycle_check_secs == 0 || self.transfer_interval_secs == 0 {
            anyhow::bail!("scheduler intervals must be at least one second");
        }
        self.daily_time()?;
        Ok(())
    }
}

/// RPC configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Enable RPC
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_rpc_address")]
    pub listen_addr: String,

    /// Expose reopen, diagnose and deposit methods
    #[serde(default = "default_true")]
    pub operator_methods: bool,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_true() -> bool {
    true
}

fn default_rpc_address() -> String {
    "127.0.0.1:8645".to_string()
}

fn default_requests_per_second() -> u32 {
    50
}

fn default_burst() -> u32 {
    100
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_rpc_address(),
            operator_methods: true,
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

/// Metrics configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics address
    #[serde(default = "default_metrics_address")]
    pub prometheus_addr: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9645".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_addr: default_metrics_address(),
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rpc.listen_addr, "127.0.0.1:8645");
        assert_eq!(config.scheduler.cycle_check_secs, 300);
        assert_eq!(config.cycle.open_time, "08:10:00");
        assert_eq!(config.gateway.kind, GatewayKind::DryRun);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            [node]
            name = "edge-1"

            [purchase]
            unit_price = "25"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.name, "edge-1");
        assert_eq!(config.node.snapshot_interval_secs, 60);
        assert_eq!(config.purchase.unit_price, dec!(25));
        assert_eq!(config.purchase.maturity_days, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.core_settings().purchase.unit_price, dec!(25));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = NodeConfig::default();
        config.distribution.admin_fee_address = Some("0xadmin".into());
        let text = config.to_toml().unwrap();
        let back = NodeConfig::from_toml(&text).unwrap();
        assert_eq!(back.distribution.admin_fee_address.as_deref(), Some("0xadmin"));
        assert_eq!(back.distribution.referral_rates, config.distribution.referral_rates);
        assert_eq!(back.distribution.team_ranks, config.distribution.team_ranks);
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[scheduler]\ndaily_distribution_time = \"04:30:00\"\n\n[rpc]\noperator_methods = false"
        )
        .unwrap();

        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.scheduler.daily_time().unwrap(), NaiveTime::from_hms_opt(4, 30, 0).unwrap());
        assert!(!config.rpc.operator_methods);
    }

    #[test]
    fn test_http_gateway_needs_url() {
        let err = NodeConfig::from_toml("[gateway]\nkind = \"http\"").unwrap_err();
        assert!(err.to_string().contains("gateway.url"));

        let config =
            NodeConfig::from_toml("[gateway]\nkind = \"http\"\nurl = \"http://127.0.0.1:9/pay\"")
                .unwrap();
        assert_eq!(config.gateway.build().unwrap().name(), "http");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(NodeConfig::from_toml("[scheduler]\ndaily_distribution_time = \"3am\"").is_err());
        assert!(NodeConfig::from_toml("[distribution]\nreturn_rate = \"-0.1\"").is_err());
        assert!(NodeConfig::from_toml("[node]\nsnapshot_interval_secs = 0").is_err());
    }
}
