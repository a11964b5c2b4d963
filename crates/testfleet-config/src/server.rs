//! Queue server configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use testfleet_core::{
    TestExecutionBehavior, TestTimeoutConfiguration, WorkerConfiguration, WorkerId,
};

/// Longest heartbeat interval a worker may declare (one day).
pub const MAX_REPORT_ALIVE_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Check a declared heartbeat interval against `1..=MAX_REPORT_ALIVE_INTERVAL_SECS`.
pub fn validate_report_alive_interval(secs: u64) -> Result<u64, String> {
    if secs == 0 {
        return Err("report alive interval must be positive".to_string());
    }
    if secs > MAX_REPORT_ALIVE_INTERVAL_SECS {
        return Err(format!(
            "report alive interval {}s exceeds the maximum of {}s",
            secs, MAX_REPORT_ALIVE_INTERVAL_SECS
        ));
    }
    Ok(secs)
}

/// Queue server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueServerConfig {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Protocol version reported to clients. Workers refuse to talk to a
    /// server with a different version.
    pub version: String,
    pub aliveness: AlivenessPolicy,
    /// How long a worker should wait before polling again when no bucket is
    /// available right now.
    pub check_again_after_secs: u64,
    pub worker_policy: WorkerAlivenessPolicy,
    pub termination: TerminationPolicy,
    /// How often the termination policy is evaluated.
    pub termination_poll_secs: u64,
    /// Known workers. Empty means any worker may register.
    pub workers: Vec<WorkerDefinition>,
}

impl Default for QueueServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 41000)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            aliveness: AlivenessPolicy::default(),
            check_again_after_secs: 30,
            worker_policy: WorkerAlivenessPolicy::StayAlive,
            termination: TerminationPolicy::StayAlive,
            termination_poll_secs: 5,
            workers: Vec::new(),
        }
    }
}

impl QueueServerConfig {
    pub fn check_again_after(&self) -> Duration {
        Duration::from_secs(self.check_again_after_secs)
    }

    pub fn termination_poll_interval(&self) -> Duration {
        Duration::from_secs(self.termination_poll_secs.max(1))
    }
}

/// Heartbeat bookkeeping policy, server-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlivenessPolicy {
    /// Interval used for workers that do not declare their own.
    pub default_report_alive_interval_secs: u64,
    /// A worker becomes silent after `interval * tolerance_factor` without a heartbeat.
    pub tolerance_factor: f64,
    /// A silent worker becomes lost after this long without a heartbeat.
    pub give_up_after_secs: u64,
    /// Period of the silence sweep.
    pub sweep_interval_secs: u64,
}

impl Default for AlivenessPolicy {
    fn default() -> Self {
        Self {
            default_report_alive_interval_secs: 30,
            tolerance_factor: 3.0,
            give_up_after_secs: 600,
            sweep_interval_secs: 5,
        }
    }
}

impl AlivenessPolicy {
    pub fn give_up_after(&self) -> Duration {
        Duration::from_secs(self.give_up_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Silence window for a worker reporting every `report_alive_interval_secs`.
    /// Saturates at `Duration::MAX` for windows too large to represent.
    pub fn tolerance_window(&self, report_alive_interval_secs: u64) -> Duration {
        Duration::try_from_secs_f64(report_alive_interval_secs as f64 * self.tolerance_factor)
            .unwrap_or(Duration::MAX)
    }
}

/// What workers are told when there is no work left at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAlivenessPolicy {
    /// Keep polling; new jobs may arrive.
    StayAlive,
    /// Exit once the queue is depleted.
    TerminateWhenDepleted,
}

/// When the queue server process may exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TerminationPolicy {
    StayAlive,
    AfterBeingIdle { period_secs: u64 },
}

/// A worker listed in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    pub worker_id: WorkerId,
    pub configuration: WorkerConfiguration,
}

/// Read and parse a configuration file.
pub fn load_server_config(path: impl AsRef<Path>) -> ConfigResult<QueueServerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_server_config(&content)
}

/// Parse queue server configuration from KDL text.
///
/// Every node is optional; missing values fall back to defaults.
pub fn parse_server_config(kdl: &str) -> ConfigResult<QueueServerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = QueueServerConfig::default();
    let mut seen_workers = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                if let Some(listen) = get_string_prop(node, "listen") {
                    config.listen = listen.parse().map_err(|e| ConfigError::InvalidValue {
                        field: "server listen".to_string(),
                        message: format!("{}", e),
                    })?;
                }
                if let Some(version) = get_string_prop(node, "version") {
                    config.version = version;
                }
            }
            "aliveness" => {
                config.aliveness = parse_aliveness(node)?;
            }
            "queue" => {
                if let Some(secs) = get_u64_prop(node, "check-again-after")? {
                    config.check_again_after_secs = secs;
                }
                if let Some(policy) = get_string_prop(node, "worker-policy") {
                    config.worker_policy = parse_worker_policy(&policy)?;
                }
            }
            "termination" => {
                config.termination = parse_termination(node)?;
                if let Some(secs) = get_u64_prop(node, "poll-interval")? {
                    config.termination_poll_secs = secs;
                }
            }
            "worker" => {
                let worker = parse_worker(node, &config.aliveness)?;
                if !seen_workers.insert(worker.worker_id.clone()) {
                    return Err(ConfigError::Duplicate(format!(
                        "worker '{}'",
                        worker.worker_id
                    )));
                }
                config.workers.push(worker);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_aliveness(node: &KdlNode) -> ConfigResult<AlivenessPolicy> {
    let mut policy = AlivenessPolicy::default();

    if let Some(secs) = get_u64_prop(node, "report-alive-interval")? {
        policy.default_report_alive_interval_secs = validate_report_alive_interval(secs)
            .map_err(|message| ConfigError::InvalidValue {
                field: "aliveness report-alive-interval".to_string(),
                message,
            })?;
    }
    if let Some(factor) = get_f64_prop(node, "tolerance-factor") {
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "aliveness tolerance-factor".to_string(),
                message: format!("must be a finite number of at least 1.0, got {}", factor),
            });
        }
        policy.tolerance_factor = factor;
    }
    if let Some(secs) = get_u64_prop(node, "give-up-after")? {
        policy.give_up_after_secs = secs;
    }
    if let Some(secs) = get_u64_prop(node, "sweep-interval")? {
        policy.sweep_interval_secs = secs;
    }

    Ok(policy)
}

fn parse_worker_policy(value: &str) -> ConfigResult<WorkerAlivenessPolicy> {
    match value {
        "stay-alive" => Ok(WorkerAlivenessPolicy::StayAlive),
        "terminate-when-depleted" => Ok(WorkerAlivenessPolicy::TerminateWhenDepleted),
        _ => Err(ConfigError::InvalidValue {
            field: "queue worker-policy".to_string(),
            message: format!("unknown policy: {}", value),
        }),
    }
}

fn parse_termination(node: &KdlNode) -> ConfigResult<TerminationPolicy> {
    let kind = get_first_string_arg(node).unwrap_or_default();

    match kind.as_str() {
        "stay-alive" | "" => Ok(TerminationPolicy::StayAlive),
        "after-being-idle" => {
            let period_secs = get_u64_prop(node, "period")?
                .ok_or_else(|| ConfigError::MissingField("termination period".to_string()))?;
            Ok(TerminationPolicy::AfterBeingIdle { period_secs })
        }
        _ => Err(ConfigError::InvalidValue {
            field: "termination policy".to_string(),
            message: format!("unknown termination policy: {}", kind),
        }),
    }
}

fn parse_worker(node: &KdlNode, aliveness: &AlivenessPolicy) -> ConfigResult<WorkerDefinition> {
    let worker_id = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker id".to_string()))?;

    let mut number_of_retries = 0;
    let mut report_alive_interval_secs = aliveness.default_report_alive_interval_secs;
    let mut timeout_configuration = TestTimeoutConfiguration::default();
    let mut environment = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "retries" => {
                    number_of_retries = get_first_u64_arg(child, "worker retries")?
                        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                        .unwrap_or(0);
                }
                "report-alive-interval" => {
                    if let Some(secs) = get_first_u64_arg(child, "worker report-alive-interval")? {
                        report_alive_interval_secs = validate_report_alive_interval(secs)
                            .map_err(|message| ConfigError::InvalidValue {
                                field: format!("worker '{}' report-alive-interval", worker_id),
                                message,
                            })?;
                    }
                }
                "test-timeout" => {
                    if let Some(secs) = get_first_u64_arg(child, "worker test-timeout")? {
                        timeout_configuration.single_test_maximum_duration_secs = secs;
                    }
                }
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            if let Some(val) = get_first_string_arg(gc) {
                                environment.insert(key, val);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Ok(WorkerDefinition {
        worker_id: WorkerId::new(worker_id),
        configuration: WorkerConfiguration {
            execution_behavior: TestExecutionBehavior {
                number_of_retries,
                environment,
            },
            timeout_configuration,
            report_alive_interval_secs,
            payload_signature: None,
        },
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_u64_arg(node: &KdlNode, field: &str) -> ConfigResult<Option<u64>> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .map(|n| to_u64(n, field))
        .transpose()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    node.get(name)
        .and_then(|v| v.as_integer())
        .map(|n| to_u64(n, name))
        .transpose()
}

fn get_f64_prop(node: &KdlNode, name: &str) -> Option<f64> {
    node.get(name)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|n| n as f64)))
}

fn to_u64(value: i128, field: &str) -> ConfigResult<u64> {
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected a non-negative integer, got {}", value),
    })
}
