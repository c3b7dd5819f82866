use std::process::Command;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::PrecheckConfig;

/// Runs a shell command on a remote node and returns what it printed.
pub trait RemoteExecutor: Send + Sync {
    fn execute(&self, addr: &str, command: &str) -> anyhow::Result<String>;
}

/// Remote execution over the system ssh client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh: String,
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new<S: Into<String>>(ssh: S, connect_timeout_secs: u64) -> Self {
        SshExecutor {
            ssh: ssh.into(),
            connect_timeout_secs,
        }
    }

    fn command(&self, addr: &str, command: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            // keep "Permanently added ..." warnings out of the output we parse
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(addr)
            .arg(command);
        cmd
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, addr: &str, command: &str) -> anyhow::Result<String> {
        utils::cmd_helper::get_command_output(self.command(addr, command))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub ip: String,
    pub process_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeStatus {
    fn ok(ip: &str, process_count: usize) -> Self {
        NodeStatus {
            ip: ip.to_owned(),
            process_count,
            error: None,
        }
    }

    fn failed(ip: &str, error: String) -> Self {
        NodeStatus {
            ip: ip.to_owned(),
            process_count: 0,
            error: Some(error),
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        !self.is_error() && self.process_count > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecheckReport {
    pub total_nodes: usize,
    pub busy_nodes: Vec<NodeStatus>,
    pub busy_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_nodes: Vec<NodeStatus>,
    pub error_count: usize,
}

impl PrecheckReport {
    /// Keep only the nodes worth reporting: busy ones and unreachable ones.
    pub fn from_statuses(statuses: Vec<NodeStatus>) -> Self {
        let total_nodes = statuses.len();
        let (error_nodes, rest): (Vec<_>, Vec<_>) =
            statuses.into_iter().partition(NodeStatus::is_error);
        let busy_nodes: Vec<_> = rest.into_iter().filter(NodeStatus::is_busy).collect();
        PrecheckReport {
            total_nodes,
            busy_count: busy_nodes.len(),
            busy_nodes,
            error_count: error_nodes.len(),
            error_nodes,
        }
    }
}

/// Checks the nodes of a roster for running GPU compute processes.
///
/// Probes run on a private thread pool with `concurrency` threads. A probe
/// occupies its thread for the whole remote round trip, so no more than
/// `concurrency` probes are ever in flight.
pub struct NodeProber<E> {
    executor: E,
    probe_command: String,
    pool: rayon::ThreadPool,
}

impl NodeProber<SshExecutor> {
    pub fn from_config(config: &PrecheckConfig) -> anyhow::Result<Self> {
        NodeProber::new(
            SshExecutor::new(config.ssh.clone(), config.connect_timeout_secs),
            config.probe_command.clone(),
            config.concurrency,
        )
    }
}

impl<E: RemoteExecutor> NodeProber<E> {
    pub fn new<S: Into<String>>(executor: E, probe_command: S, concurrency: usize) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|i| format!("precheck-{}", i))
            .build()?;
        Ok(NodeProber {
            executor,
            probe_command: probe_command.into(),
            pool,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn probe_node(&self, addr: &str) -> NodeStatus {
        let output = match self.executor.execute(addr, &self.probe_command) {
            Ok(output) => output,
            Err(e) => return NodeStatus::failed(addr, format!("SSH failed: {}", e)),
        };
        match output.trim().parse::<usize>() {
            Ok(count) => NodeStatus::ok(addr, count),
            Err(e) => NodeStatus::failed(addr, format!("Failed to parse process count: {}", e)),
        }
    }

    /// Probe every address. The i-th status belongs to the i-th address.
    pub fn probe_all(&self, addrs: &[String]) -> Vec<NodeStatus> {
        self.pool
            .install(|| addrs.par_iter().map(|addr| self.probe_node(addr)).collect())
    }

    pub fn precheck(&self, addrs: &[String]) -> PrecheckReport {
        if addrs.is_empty() {
            return PrecheckReport::default();
        }
        let start = Instant::now();
        let report = PrecheckReport::from_statuses(self.probe_all(addrs));
        log::info!(
            "precheck of {} nodes took {:?}: {} busy, {} unreachable",
            report.total_nodes,
            start.elapsed(),
            report.busy_count,
            report.error_count
        );
        for node in &report.error_nodes {
            log::warn!("precheck {}: {}", node.ip, node.error.as_deref().unwrap_or_default());
        }
        report
    }
}
