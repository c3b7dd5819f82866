use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrecheckConfig {
    /// Maximal number of ssh probes in flight
    pub concurrency: usize,
    /// ssh ConnectTimeout in seconds
    pub connect_timeout_secs: u64,
    /// The ssh client binary
    pub ssh: String,
    /// Remote command printing the number of GPU compute processes
    pub probe_command: String,
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        PrecheckConfig {
            concurrency: 64,
            connect_timeout_secs: 5,
            ssh: "ssh".to_owned(),
            probe_command: "nvidia-smi --query-compute-apps=pid --format=csv,noheader | wc -l"
                .to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the iplist and history directories
    pub data_dir: PathBuf,
    /// The MPI launcher
    pub mpirun: PathBuf,
    /// The nccl-tests binary started by mpirun on every rank
    pub nccl_test: PathBuf,
    /// Timeout of a blocking run when the request does not set one
    pub default_timeout_secs: u64,
    pub precheck: PrecheckConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            mpirun: PathBuf::from("/usr/local/sihpc/bin/mpirun"),
            nccl_test: PathBuf::from("/usr/local/sihpc/libexec/nccl-tests/nccl_test"),
            default_timeout_secs: 600,
            precheck: PrecheckConfig::default(),
        }
    }
}

impl Config {
    pub fn iplist_dir(&self) -> PathBuf {
        self.data_dir.join("iplist")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }
}

pub fn read_config<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        anyhow::anyhow!("fail to read config {}: {}", path.as_ref().display(), e)
    })?;
    let config = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/nccltest"

            [precheck]
            concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/nccltest"));
        assert_eq!(config.iplist_dir(), PathBuf::from("/var/lib/nccltest/iplist"));
        assert_eq!(config.default_timeout_secs, 600);
        assert_eq!(config.precheck.concurrency, 8);
        assert_eq!(config.precheck.connect_timeout_secs, 5);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<Config>("datadir = \"x\"").is_err());
    }
}
