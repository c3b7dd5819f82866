use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message size bound, either a byte count or a human readable size such as
/// `8K` or `128M`. The benchmark binary understands both, so the value is
/// passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageSize {
    Bytes(u64),
    Human(String),
}

impl MessageSize {
    pub fn is_empty(&self) -> bool {
        match self {
            MessageSize::Bytes(_) => false,
            MessageSize::Human(s) => s.trim().is_empty(),
        }
    }
}

impl std::fmt::Display for MessageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageSize::Bytes(n) => write!(f, "{}", n),
            MessageSize::Human(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for MessageSize {
    fn from(n: u64) -> Self {
        MessageSize::Bytes(n)
    }
}

impl From<&str> for MessageSize {
    fn from(s: &str) -> Self {
        MessageSize::Human(s.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid iplist file name: {0:?}")]
    InvalidRosterName(String),
    #[error("invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Whether `value` can be pasted into the command line as a single word.
/// Values end up in a `bash -c` script, so anything beyond this set is
/// refused rather than quoted.
fn is_shell_word(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._:,+=@%^/-".contains(c))
}

/// Parameters of one NCCL test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkRequest {
    /// mpirun `--map-by` policy, e.g. `ppr:8:node`
    pub map_by: String,
    /// Interface used by the MPI out-of-band channel
    pub oob_tcp_interface: String,
    /// Interface used by the MPI tcp btl
    pub btl_tcp_interface: String,
    pub nccl_ib_gid_index: u32,
    pub nccl_min_channels: u32,
    pub nccl_ib_qps_per_connection: u32,
    #[serde(default)]
    pub test_size_begin: Option<MessageSize>,
    #[serde(default)]
    pub test_size_end: Option<MessageSize>,
    /// Iterations, 0 leaves it to the benchmark
    #[serde(default)]
    pub iters: u32,
    /// Timeout of a blocking run in seconds, 0 means the configured default
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub enable_debug: bool,
    /// NCCL_DEBUG level: WARN, INFO, TRACE
    #[serde(default)]
    pub nccl_debug_level: String,
    /// Name of the roster (hostfile) under the iplist directory
    pub iplist_file: String,
}

impl BenchmarkRequest {
    /// The defaults offered to the operator. The roster name has no default.
    pub fn defaults() -> Self {
        BenchmarkRequest {
            map_by: "ppr:8:node".to_owned(),
            oob_tcp_interface: "bond0".to_owned(),
            btl_tcp_interface: "bond0".to_owned(),
            nccl_ib_gid_index: 3,
            nccl_min_channels: 32,
            nccl_ib_qps_per_connection: 8,
            test_size_begin: Some(MessageSize::Bytes(1)),
            test_size_end: Some(MessageSize::Bytes(1)),
            iters: 20,
            timeout: 600,
            enable_debug: false,
            nccl_debug_level: "WARN".to_owned(),
            iplist_file: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        let required = [
            ("map_by", &self.map_by),
            ("oob_tcp_interface", &self.oob_tcp_interface),
            ("btl_tcp_interface", &self.btl_tcp_interface),
            ("iplist_file", &self.iplist_file),
        ];
        for &(name, value) in required.iter() {
            if value.trim().is_empty() {
                return Err(RequestError::MissingField(name));
            }
        }
        if !utils::fs::is_plain_file_name(&self.iplist_file) {
            return Err(RequestError::InvalidRosterName(self.iplist_file.clone()));
        }

        let sizes = [
            ("test_size_begin", &self.test_size_begin),
            ("test_size_end", &self.test_size_end),
        ];
        let words = required
            .iter()
            .map(|&(name, value)| (name, value.as_str()))
            .chain(std::iter::once(("nccl_debug_level", self.nccl_debug_level.as_str())))
            .chain(sizes.iter().filter_map(|&(name, size)| match size {
                Some(MessageSize::Human(s)) => Some((name, s.as_str())),
                _ => None,
            }));
        for (field, value) in words {
            if !is_shell_word(value) {
                return Err(RequestError::InvalidField {
                    field,
                    value: value.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Both size bounds, if both are present and non-empty.
    pub fn size_range(&self) -> Option<(&MessageSize, &MessageSize)> {
        match (&self.test_size_begin, &self.test_size_end) {
            (Some(b), Some(e)) if !b.is_empty() && !e.is_empty() => Some((b, e)),
            _ => None,
        }
    }

    /// NCCL_DEBUG value: the requested level when debugging is on, otherwise
    /// VERSION which keeps INFO logs out of the result table.
    pub fn debug_level(&self) -> &str {
        if self.enable_debug && !self.nccl_debug_level.is_empty() {
            &self.nccl_debug_level
        } else {
            "VERSION"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_deserialize_untagged() {
        let json = r#"{
            "map_by": "ppr:8:node",
            "oob_tcp_interface": "bond0",
            "btl_tcp_interface": "bond0",
            "nccl_ib_gid_index": 3,
            "nccl_min_channels": 32,
            "nccl_ib_qps_per_connection": 8,
            "test_size_begin": 1024,
            "test_size_end": "128M",
            "iplist_file": "default"
        }"#;
        let req: BenchmarkRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.test_size_begin, Some(MessageSize::Bytes(1024)));
        assert_eq!(req.test_size_end, Some(MessageSize::Human("128M".to_owned())));
        assert_eq!(req.iters, 0);
        assert_eq!(req.timeout, 0);
        assert!(!req.enable_debug);
    }

    #[test]
    fn validate_rejects_bad_requests() {
        let mut req = BenchmarkRequest::defaults();
        assert_eq!(
            req.validate(),
            Err(RequestError::MissingField("iplist_file"))
        );
        req.iplist_file = "../../etc/passwd".to_owned();
        assert!(matches!(
            req.validate(),
            Err(RequestError::InvalidRosterName(_))
        ));
        req.iplist_file = "default".to_owned();
        assert_eq!(req.validate(), Ok(()));
        req.map_by = " ".to_owned();
        assert_eq!(req.validate(), Err(RequestError::MissingField("map_by")));
    }

    #[test]
    fn validate_rejects_shell_syntax() {
        let mut req = BenchmarkRequest::defaults();
        req.iplist_file = "default".to_owned();

        req.map_by = "ppr:8:node; touch /tmp/x;".to_owned();
        assert!(matches!(
            req.validate(),
            Err(RequestError::InvalidField { field: "map_by", .. })
        ));
        req.map_by = "ppr:8:node:PE=2".to_owned();
        assert_eq!(req.validate(), Ok(()));

        req.btl_tcp_interface = "bond0,^lo".to_owned();
        assert_eq!(req.validate(), Ok(()));
        req.oob_tcp_interface = "bond0 eth0".to_owned();
        assert!(matches!(
            req.validate(),
            Err(RequestError::InvalidField { field: "oob_tcp_interface", .. })
        ));
        req.oob_tcp_interface = "bond0".to_owned();

        req.nccl_debug_level = "INFO$(id)".to_owned();
        assert!(matches!(
            req.validate(),
            Err(RequestError::InvalidField { field: "nccl_debug_level", .. })
        ));
        req.nccl_debug_level = String::new();
        assert_eq!(req.validate(), Ok(()));

        req.test_size_end = Some(MessageSize::Human("128M`reboot`".to_owned()));
        assert!(matches!(
            req.validate(),
            Err(RequestError::InvalidField { field: "test_size_end", .. })
        ));
        req.test_size_end = Some(MessageSize::Human("128M".to_owned()));
        assert_eq!(req.validate(), Ok(()));

        req.iplist_file = "hosts;ls".to_owned();
        assert!(matches!(
            req.validate(),
            Err(RequestError::InvalidField { field: "iplist_file", .. })
        ));
    }

    #[test]
    fn debug_level_falls_back_to_version() {
        let mut req = BenchmarkRequest::defaults();
        assert_eq!(req.debug_level(), "VERSION");
        req.enable_debug = true;
        assert_eq!(req.debug_level(), "WARN");
        req.nccl_debug_level.clear();
        assert_eq!(req.debug_level(), "VERSION");
    }
}
