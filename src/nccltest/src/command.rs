use std::fmt::Write;
use std::path::PathBuf;

use crate::config::Config;
use crate::request::BenchmarkRequest;

const CONT: &str = " \\\n    ";

/// Renders a [`BenchmarkRequest`] into the mpirun command line.
///
/// The output is a pure function of the request and the builder settings; the
/// same text is executed and shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    mpirun: PathBuf,
    nccl_test: PathBuf,
    iplist_dir: PathBuf,
}

impl CommandBuilder {
    pub fn new(mpirun: PathBuf, nccl_test: PathBuf, iplist_dir: PathBuf) -> Self {
        CommandBuilder {
            mpirun,
            nccl_test,
            iplist_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.mpirun.clone(),
            config.nccl_test.clone(),
            config.iplist_dir(),
        )
    }

    pub fn render(&self, req: &BenchmarkRequest) -> String {
        let hostfile = self.iplist_dir.join(&req.iplist_file);

        let mut cmd = self.mpirun.display().to_string();
        let mut arg = |s: &str| {
            cmd.push_str(CONT);
            cmd.push_str(s);
        };
        arg("--allow-run-as-root");
        arg(&format!("--hostfile {}", hostfile.display()));
        arg(&format!("--map-by {}", req.map_by));
        arg(&format!("--mca oob_tcp_if_include {}", req.oob_tcp_interface));
        arg("--mca pml ^ucx");
        arg("--mca btl self,tcp");
        arg(&format!("--mca btl_tcp_if_include {}", req.btl_tcp_interface));
        arg("--mca routed direct");
        arg("--mca plm_rsh_no_tree_spawn 1");
        arg("-x UCX_TLS=tcp");
        arg(&format!("-x NCCL_DEBUG={}", req.debug_level()));
        arg(&format!("-x NCCL_IB_GID_INDEX={}", req.nccl_ib_gid_index));
        arg(&format!("-x NCCL_MIN_NCHANNELS={}", req.nccl_min_channels));
        arg(&format!(
            "-x NCCL_IB_QPS_PER_CONNECTION={}",
            req.nccl_ib_qps_per_connection
        ));
        arg(&self.nccl_test.display().to_string());

        // writing into a String cannot fail
        if let Some((begin, end)) = req.size_range() {
            let _ = write!(cmd, " -b {} -e {}", begin, end);
        }
        if req.iters > 0 {
            let _ = write!(cmd, " -n {}", req.iters);
        }

        cmd
    }
}
