//! Orchestration of NCCL benchmark jobs: rendering the mpirun command line,
//! running it as the single active job, probing the roster for busy GPUs and
//! turning the benchmark output into chart data.

pub mod argument;
pub mod command;
pub mod config;
pub mod history;
pub mod job;
pub mod parser;
pub mod precheck;
pub mod request;
pub mod roster;

pub use command::CommandBuilder;
pub use job::{JobController, JobError, JobEvent, RunResponse, RunStatus, StopResponse, StopStatus};
pub use parser::{parse_output, ChartDataPoint};
pub use precheck::{NodeProber, NodeStatus, PrecheckReport, RemoteExecutor};
pub use request::{BenchmarkRequest, MessageSize};
