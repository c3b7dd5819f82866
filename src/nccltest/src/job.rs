//! The single benchmark job slot.
//!
//! At most one NCCL test runs at a time. A run takes the slot with an atomic
//! check-and-set and gives it back through a guard, whatever way the run ends.
//! The benchmark is started through `bash -c` in a process group of its own:
//! mpirun forks workers on every rank, and only a signal to the whole group
//! reliably takes them all down.
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt; // for process_group()
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandBuilder;
use crate::config::Config;
use crate::history::{HistoryStore, HistoryWriter};
use crate::request::{BenchmarkRequest, RequestError};

const SHELL: &str = "bash";
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const STDERR_SEPARATOR: &str = "\n--- STDERR ---\n";
const STOPPED: &str = "Command was stopped";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("a NCCL test is already running (job {id}): {command}")]
    AlreadyRunning { id: u64, command: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Timeout,
}

/// Result of a blocking run. Timeouts and process failures are reported here
/// rather than as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    pub status: RunStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub command: String,
}

impl RunResponse {
    fn failed(status: RunStatus, command: String, error: String, output: String) -> Self {
        RunResponse {
            status,
            output,
            error: Some(error),
            command,
        }
    }
}

/// Events of a streaming run: one `Command`, any number of `Output` lines,
/// then exactly one of `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum JobEvent {
    Command(String),
    Output(String),
    Done(String),
    Error(String),
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Done(_) | JobEvent::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Stopped,
    NoTask,
    NoProcess,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: StopStatus,
    pub message: String,
}

impl StopResponse {
    fn new<S: Into<String>>(status: StopStatus, message: S) -> Self {
        StopResponse {
            status,
            message: message.into(),
        }
    }
}

/// The occupant of the job slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJob {
    pub id: u64,
    pub command: String,
    /// Process group of the run, equal to the pid of its bash leader. `None`
    /// until the process is spawned. It outlives the leader: workers left in
    /// the group may still hold the output pipes.
    pub pgid: Option<u32>,
    pub deadline: Option<Instant>,
    pub started: Instant,
}

type Slot = Mutex<Option<RunningJob>>;

// a panic while holding the lock must not wedge the slot forever
fn lock(slot: &Slot) -> MutexGuard<'_, Option<RunningJob>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ownership of the slot for the lifetime of one run. Dropping it clears the
/// slot, but only if the slot still holds this run.
struct SlotGuard<'a> {
    slot: &'a Slot,
    id: u64,
}

impl<'a> SlotGuard<'a> {
    /// Publish the process group of the spawned process. Returns false if the
    /// job was stopped in the meantime; the caller then owns an orphan to kill.
    fn attach(&self, pgid: u32) -> bool {
        let mut slot = lock(self.slot);
        match slot.as_mut() {
            Some(job) if job.id == self.id => {
                job.pgid = Some(pgid);
                true
            }
            _ => false,
        }
    }

    /// False once `stop` has taken the job out of the slot.
    fn is_held(&self) -> bool {
        lock(self.slot).as_ref().map(|job| job.id) == Some(self.id)
    }

    /// Wait for the leader to exit and for `drained` to report that nobody in
    /// the group holds the output pipes any more. Past the deadline the whole
    /// group is killed.
    fn wait<F: Fn() -> bool>(
        &self,
        child: &mut Child,
        drained: F,
        deadline: Option<Instant>,
    ) -> std::io::Result<Exit> {
        let mut status = None;
        loop {
            if status.is_none() {
                status = child.try_wait()?;
            }
            if let Some(status) = status {
                if drained() {
                    return Ok(Exit::Finished(status));
                }
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                log::warn!("job {} exceeded its deadline, killing process group {}", self.id, child.id());
                kill_group_or_leader(child);
                if status.is_none() {
                    child.wait()?;
                }
                return Ok(Exit::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl<'a> Drop for SlotGuard<'a> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().map(|job| job.id) == Some(self.id) {
            *slot = None;
            log::debug!("job {} left the slot", self.id);
        }
    }
}

#[derive(Debug)]
enum Exit {
    Finished(ExitStatus),
    TimedOut,
}

fn kill_group(pgid: u32) -> nix::Result<()> {
    signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL)
}

fn kill_group_or_leader(child: &mut Child) {
    match kill_group(child.id()) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            log::warn!("failed to kill process group {}: {}, killing the leader only", child.id(), e);
            if let Err(e) = child.kill() {
                log::error!("failed to kill process {}: {}", child.id(), e);
            }
        }
    }
}

/// Kill whatever is left of a finished run's group, e.g. workers that
/// closed their output early.
fn sweep_group(id: u64, pgid: u32) {
    match kill_group(pgid) {
        Ok(()) => log::debug!("job {}: signaled what is left of group {}", id, pgid),
        Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("job {}: failed to sweep process group {}: {}", id, pgid, e),
    }
}

/// Start `script` with bash in a new process group. With `merged`, stderr is
/// redirected by the script itself and only stdout is piped.
fn spawn_in_group(script: &str, merged: bool) -> std::io::Result<Child> {
    let mut cmd = Command::new(SHELL);
    cmd.arg("-c")
        .arg(script)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(if merged { Stdio::null() } else { Stdio::piped() });
    cmd.spawn()
}

fn spawn_reader<R: Read + Send + 'static>(mut r: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = r.read_to_end(&mut buf) {
            log::warn!("error while capturing output: {}", e);
        }
        buf
    })
}

type Reader = Option<std::thread::JoinHandle<Vec<u8>>>;

fn reader_done(handle: &Reader) -> bool {
    handle.as_ref().map_or(true, |h| h.is_finished())
}

fn join_reader(handle: Reader) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

/// Delivers stream events to the caller until the caller goes away. The run
/// keeps draining the process after that so it still ends up in history.
struct EventSink<F> {
    f: F,
    alive: bool,
}

impl<F: FnMut(JobEvent) -> anyhow::Result<()>> EventSink<F> {
    fn emit(&mut self, event: JobEvent) {
        if !self.alive {
            return;
        }
        if let Err(e) = (self.f)(event) {
            log::warn!("event receiver failed: {}, dropping the rest of the stream", e);
            self.alive = false;
        }
    }
}

/// Owner of the job slot. Construct one per process and share it.
pub struct JobController {
    builder: CommandBuilder,
    default_timeout: Duration,
    history: HistoryWriter,
    slot: Slot,
    next_id: AtomicU64,
}

impl JobController {
    pub fn new(builder: CommandBuilder, default_timeout: Duration, history: HistoryWriter) -> Self {
        JobController {
            builder,
            default_timeout,
            history,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            CommandBuilder::from_config(config),
            Duration::from_secs(config.default_timeout_secs),
            HistoryWriter::spawn(HistoryStore::new(config.history_dir())),
        )
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    /// Wait for the transcripts of finished runs to reach the history store.
    pub fn flush_history(&self) {
        self.history.flush();
    }

    /// A copy of the current slot occupant, if any.
    pub fn current(&self) -> Option<RunningJob> {
        lock(&self.slot).clone()
    }

    fn acquire(&self, command: &str, deadline: Option<Instant>) -> Result<SlotGuard<'_>, JobError> {
        let mut slot = lock(&self.slot);
        if let Some(job) = slot.as_ref() {
            return Err(JobError::AlreadyRunning {
                id: job.id,
                command: job.command.clone(),
            });
        }
        let id = self.next_id.fetch_add(1, SeqCst);
        *slot = Some(RunningJob {
            id,
            command: command.to_owned(),
            pgid: None,
            deadline,
            started: Instant::now(),
        });
        Ok(SlotGuard {
            slot: &self.slot,
            id,
        })
    }

    fn timeout_of(&self, req: &BenchmarkRequest) -> Duration {
        if req.timeout > 0 {
            Duration::from_secs(req.timeout)
        } else {
            self.default_timeout
        }
    }

    /// Run the benchmark to completion and return everything it printed.
    pub fn run_blocking(&self, req: &BenchmarkRequest) -> Result<RunResponse, JobError> {
        req.validate()?;
        let command = self.builder.render(req);
        let timeout = self.timeout_of(req);
        let deadline = Instant::now() + timeout;
        let guard = self.acquire(&command, Some(deadline))?;
        log::info!("job {}: starting, timeout {:?}", guard.id, timeout);
        log::debug!("job {}: command: {}", guard.id, command);

        let mut child = match spawn_in_group(&command, false) {
            Ok(child) => child,
            Err(e) => {
                log::error!("job {}: failed to start: {}", guard.id, e);
                return Ok(RunResponse::failed(
                    RunStatus::Error,
                    command,
                    format!("failed to start: {}", e),
                    String::new(),
                ));
            }
        };
        if !guard.attach(child.id()) {
            kill_group_or_leader(&mut child);
            let _ = child.wait();
            return Ok(RunResponse::failed(
                RunStatus::Error,
                command,
                "stopped before the process started".to_owned(),
                String::new(),
            ));
        }

        let pgid = child.id();
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);
        let exit = guard.wait(
            &mut child,
            || reader_done(&stdout) && reader_done(&stderr),
            Some(deadline),
        );
        if exit.is_err() {
            kill_group_or_leader(&mut child);
        }
        sweep_group(guard.id, pgid);
        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);
        let stopped = !guard.is_held();
        let id = guard.id;
        drop(guard);

        let combined = || format!("{}\n{}", stdout, stderr);
        let resp = match exit {
            _ if stopped => RunResponse::failed(
                RunStatus::Error,
                command,
                STOPPED.to_owned(),
                combined(),
            ),
            Ok(Exit::Finished(status)) if status.success() => {
                let mut output = stdout.clone();
                if !stderr.is_empty() {
                    output.push_str(STDERR_SEPARATOR);
                    output.push_str(&stderr);
                }
                self.history.submit(output.clone());
                RunResponse {
                    status: RunStatus::Success,
                    output,
                    error: None,
                    command,
                }
            }
            Ok(Exit::Finished(status)) => RunResponse::failed(
                RunStatus::Error,
                command,
                utils::cmd_helper::describe_exit(&status),
                combined(),
            ),
            Ok(Exit::TimedOut) => RunResponse::failed(
                RunStatus::Timeout,
                command,
                format!("Command timed out after {} seconds", timeout.as_secs()),
                combined(),
            ),
            Err(e) => RunResponse::failed(
                RunStatus::Error,
                command,
                format!("failed to wait for the process: {}", e),
                combined(),
            ),
        };
        log::info!("job {}: finished with status {:?}", id, resp.status);
        Ok(resp)
    }

    /// Run the benchmark and hand its merged stdout/stderr to `sink` line by
    /// line as it is produced. Only `stop` can cut the run short.
    pub fn run_streaming<F>(&self, req: &BenchmarkRequest, sink: F) -> Result<(), JobError>
    where
        F: FnMut(JobEvent) -> anyhow::Result<()>,
    {
        req.validate()?;
        let command = self.builder.render(req);
        let guard = self.acquire(&command, None)?;
        let mut sink = EventSink { f: sink, alive: true };
        log::info!("job {}: starting in streaming mode", guard.id);
        log::debug!("job {}: command: {}", guard.id, command);

        let mut child = match spawn_in_group(&format!("{} 2>&1", command), true) {
            Ok(child) => child,
            Err(e) => {
                log::error!("job {}: failed to start: {}", guard.id, e);
                drop(guard);
                sink.emit(JobEvent::Error(format!("failed to start: {}", e)));
                return Ok(());
            }
        };
        if !guard.attach(child.id()) {
            kill_group_or_leader(&mut child);
            let _ = child.wait();
            drop(guard);
            sink.emit(JobEvent::Error("stopped before the process started".to_owned()));
            return Ok(());
        }

        let pgid = child.id();
        sink.emit(JobEvent::Command(command.clone()));
        let mut transcript = format!("{}\n\n", command);

        let read_result = match child.stdout.take() {
            Some(stdout) => forward_lines(stdout, |line| {
                log::trace!("job {}: {}", guard.id, line);
                transcript.push_str(&line);
                transcript.push('\n');
                sink.emit(JobEvent::Output(line));
            }),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "stdout is not captured",
            )),
        };

        if let Err(e) = &read_result {
            log::error!("job {}: reading output failed: {}", guard.id, e);
            kill_group_or_leader(&mut child);
        }
        let exit = guard.wait(&mut child, || true, None);
        sweep_group(guard.id, pgid);

        let failure = if !guard.is_held() {
            Some(format!("Error: {}", STOPPED))
        } else if let Err(e) = read_result {
            Some(format!("Error: failed to read output: {}", e))
        } else {
            match exit {
                Ok(Exit::Finished(status)) if status.success() => None,
                Ok(Exit::Finished(status)) => {
                    Some(format!("Error: {}", utils::cmd_helper::describe_exit(&status)))
                }
                Ok(Exit::TimedOut) => Some("Error: timed out".to_owned()),
                Err(e) => Some(format!("Error: {}", e)),
            }
        };
        let id = guard.id;
        drop(guard);

        match failure {
            None => {
                log::info!("job {}: completed", id);
                sink.emit(JobEvent::Done("Command completed successfully".to_owned()));
            }
            Some(msg) => {
                log::info!("job {}: {}", id, msg);
                transcript.push('\n');
                transcript.push_str(&msg);
                sink.emit(JobEvent::Error(msg));
            }
        }
        self.history.submit(transcript);
        Ok(())
    }

    /// Kill the process group of the running job, if any.
    pub fn stop(&self) -> StopResponse {
        let mut slot = lock(&self.slot);
        let (id, pgid) = match slot.as_ref() {
            None => return StopResponse::new(StopStatus::NoTask, "No running NCCL test to stop"),
            Some(job) => (job.id, job.pgid),
        };
        let pgid = match pgid {
            Some(pgid) => pgid,
            None => {
                *slot = None;
                log::warn!("job {} had no process when stopped", id);
                return StopResponse::new(StopStatus::NoProcess, "Command has no process");
            }
        };
        match kill_group(pgid) {
            // ESRCH: the group is already gone, the run is just finishing up
            Ok(()) | Err(Errno::ESRCH) => {
                *slot = None;
                log::warn!("job {}: killed process group {}", id, pgid);
                StopResponse::new(StopStatus::Stopped, "NCCL test stopped successfully")
            }
            Err(e) => {
                log::error!("job {}: failed to kill process group {}: {}", id, pgid, e);
                StopResponse::new(
                    StopStatus::Error,
                    format!("Failed to kill process group: {}", e),
                )
            }
        }
    }
}

/// Read `r` line by line, handing each line without its terminator to `f`
/// before reading the next one.
fn forward_lines<R: Read, F: FnMut(String)>(r: R, mut f: F) -> std::io::Result<()> {
    let mut reader = BufReader::new(r);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                f(line.trim_end_matches(&['\n', '\r'][..]).to_owned());
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
