use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nix::sys::signal;
use structopt::StructOpt;

use nccltest::argument::{Cmd, HistoryCmd, Opts, RosterCmd};
use nccltest::config::{read_config, Config};
use nccltest::history::HistoryStore;
use nccltest::job::{JobController, JobEvent, RunStatus};
use nccltest::parser;
use nccltest::precheck::NodeProber;
use nccltest::request::BenchmarkRequest;
use nccltest::roster::RosterStore;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(sig: i32) {
    assert_eq!(sig, signal::SIGINT as i32);
    TERMINATE.store(true, SeqCst);
}

fn register_sigint() -> anyhow::Result<()> {
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_sigint),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        signal::sigaction(signal::SIGINT, &sig_action).context("failed to register sighandler")?;
    }
    Ok(())
}

/// Stop the running job once SIGINT arrives. The thread lives until the
/// process exits.
fn spawn_stop_watcher(controller: Arc<JobController>) {
    std::thread::spawn(move || loop {
        if TERMINATE.swap(false, SeqCst) {
            log::warn!("sigint caught, stopping the running test");
            let resp = controller.stop();
            log::warn!("stop: {:?}: {}", resp.status, resp.message);
        }
        std::thread::sleep(Duration::from_millis(50));
    });
}

fn read_request(path: &std::path::Path) -> anyhow::Result<BenchmarkRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("fail to read request {}", path.display()))?;
    let req = serde_json::from_str(&content)
        .with_context(|| format!("fail to parse request {}", path.display()))?;
    Ok(req)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(config: &Config, request: &std::path::Path, stream: bool, json: bool) -> anyhow::Result<()> {
    let req = read_request(request)?;
    let controller = Arc::new(JobController::from_config(config));
    register_sigint()?;
    spawn_stop_watcher(Arc::clone(&controller));

    if stream {
        let stdout = std::io::stdout();
        let mut failed = false;
        controller.run_streaming(&req, |event| {
            let mut out = stdout.lock();
            if let JobEvent::Error(_) = event {
                failed = true;
            }
            if json {
                writeln!(out, "{}", serde_json::to_string(&event)?)?;
            } else {
                match &event {
                    JobEvent::Command(cmd) => writeln!(out, "$ {}\n", cmd)?,
                    JobEvent::Output(line) => writeln!(out, "{}", line)?,
                    JobEvent::Done(msg) => writeln!(out, "\n{}", msg)?,
                    JobEvent::Error(msg) => writeln!(out, "\n{}", msg)?,
                }
            }
            out.flush()?;
            Ok(())
        })?;
        controller.flush_history();
        if failed {
            anyhow::bail!("nccl test failed");
        }
        return Ok(());
    }

    let resp = controller.run_blocking(&req)?;
    controller.flush_history();
    if json {
        print_json(&resp)?;
    } else {
        println!("$ {}\n", resp.command);
        println!("{}", resp.output);
        if let Some(err) = &resp.error {
            println!("\n{}", err);
        }
    }
    match resp.status {
        RunStatus::Success => Ok(()),
        status => Err(anyhow::anyhow!("nccl test finished with status {:?}", status)),
    }
}

fn print_chart(output: &str) {
    let data = parser::parse_output(output);
    println!(
        "{:>10} {:>12} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "size", "count", "type", "oop algbw", "oop busbw", "ip algbw", "ip busbw"
    );
    for d in &data {
        println!(
            "{:>10} {:>12} {:>10} {:>10.2} {:>10.2} {:>10.2} {:>10.2}",
            parser::format_size(d.size),
            d.count,
            d.dtype,
            d.out_algbw,
            d.out_busbw,
            d.in_algbw,
            d.in_busbw
        );
    }
    let summary = parser::parse_summary(output);
    if let Some(bw) = summary.avg_bus_bandwidth {
        println!("avg bus bandwidth: {} GB/s", bw);
    }
    if let Some(n) = summary.out_of_bounds {
        println!("out of bounds values: {}", n);
    }
}

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opts = Opts::from_args();
    log::debug!("Opts: {:#?}", opts);

    let mut config = match &opts.config {
        Some(path) => {
            log::info!("parsing configuration from file: {}", path.display());
            read_config(path)?
        }
        None => Config::default(),
    };
    if let Some(dir) = &opts.data_dir {
        config.data_dir = dir.clone();
    }
    log::debug!("config: {:#?}", config);

    let rosters = RosterStore::new(config.iplist_dir());
    let history = HistoryStore::new(config.history_dir());

    match opts.cmd {
        Cmd::Defaults => print_json(&BenchmarkRequest::defaults())?,
        Cmd::Command { request } => {
            let req = read_request(&request)?;
            req.validate()?;
            let builder = nccltest::CommandBuilder::from_config(&config);
            println!("{}", builder.render(&req));
        }
        Cmd::Run {
            request,
            stream,
            json,
        } => run(&config, &request, stream, json)?,
        Cmd::Precheck { roster } => {
            let addrs = rosters.read(&roster)?;
            let prober = NodeProber::from_config(&config.precheck)?;
            print_json(&prober.precheck(&addrs))?;
        }
        Cmd::Parse { file, raw } => {
            let output = std::fs::read_to_string(&file)
                .with_context(|| format!("fail to read {}", file.display()))?;
            if raw {
                for line in parser::extract_raw_data_lines(&output) {
                    println!("{}", line);
                }
            } else {
                print_chart(&output);
            }
        }
        Cmd::Roster(RosterCmd::List) => print_json(&rosters.list()?)?,
        Cmd::Roster(RosterCmd::Show { name }) => {
            for addr in rosters.read(&name)? {
                println!("{}", addr);
            }
        }
        Cmd::Roster(RosterCmd::Set { name, addrs }) => rosters.save(&name, &addrs)?,
        Cmd::Roster(RosterCmd::Delete { name }) => rosters.delete(&name)?,
        Cmd::History(HistoryCmd::List) => print_json(&history.list()?)?,
        Cmd::History(HistoryCmd::Show { filename, chart }) => {
            let output = history.read(&filename)?;
            if chart {
                print_json(&parser::parse_output(&output))?;
            } else {
                print!("{}", output);
            }
        }
        Cmd::History(HistoryCmd::Delete { filename }) => history.delete(&filename)?,
    }

    Ok(())
}
