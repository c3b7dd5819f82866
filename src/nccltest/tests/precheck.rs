use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::time::Duration;

use nccltest::roster::RosterStore;
use nccltest::{NodeProber, NodeStatus, RemoteExecutor};

/// Answers from a table, optionally slowly, and records how many calls
/// overlapped.
#[derive(Default)]
struct FakeExecutor {
    answers: HashMap<String, Result<String, String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeExecutor {
    fn answering(pairs: &[(&str, Result<&str, &str>)]) -> Self {
        FakeExecutor {
            answers: pairs
                .iter()
                .map(|&(addr, r)| {
                    let r = match r {
                        Ok(out) => Ok(out.to_owned()),
                        Err(e) => Err(e.to_owned()),
                    };
                    (addr.to_owned(), r)
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl RemoteExecutor for &FakeExecutor {
    fn execute(&self, addr: &str, command: &str) -> anyhow::Result<String> {
        assert_eq!(command, "count-gpu-procs");
        let now = self.in_flight.fetch_add(1, SeqCst) + 1;
        self.max_in_flight.fetch_max(now, SeqCst);
        std::thread::sleep(self.delay);
        self.in_flight.fetch_sub(1, SeqCst);
        match self.answers.get(addr) {
            Some(Ok(out)) => Ok(out.clone()),
            Some(Err(e)) => Err(anyhow::anyhow!("{}", e)),
            None => Ok("0\n".to_owned()),
        }
    }
}

fn addrs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("10.0.0.{}", i)).collect()
}

#[test]
fn statuses_follow_roster_order() {
    logging::init_log();
    let exec = FakeExecutor::answering(&[("10.0.0.3", Ok("2\n")), ("10.0.0.7", Ok(" 5 \n"))]);
    let prober = NodeProber::new(&exec, "count-gpu-procs", 4).unwrap();

    let roster = addrs(12);
    let statuses = prober.probe_all(&roster);
    assert_eq!(statuses.len(), roster.len());
    for (status, addr) in statuses.iter().zip(&roster) {
        assert_eq!(&status.ip, addr);
    }
    assert_eq!(statuses[3].process_count, 2);
    assert_eq!(statuses[7].process_count, 5);
    assert!(statuses.iter().all(|s| !s.is_error()));
}

#[test]
fn failures_are_isolated() {
    let exec = FakeExecutor::answering(&[
        ("10.0.0.1", Err("connection refused")),
        ("10.0.0.2", Ok("not a number")),
        ("10.0.0.3", Ok("1")),
    ]);
    let prober = NodeProber::new(&exec, "count-gpu-procs", 2).unwrap();
    let statuses = prober.probe_all(&addrs(4));

    assert_eq!(statuses[0], NodeStatus { ip: "10.0.0.0".to_owned(), process_count: 0, error: None });
    let err = statuses[1].error.as_deref().unwrap();
    assert!(err.starts_with("SSH failed: "), "{}", err);
    assert!(err.contains("connection refused"), "{}", err);
    let err = statuses[2].error.as_deref().unwrap();
    assert!(err.starts_with("Failed to parse process count: "), "{}", err);
    assert_eq!(statuses[2].process_count, 0);
    assert!(statuses[3].is_busy());
}

#[test]
fn in_flight_probes_never_exceed_concurrency() {
    let exec = FakeExecutor {
        delay: Duration::from_millis(20),
        ..Default::default()
    };
    let prober = NodeProber::new(&exec, "count-gpu-procs", 3).unwrap();
    assert_eq!(prober.concurrency(), 3);

    assert_eq!(prober.probe_all(&addrs(20)).len(), 20);
    let max = exec.max_in_flight.load(SeqCst);
    assert!(max >= 1 && max <= 3, "max in flight: {}", max);
}

#[test]
fn report_partitions_busy_and_unreachable() {
    let exec = FakeExecutor::answering(&[
        ("10.0.0.0", Ok("8")),
        ("10.0.0.2", Err("timeout")),
        ("10.0.0.4", Ok("1")),
    ]);
    let prober = NodeProber::new(&exec, "count-gpu-procs", 8).unwrap();
    let report = prober.precheck(&addrs(5));

    assert_eq!(report.total_nodes, 5);
    assert_eq!(report.busy_count, 2);
    assert_eq!(
        report.busy_nodes.iter().map(|n| n.ip.as_str()).collect::<Vec<_>>(),
        vec!["10.0.0.0", "10.0.0.4"]
    );
    assert_eq!(report.error_count, 1);
    assert_eq!(report.error_nodes[0].ip, "10.0.0.2");

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["busy_nodes"][0]["process_count"], 8);
    assert!(json["busy_nodes"][0].get("error").is_none());
}

#[test]
fn empty_roster_reports_nothing() {
    let exec = FakeExecutor::default();
    let prober = NodeProber::new(&exec, "count-gpu-procs", 4).unwrap();
    let report = prober.precheck(&[]);
    assert_eq!(report.total_nodes, 0);
    assert_eq!(report.busy_count, 0);
    assert_eq!(report.error_count, 0);
    assert!(report.busy_nodes.is_empty());

    let json = serde_json::to_value(&report).unwrap();
    assert!(json.get("error_nodes").is_none());
}

#[test]
fn missing_roster_checks_no_node() {
    let dir = tempfile::tempdir().unwrap();
    let rosters = RosterStore::new(dir.path().join("iplist"));
    let exec = FakeExecutor::default();
    let prober = NodeProber::new(&exec, "count-gpu-procs", 4).unwrap();

    let report = prober.precheck(&rosters.read("nowhere").unwrap());
    assert_eq!(report.total_nodes, 0);
}
