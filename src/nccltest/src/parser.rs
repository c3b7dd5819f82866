//! Extraction of the result table from nccl-tests output.
//!
//! The output interleaves NCCL log lines from every rank with the header, the
//! table rows and the footer, e.g.
//!
//! ```text
//! #       size         count      type   redop    root     time   algbw   busbw #wrong     time   algbw   busbw #wrong
//! cetus-g88-061:3259226:3260615 [7] NCCL INFO Connected all trees
//!         1024           512  bfloat16     sum      -1    144.4    0.01    0.01      0    145.3    0.01    0.01      0
//! # Out of bounds values : 0 OK
//! # Avg bus bandwidth    : 15.9501
//! ```
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref TABLE_HEADER: Regex =
        Regex::new(r"^\s*#.*size.*count.*type.*time.*algbw.*busbw").unwrap();
    static ref TABLE_END: Regex =
        Regex::new(r"^\s*#\s*(Out of bounds|Avg bus bandwidth)").unwrap();
    // size count type redop root time algbw busbw #wrong time algbw busbw [#wrong]
    static ref DATA_LINE: Regex = Regex::new(
        r"^\s*\d+\s+\d+\s+\S+\s+\S+\s+\S+\s+[\d.]+\s+[\d.]+\s+[\d.]+\s+\d+\s+[\d.]+\s+[\d.]+\s+[\d.]+"
    )
    .unwrap();
    static ref OUT_OF_BOUNDS: Regex =
        Regex::new(r"^\s*#\s*Out of bounds values\s*:\s*(\d+)").unwrap();
    static ref AVG_BUS_BW: Regex =
        Regex::new(r"^\s*#\s*Avg bus bandwidth\s*:\s*([\d.]+)").unwrap();
}

const MIN_FIELDS: usize = 12;

/// One row of the result table, ready for charting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDataPoint {
    /// message size in bytes
    pub size: u64,
    /// number of elements
    pub count: u64,
    #[serde(rename = "type")]
    pub dtype: String,
    pub out_algbw: f64,
    pub out_busbw: f64,
    pub in_algbw: f64,
    pub in_busbw: f64,
}

/// The footer statistics printed after the table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchSummary {
    pub out_of_bounds: Option<u64>,
    /// GB/s
    pub avg_bus_bandwidth: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Scanning,
    Table,
}

#[inline]
pub fn is_table_header(line: &str) -> bool {
    TABLE_HEADER.is_match(line)
}

#[inline]
pub fn is_table_end(line: &str) -> bool {
    TABLE_END.is_match(line)
}

#[inline]
pub fn is_data_line(line: &str) -> bool {
    DATA_LINE.is_match(line)
}

/// Walk the table region and hand every recognized data line to `f`.
fn for_each_data_line<'a, F: FnMut(&'a str)>(output: &'a str, mut f: F) {
    let mut state = State::Scanning;
    for line in output.lines() {
        if is_table_header(line) {
            state = State::Table;
            continue;
        }
        if is_table_end(line) {
            break;
        }
        if state == State::Table && is_data_line(line) {
            f(line);
        }
    }
}

fn parse_data_line(line: &str) -> Option<ChartDataPoint> {
    let fields: Vec<&str> = WHITESPACE
        .split(line.trim())
        .filter(|x| !x.is_empty())
        .collect();
    if fields.len() < MIN_FIELDS {
        return None;
    }

    let size = fields[0].parse::<i64>().ok().filter(|&s| s > 0)? as u64;
    let float = |i: usize| fields[i].parse::<f64>().unwrap_or(0.0);

    Some(ChartDataPoint {
        size,
        count: fields[1].parse().unwrap_or(0),
        dtype: fields[2].to_owned(),
        out_algbw: float(6),
        out_busbw: float(7),
        in_algbw: float(10),
        in_busbw: float(11),
    })
}

/// Parse the output of a benchmark run into chart data points.
///
/// Lines in the table region that are not data rows are skipped, rows with a
/// non-positive size are dropped, and nothing is collected after the end
/// marker.
pub fn parse_output(output: &str) -> Vec<ChartDataPoint> {
    let mut data = Vec::new();
    for_each_data_line(output, |line| {
        if let Some(point) = parse_data_line(line) {
            data.push(point);
        }
    });
    data
}

/// The raw text of every line recognized as a data row, for checking by eye.
pub fn extract_raw_data_lines(output: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    for_each_data_line(output, |line| lines.push(line));
    lines
}

pub fn parse_summary(output: &str) -> BenchSummary {
    let mut summary = BenchSummary::default();
    for line in output.lines() {
        if let Some(cap) = OUT_OF_BOUNDS.captures(line) {
            summary.out_of_bounds = cap[1].parse().ok();
        } else if let Some(cap) = AVG_BUS_BW.captures(line) {
            summary.avg_bus_bandwidth = cap[1].parse().ok();
        }
    }
    summary
}

/// Short size label used on chart axes: `512B`, `8.0K`, `1.0M`, `1.0G`.
pub fn format_size(size: u64) -> String {
    const K: u64 = 1 << 10;
    const M: u64 = 1 << 20;
    const G: u64 = 1 << 30;
    if size >= G {
        format!("{:.1}G", size as f64 / G as f64)
    } else if size >= M {
        format!("{:.1}M", size as f64 / M as f64)
    } else if size >= K {
        format!("{:.1}K", size as f64 / K as f64)
    } else {
        format!("{}B", size)
    }
}
