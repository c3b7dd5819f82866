use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "nccltest", about = "Launch and inspect NCCL tests across a cluster")]
pub struct Opts {
    /// The configure file, defaults are used when absent
    #[structopt(short = "c", long = "config")]
    pub config: Option<PathBuf>,

    /// Override the data directory holding iplist/ and history/
    #[structopt(long)]
    pub data_dir: Option<PathBuf>,

    #[structopt(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Clone, StructOpt)]
pub enum Cmd {
    /// Print the default test parameters as JSON
    Defaults,

    /// Print the mpirun command line a request renders to
    Command {
        /// Request file in JSON
        #[structopt(short, long)]
        request: PathBuf,
    },

    /// Run a test
    Run {
        /// Request file in JSON
        #[structopt(short, long)]
        request: PathBuf,

        /// Print output lines while the test runs instead of once at the end
        #[structopt(short, long)]
        stream: bool,

        /// Print JSON (one event per line in streaming mode)
        #[structopt(long)]
        json: bool,
    },

    /// Check every node of a roster for running GPU processes
    Precheck {
        /// Roster name under the iplist directory
        roster: String,
    },

    /// Extract the result table from a saved output
    Parse {
        file: PathBuf,

        /// Print the recognized raw data lines instead
        #[structopt(long)]
        raw: bool,
    },

    /// Manage rosters
    Roster(RosterCmd),

    /// Inspect saved transcripts
    History(HistoryCmd),
}

#[derive(Debug, Clone, StructOpt)]
pub enum RosterCmd {
    /// List rosters, newest first
    List,
    /// Print the addresses of a roster
    Show { name: String },
    /// Replace a roster with the given addresses
    Set { name: String, addrs: Vec<String> },
    /// Delete a roster
    Delete { name: String },
}

#[derive(Debug, Clone, StructOpt)]
pub enum HistoryCmd {
    /// List transcripts, newest first
    List,
    /// Print a transcript
    Show {
        filename: String,
        /// Print the parsed chart data instead
        #[structopt(long)]
        chart: bool,
    },
    /// Delete a transcript
    Delete { filename: String },
}
