//! Command-line surface (spec.md §6), modeled the way the teacher's
//! `structopt`-derived option structs read (`commands/trace_info_command.rs`).

use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "bootcollect",
    about = "swiss-army boot-charting collector/dumper"
)]
pub struct Opt {
    /// Sleep the given microseconds and exit 0. Used by init scripts.
    #[structopt(long)]
    pub usleep: Option<u64>,

    /// Exit 0 if another collector is running, non-zero otherwise.
    #[structopt(long = "probe-running")]
    pub probe_running: bool,

    /// Switch to dumper role: find a running collector and write its
    /// buffers under this path.
    #[structopt(short = "d", long = "dump")]
    pub dump: Option<PathBuf>,

    /// Record timestamps relative to the first tick rather than absolute
    /// uptime.
    #[structopt(short = "r")]
    pub relative_time: bool,

    /// Emit diagnostics to stderr rather than to the kernel message buffer.
    #[structopt(short = "c", long = "console")]
    pub console: bool,

    /// Sampling frequency in Hz.
    #[structopt(default_value = "50")]
    pub hz: u32,
}

impl Opt {
    pub fn from_args_checked() -> Opt {
        Opt::from_args()
    }
}
