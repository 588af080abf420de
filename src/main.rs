//! Role dispatch (spec.md §6): `--usleep`/`--probe-running` are init-script
//! conveniences, `--dump <path>` switches to the dumper role, and the
//! default is the collector's sample loop.
//!
//! Grounded on `original_source/collector/collector.c::main`.

mod bindings;
mod buffer_file;
mod chunk;
mod cli;
mod dumper;
mod error;
mod logging;
mod netlink;
mod pid_map;
mod pid_scanner;
mod sample_loop;
mod taskstats;

use std::thread;
use std::time::Duration;

use structopt::StructOpt;

use cli::Opt;

fn main() {
    let opt = Opt::from_args_checked();
    logging::init(opt.console);

    let code = run(opt);
    std::process::exit(code);
}

fn run(opt: Opt) -> i32 {
    if let Some(usecs) = opt.usleep {
        thread::sleep(Duration::from_micros(usecs));
        return 0;
    }

    if opt.probe_running {
        return match dumper_find_running() {
            Ok(_) => 0,
            Err(_) => 1,
        };
    }

    if let Some(path) = opt.dump {
        return match dumper::extract_and_dump(&path) {
            Ok(()) => 0,
            Err(e) => {
                log::error!("extraction failed: {}", e);
                1
            }
        };
    }

    let config = sample_loop::Config {
        hz: if opt.hz == 0 { 50 } else { opt.hz },
        relative_time: opt.relative_time,
    };

    match sample_loop::run(config) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("collector initialization failed: {}", e);
            1
        }
    }
}

/// `--probe-running` reuses the dumper's collector-discovery walk without
/// actually attaching to anything.
fn dumper_find_running() -> Result<(), ()> {
    dumper::probe_running().map_err(|_| ())
}
