//! Dual logging backend: stderr via `env_logger` when `--console` is given,
//! otherwise a small `log::Log` implementation that writes to
//! `/dev/kmsg` (spec.md §6 `-c`/`--console`, §9 "peripheral formatters").

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KmsgLogger {
    file: Mutex<Option<std::fs::File>>,
}

impl Log for KmsgLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("<{}>bootcollect: {}", kmsg_priority(record.level()), record.args());
        let mut guard = self.file.lock().expect("kmsg logger mutex poisoned");
        match guard.as_mut() {
            Some(f) => {
                let _ = writeln!(f, "{}", line);
            }
            None => {
                let _ = writeln!(io::stderr(), "{}", line);
            }
        }
    }

    fn flush(&self) {}
}

fn kmsg_priority(level: Level) -> u8 {
    match level {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 6,
        Level::Debug | Level::Trace => 7,
    }
}

/// Initializes process-wide logging. `console` selects `env_logger`
/// (stderr); otherwise diagnostics go to `/dev/kmsg`, falling back to
/// stderr if that device cannot be opened (e.g. outside a real boot
/// environment, or under `cargo test`) — the collector must never abort
/// over a logging setup failure, but it must not go silent either.
pub fn init(console: bool) {
    if console {
        env_logger::Builder::from_default_env()
            .filter_level(LevelFilter::Info)
            .init();
        return;
    }

    let file = OpenOptions::new().write(true).open("/dev/kmsg").ok();
    let logger = Box::new(KmsgLogger { file: Mutex::new(file) });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
