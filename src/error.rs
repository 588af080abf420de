//! Setup-failure taxonomy (spec.md §7). Only the fatal, initialization-time
//! boundary uses this type; per-sample races are logged and swallowed where
//! they occur, never converted into an `Error`.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("netlink socket setup failed: {0}")]
    Netlink(String),

    #[error("taskstats family resolution failed")]
    Taskstats,

    #[error("no running collector found")]
    NoCollector,

    #[error("could not locate the StackMap on the collector's stack after {attempts} attempts")]
    StackMapNotFound { attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
