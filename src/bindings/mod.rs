//! Raw kernel ABI bindings this crate needs and does not get from a crate.
//!
//! Mirrors the layout conventions of `<linux/netlink.h>`, `<linux/connector.h>`,
//! `<linux/cn_proc.h>`, `<linux/genetlink.h>` and `<linux/taskstats.h>`. Only
//! the fields and constants actually used by `taskstats` and
//! `pid_scanner::netlink_scanner` are declared.

pub mod netlink;
