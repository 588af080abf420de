//! Process enumeration, abstracted over two backends (spec.md §4.4,
//! §9 "Polymorphic PidScanner"). The source models this as a vtable of
//! function pointers; here it is a trait object, selected once at startup
//! and used uniformly by the sample loop and by `TaskstatsClient::get_tgid`.

pub mod netlink_scanner;
pub mod procfs_scanner;

pub use netlink_scanner::NetlinkPidScanner;
pub use procfs_scanner::ProcfsPidScanner;

/// A first-sighting process-creation or exec/exit notification, emitted as a
/// side effect of `restart()` for the netlink backend and never for the
/// procfs backend (spec.md §4.6 step 5: only the netlink listener produces
/// `cmdline2.log`/`paternity.log` rows).
#[derive(Debug, Clone, Copy)]
pub enum PidEvent {
    Paternity { child: i32, parent: i32 },
    Exec { pid: i32 },
}

/// Abstract process enumerator. A `restart()`/`next()` cursor over the
/// current process set, plus a nested `get_tasks_*` cursor over the threads
/// of whichever pid `next()` last returned.
pub trait PidScanner {
    /// Refreshes the backing process set and rewinds the cursor. For the
    /// netlink backend this drains the event queue; for procfs it rewinds
    /// the open directory handle.
    fn restart(&mut self);

    /// Advances to the next pid, or 0 when exhausted.
    fn next(&mut self) -> i32;

    fn get_cur_pid(&self) -> i32;

    /// 0 ("unknown") for the procfs backend, which has no fork-event
    /// information to draw on (spec.md §4.4.a).
    fn get_cur_ppid(&self) -> i32;

    fn get_tasks_start(&mut self);

    /// Advances the thread cursor for the current pid, or 0 when exhausted.
    fn get_tasks_next(&mut self) -> i32;

    fn get_tasks_stop(&mut self);

    /// Drains and returns events produced since the last call (netlink
    /// backend only; always empty for procfs).
    fn take_events(&mut self) -> Vec<PidEvent>;
}
