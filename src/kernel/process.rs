//! Process abstraction
//!
//! A process is one schedulable unit of execution with its own address
//! space and file descriptor table. Its mutable state lives behind the
//! process's own lock, paired with a condition variable that exit signals
//! and waitpid sleeps on.
//!
//! Lifecycle: `RUNNING` (thread attached, no status) -> `EXITED` (thread
//! count zero, status recorded). An exited process survives as a zombie
//! until exactly one waiter consumes its status and destroys it; a process
//! nobody waits for is retained indefinitely.

use super::file::FileHandle;
use super::memory::AddressSpace;
use super::sync::{Condvar, Lock};
use std::path::PathBuf;

/// Maximum file descriptors per process.
pub const OPEN_MAX: usize = 128;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// File descriptor - an index into a process's file table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u32);

impl Fd {
    pub const STDIN: Fd = Fd(0);
    pub const STDOUT: Fd = Fd(1);
    pub const STDERR: Fd = Fd(2);

    pub fn in_range(self) -> bool {
        (self.0 as usize) < OPEN_MAX
    }
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Encoded exit status, published once by exit and consumed once by
/// waitpid. Only normal exits exist here; the code is truncated to a byte
/// and shifted past the two low "how it ended" bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(u32);

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self(((code as u32) & 0xff) << 2)
    }

    /// The exit code as passed to exit, modulo truncation.
    pub fn code(self) -> i32 {
        (self.0 >> 2) as i32
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A process's file descriptor table: a fixed array of slots, each either
/// empty or holding a handle into the open-file pool. Multiple slots, in
/// the same or different processes, may hold the same handle.
pub struct FdTable {
    slots: [Option<FileHandle>; OPEN_MAX],
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: [None; OPEN_MAX],
        }
    }

    /// Lowest-free descriptor allocation. `None` when the table is full.
    pub fn alloc(&mut self, handle: FileHandle) -> Option<Fd> {
        let free = self.slots.iter().position(|s| s.is_none())?;
        self.slots[free] = Some(handle);
        Some(Fd(free as u32))
    }

    pub fn get(&self, fd: Fd) -> Option<FileHandle> {
        if !fd.in_range() {
            return None;
        }
        self.slots[fd.0 as usize]
    }

    pub fn set(&mut self, fd: Fd, handle: FileHandle) {
        self.slots[fd.0 as usize] = Some(handle);
    }

    /// Empty a slot, returning what it held.
    pub fn clear(&mut self, fd: Fd) -> Option<FileHandle> {
        if !fd.in_range() {
            return None;
        }
        self.slots[fd.0 as usize].take()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Occupied slots, in descriptor order.
    pub fn entries(&self) -> impl Iterator<Item = (Fd, FileHandle)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|h| (Fd(i as u32), h)))
    }

    /// Drain every slot (process teardown).
    pub fn drain(&mut self) -> Vec<FileHandle> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock-guarded state of a process.
pub struct ProcInner {
    /// Display name (inherited across fork)
    pub name: String,
    /// Number of attached threads; zero iff the process has exited
    pub threads: u32,
    /// Exit status, recorded exactly once by exit
    pub status: Option<ExitStatus>,
    /// Set by the waiter that consumed the status; at most one ever does
    pub waited: bool,
    /// Parent pid; `None` is the orphan sentinel
    pub parent: Option<Pid>,
    /// Live children, in creation order
    pub children: Vec<Pid>,
    /// Descriptor table
    pub files: FdTable,
    /// Current working directory
    pub cwd: PathBuf,
    /// Address space; `None` for kernel-only processes
    pub space: Option<AddressSpace>,
}

impl ProcInner {
    pub fn is_child(&self, pid: Pid) -> bool {
        self.children.contains(&pid)
    }

    pub fn remove_child(&mut self, pid: Pid) {
        self.children.retain(|&c| c != pid);
    }
}

/// A process in the system
pub struct Process {
    pid: Pid,
    /// Guards all mutable state; also the lock waitpid pairs with `exit`
    pub inner: Lock<ProcInner>,
    /// Signalled once, by exit, after the thread count reaches zero
    pub exit: Condvar,
}

impl Process {
    pub fn new(pid: Pid, name: &str, parent: Option<Pid>, cwd: PathBuf) -> Self {
        Self {
            pid,
            inner: Lock::new(
                format!("{}", pid),
                ProcInner {
                    name: name.to_string(),
                    threads: 0,
                    status: None,
                    waited: false,
                    parent,
                    children: Vec::new(),
                    files: FdTable::new(),
                    cwd,
                    space: None,
                },
            ),
            exit: Condvar::new(format!("{} exit", pid)),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> String {
        self.inner.acquire().name.clone()
    }

    /// Thread count zero and status recorded.
    pub fn has_exited(&self) -> bool {
        let inner = self.inner.acquire();
        inner.threads == 0 && inner.status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_encodes_and_decodes() {
        for code in [0, 1, 42, 255] {
            assert_eq!(ExitStatus::exited(code).code(), code);
        }
        // Truncated to a byte, like the classic encoding.
        assert_eq!(ExitStatus::exited(256).code(), 0);
        assert_eq!(ExitStatus::exited(257).code(), 1);
        // The low two bits stay clear for the "how it ended" tag.
        assert_eq!(ExitStatus::exited(1).raw(), 0b100);
    }

    #[test]
    fn fd_table_allocates_lowest_free() {
        let mut ft = FdTable::new();
        assert_eq!(ft.alloc(10), Some(Fd(0)));
        assert_eq!(ft.alloc(11), Some(Fd(1)));
        ft.clear(Fd(0));
        assert_eq!(ft.alloc(12), Some(Fd(0)));
        assert_eq!(ft.get(Fd(0)), Some(12));
        assert_eq!(ft.get(Fd(1)), Some(11));
    }

    #[test]
    fn fd_table_is_bounded() {
        let mut ft = FdTable::new();
        for i in 0..OPEN_MAX {
            assert!(ft.alloc(i).is_some());
        }
        assert_eq!(ft.alloc(999), None);
        assert_eq!(ft.open_count(), OPEN_MAX);
    }

    #[test]
    fn fd_table_rejects_out_of_range() {
        let mut ft = FdTable::new();
        assert_eq!(ft.get(Fd(OPEN_MAX as u32)), None);
        assert_eq!(ft.clear(Fd(u32::MAX)), None);
    }

    #[test]
    fn fd_table_drain_empties_every_slot() {
        let mut ft = FdTable::new();
        ft.alloc(1);
        ft.alloc(2);
        ft.alloc(1);
        let mut handles = ft.drain();
        handles.sort();
        assert_eq!(handles, vec![1, 1, 2]);
        assert_eq!(ft.open_count(), 0);
    }

    #[test]
    fn fresh_process_is_running_and_childless() {
        let proc = Process::new(Pid(5), "sh", Some(Pid(1)), PathBuf::from("/"));
        assert_eq!(proc.pid(), Pid(5));
        assert!(!proc.has_exited());
        let inner = proc.inner.acquire();
        assert_eq!(inner.parent, Some(Pid(1)));
        assert!(inner.children.is_empty());
        assert_eq!(inner.files.open_count(), 0);
        assert_eq!(inner.status, None);
    }
}
