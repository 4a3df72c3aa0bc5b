//! Thread/scheduler collaborator
//!
//! The kernel core needs three things from the scheduler: spawn a thread
//! into a process, attach/detach thread counts, and let a thread terminate
//! by returning from its entry. Here that maps onto `std::thread`; spawned
//! threads are detached, and waitpid is the join.

use super::process::{Pid, Process};
use super::Kernel;
use std::io;
use std::sync::Arc;
use std::thread;

/// Account a new thread to the process.
pub fn attach(proc: &Process) {
    proc.inner.acquire().threads += 1;
}

/// Remove a thread from the process's count.
pub fn detach(proc: &Process) {
    let mut inner = proc.inner.acquire();
    assert!(
        inner.threads > 0,
        "{}: detach with no attached threads",
        proc.pid()
    );
    inner.threads -= 1;
}

/// Spawn a thread running `entry` as the process's execution. The entry
/// receives the kernel and the process's own pid; it must finish with
/// `sys_exit` and then return promptly.
///
/// On spawn failure the thread count is rolled back and the error
/// propagated; the caller owns any wider cleanup.
pub fn spawn<F>(kernel: Arc<Kernel>, proc: Arc<Process>, entry: F) -> io::Result<()>
where
    F: FnOnce(Arc<Kernel>, Pid) + Send + 'static,
{
    attach(&proc);
    let pid = proc.pid();
    let name = proc.name();
    let thread_proc = Arc::clone(&proc);
    let result = thread::Builder::new()
        .name(format!("{} {}", pid, name))
        .spawn(move || {
            {
                let inner = thread_proc.inner.acquire();
                if let Some(space) = &inner.space {
                    space.activate();
                }
            }
            entry(kernel, pid);
        });
    match result {
        Ok(_detached) => Ok(()),
        Err(e) => {
            detach(&proc);
            Err(e)
        }
    }
}
