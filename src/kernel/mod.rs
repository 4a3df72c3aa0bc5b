//! The kernel - process lifecycle, descriptors, and system services
//!
//! One explicitly owned [`Kernel`] value holds every registry: the process
//! table, the open-file pool, the filesystem collaborator, and the tracer.
//! There is no hidden global; callers pass the kernel (and the calling
//! process's pid) into every operation, which is what makes the
//! concurrent-access tests in this crate possible without a whole-machine
//! harness.

pub mod file;
pub mod loader;
pub mod memory;
pub mod process;
pub mod proctable;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trace;

pub use file::{AccessMode, FileHandle, FilePool, OpenFlags, SYSTEM_OPEN_MAX};
pub use process::{ExitStatus, Fd, OPEN_MAX, Pid, Process};
pub use proctable::{PROC_MAX, ProcTable};
pub use syscall::{ExecImage, SyscallError, SyscallResult, WaitOptions, Whence};
pub use trace::{TraceSummary, Tracer};

use crate::klog;
use crate::vfs::{CONSOLE_PATH, FileSystem, OpenOptions as VfsOpenOptions};
use file::OpenFile;
use memory::AddressSpace;
use std::path::PathBuf;
use std::sync::Arc;

/// The kernel state - manages all processes and open files
pub struct Kernel {
    pub(crate) procs: ProcTable,
    pub(crate) files: FilePool,
    pub(crate) vfs: Arc<dyn FileSystem>,
    pub(crate) tracer: Tracer,
}

impl Kernel {
    /// Bring the kernel up: empty registries plus the always-resident
    /// kernel process at pid 0, with the boot thread attached to it.
    pub fn bootstrap(vfs: Arc<dyn FileSystem>) -> Arc<Kernel> {
        let kernel = Arc::new(Kernel {
            procs: ProcTable::new(),
            files: FilePool::new(),
            vfs,
            tracer: Tracer::new(),
        });
        let kproc = Arc::new(Process::new(Pid(0), "[kernel]", None, PathBuf::from("/")));
        sched::attach(&kproc);
        kernel.procs.install_kernel(kproc);
        kernel
    }

    pub fn vfs(&self) -> &Arc<dyn FileSystem> {
        &self.vfs
    }

    pub fn files(&self) -> &FilePool {
        &self.files
    }

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub(crate) fn proc(&self, pid: Pid) -> SyscallResult<Arc<Process>> {
        self.procs.lookup(pid).ok_or(SyscallError::NoProcess)
    }

    /// Create a fresh runnable process: a new pid, an empty address space,
    /// the kernel process's working directory, and descriptors 0/1/2 bound
    /// to console input/output/error. No thread is attached yet; see
    /// [`Kernel::run_process`] and [`Kernel::sys_fork`](syscall).
    pub fn create_user_process(&self, name: &str) -> SyscallResult<Arc<Process>> {
        let pid = self
            .procs
            .reserve()
            .ok_or(SyscallError::ProcTableFull)?;

        let cwd = self
            .procs
            .lookup(Pid(0))
            .map(|k| k.inner.acquire().cwd.clone())
            .unwrap_or_else(|| PathBuf::from("/"));

        let stdio = [
            (Fd::STDIN, AccessMode::ReadOnly, "stdin"),
            (Fd::STDOUT, AccessMode::WriteOnly, "stdout"),
            (Fd::STDERR, AccessMode::WriteOnly, "stderr"),
        ];
        let mut opened: Vec<(Fd, FileHandle)> = Vec::new();
        for (fd, mode, label) in stdio {
            match self.open_console(mode, label) {
                Ok(handle) => opened.push((fd, handle)),
                Err(e) => {
                    klog!("[kernel] console setup for {} failed: {}", pid, e);
                    for (_, h) in opened {
                        self.files.release(h);
                    }
                    self.procs.cancel(pid);
                    return Err(e);
                }
            }
        }

        let proc = Arc::new(Process::new(pid, name, None, cwd));
        {
            let mut inner = proc.inner.acquire();
            for (fd, handle) in &opened {
                inner.files.set(*fd, *handle);
            }
            inner.space = Some(AddressSpace::new());
        }
        self.procs.install(pid, Arc::clone(&proc));
        Ok(proc)
    }

    fn open_console(&self, mode: AccessMode, label: &str) -> SyscallResult<FileHandle> {
        let vnode = self.vfs.open(
            CONSOLE_PATH,
            VfsOpenOptions::new()
                .read(mode.readable())
                .write(mode.writable()),
        )?;
        match self.files.insert(OpenFile::new(label, vnode, mode, 0)) {
            Ok(handle) => Ok(handle),
            Err(file) => {
                file.vnode().close();
                Err(SyscallError::FileTableFull)
            }
        }
    }

    /// Create a process and immediately give it a thread running `entry`
    /// (the "run program" path used by bootstrap code and tests).
    pub fn run_process<F>(self: &Arc<Self>, name: &str, entry: F) -> SyscallResult<Arc<Process>>
    where
        F: FnOnce(Arc<Kernel>, Pid) + Send + 'static,
    {
        let proc = self.create_user_process(name)?;
        match sched::spawn(Arc::clone(self), Arc::clone(&proc), entry) {
            Ok(()) => Ok(proc),
            Err(e) => {
                klog!("[kernel] thread spawn for {} failed: {}", proc.pid(), e);
                self.destroy_process(proc.pid());
                Err(SyscallError::OutOfResources)
            }
        }
    }

    /// Tear a process down and free its pid. The process must have no
    /// attached threads (never started, or already exited).
    ///
    /// Releases every descriptor, destroys the address space, re-parents
    /// all children to the orphan sentinel, unlinks the process from its
    /// parent's child set, and clears the table slot.
    pub fn destroy_process(&self, pid: Pid) {
        let Some(proc) = self.procs.lookup(pid) else {
            klog!("[kernel] destroy of unknown process {}", pid);
            return;
        };
        let (handles, children, parent) = {
            let mut inner = proc.inner.acquire();
            assert_eq!(
                inner.threads, 0,
                "{}: destroy of a process with attached threads",
                pid
            );
            let handles = inner.files.drain();
            let children = std::mem::take(&mut inner.children);
            let parent = inner.parent.take();
            inner.space = None;
            (handles, children, parent)
        };
        for handle in handles {
            self.files.release(handle);
        }
        for child in children {
            if let Some(cp) = self.procs.lookup(child) {
                cp.inner.acquire().parent = None;
            }
        }
        if let Some(pp) = parent.and_then(|p| self.procs.lookup(p)) {
            pp.inner.acquire().remove_child(pid);
        }
        self.procs.remove(pid);
    }

    // ========== USER MEMORY HELPERS ==========
    // The copyin/copyout layer bootstrap code and tests stage buffers with.

    /// Map a fresh writable region in a process's address space.
    pub fn map_user_region(&self, pid: Pid, base: usize, len: usize) -> SyscallResult<()> {
        let proc = self.proc(pid)?;
        let mut inner = proc.inner.acquire();
        let space = inner.space.as_mut().ok_or(SyscallError::BadAddress)?;
        space.define_region(base, len, true)?;
        Ok(())
    }

    /// Copy bytes into a process's memory.
    pub fn copy_out_user(&self, pid: Pid, addr: usize, bytes: &[u8]) -> SyscallResult<()> {
        let proc = self.proc(pid)?;
        let mut inner = proc.inner.acquire();
        let space = inner.space.as_mut().ok_or(SyscallError::BadAddress)?;
        space.copy_out(addr, bytes)?;
        Ok(())
    }

    /// Copy bytes out of a process's memory.
    pub fn copy_in_user(&self, pid: Pid, addr: usize, len: usize) -> SyscallResult<Vec<u8>> {
        let proc = self.proc(pid)?;
        let inner = proc.inner.acquire();
        let space = inner.space.as_ref().ok_or(SyscallError::BadAddress)?;
        let mut buf = vec![0u8; len];
        space.copy_in(addr, &mut buf)?;
        Ok(buf)
    }

    // ========== TRACING ==========

    pub fn trace_enable(&self) {
        self.tracer.enable();
    }

    pub fn trace_disable(&self) {
        self.tracer.disable();
    }

    pub fn trace_summary(&self) -> TraceSummary {
        self.tracer.summary()
    }

    pub fn trace_recent(&self) -> Vec<trace::TraceEvent> {
        self.tracer.recent()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;

    fn boot() -> Arc<Kernel> {
        Kernel::bootstrap(Arc::new(MemoryFs::new()))
    }

    #[test]
    fn bootstrap_installs_the_kernel_process() {
        let kernel = boot();
        let kproc = kernel.procs().lookup(Pid(0)).unwrap();
        assert_eq!(kproc.pid(), Pid(0));
        assert_eq!(kproc.name(), "[kernel]");
        // The boot thread keeps it permanently alive.
        assert!(!kproc.has_exited());
        assert_eq!(kernel.procs().live_count(), 0);
    }

    #[test]
    fn new_process_has_console_stdio_bound() {
        let kernel = boot();
        let proc = kernel.create_user_process("sh").unwrap();
        let inner = proc.inner.acquire();
        assert_eq!(inner.files.open_count(), 3);
        for fd in [Fd::STDIN, Fd::STDOUT, Fd::STDERR] {
            let handle = inner.files.get(fd).unwrap();
            assert_eq!(kernel.files().get(handle).unwrap().ref_count(), 1);
        }
        // Each stdio descriptor is its own open-file object.
        assert_eq!(kernel.files().len(), 3);
    }

    #[test]
    fn create_then_destroy_leaves_no_trace() {
        let kernel = boot();
        let pid = kernel.create_user_process("ephemeral").unwrap().pid();
        assert!(kernel.procs().contains(pid));

        kernel.destroy_process(pid);
        assert!(!kernel.procs().contains(pid));
        assert_eq!(kernel.procs().live_count(), 0);
        // The console open-files went back to the pool.
        assert!(kernel.files().is_empty());
    }

    #[test]
    fn process_creation_fails_when_the_table_fills() {
        let kernel = boot();
        let mut procs = Vec::new();
        for i in 0..PROC_MAX {
            procs.push(kernel.create_user_process(&format!("p{}", i)).unwrap());
        }
        assert!(matches!(
            kernel.create_user_process("straw"),
            Err(SyscallError::ProcTableFull)
        ));
        for p in procs {
            kernel.destroy_process(p.pid());
        }
        assert_eq!(kernel.procs().live_count(), 0);
    }

    #[test]
    fn user_memory_helpers_roundtrip_and_fault() {
        let kernel = boot();
        let pid = kernel.create_user_process("mem").unwrap().pid();
        kernel.map_user_region(pid, 0x1000, 64).unwrap();
        kernel.copy_out_user(pid, 0x1008, b"payload").unwrap();
        assert_eq!(kernel.copy_in_user(pid, 0x1008, 7).unwrap(), b"payload");
        assert!(matches!(
            kernel.copy_in_user(pid, 0xdead_0000, 1),
            Err(SyscallError::BadAddress)
        ));
        kernel.destroy_process(pid);
    }
}
