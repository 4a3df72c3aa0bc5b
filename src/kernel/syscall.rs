//! System call interface
//!
//! The boundary between user code and the kernel. Every operation takes
//! the calling process's pid explicitly; there is no ambient "current
//! process". Each call returns a success/failure discriminant, validation
//! happens before any side effect, and every failure branch unwinds the
//! work done so far - no partial success is ever reported.
//!
//! User buffers, paths, and argument vectors are addresses into the
//! calling process's address space; faults touching them surface as
//! [`SyscallError::BadAddress`], distinct from I/O failures.

use super::Kernel;
use super::file::{OpenFile, parse_open_flags};
use super::loader::{self, ARG_MAX, LoadError};
use super::memory::{AddressSpace, MemoryError, WORD_SIZE};
use super::process::{ExitStatus, Fd, Pid};
use super::sched;
use crate::klog;
use crate::vfs::{CONSOLE_PATH, OpenOptions as VfsOpenOptions};
use bitflags::bitflags;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Longest path accepted from user memory, terminator included.
pub const PATH_MAX: usize = 1024;

/// System call error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallError {
    /// Invalid, unoccupied, or wrongly-moded file descriptor
    BadFd,
    /// File or path not found
    NotFound,
    /// Already exists (exclusive create)
    AlreadyExists,
    /// Permission denied
    PermissionDenied,
    /// No such process
    NoProcess,
    /// Target is not a child of the caller (or is the caller itself)
    NotChild,
    /// Invalid argument
    InvalidArgument,
    /// Fault touching caller-supplied memory
    BadAddress,
    /// Path exceeded the maximum length
    NameTooLong,
    /// Combined execv argument strings exceeded the maximum
    ArgListTooLong,
    /// Process table is full
    ProcTableFull,
    /// The calling process's descriptor table is full
    FdTableFull,
    /// The system-wide open-file pool is full
    FileTableFull,
    /// The named file is not a runnable image
    NotExecutable,
    /// Seek on an object with no seek position
    IllegalSeek,
    /// Path component is not a directory
    NotADirectory,
    /// Thread or allocation resources exhausted
    OutOfResources,
    /// Generic I/O error
    Io(String),
}

impl std::fmt::Display for SyscallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyscallError::BadFd => write!(f, "bad file descriptor"),
            SyscallError::NotFound => write!(f, "not found"),
            SyscallError::AlreadyExists => write!(f, "already exists"),
            SyscallError::PermissionDenied => write!(f, "permission denied"),
            SyscallError::NoProcess => write!(f, "no such process"),
            SyscallError::NotChild => write!(f, "not a child of the caller"),
            SyscallError::InvalidArgument => write!(f, "invalid argument"),
            SyscallError::BadAddress => write!(f, "bad address"),
            SyscallError::NameTooLong => write!(f, "path name too long"),
            SyscallError::ArgListTooLong => write!(f, "argument list too long"),
            SyscallError::ProcTableFull => write!(f, "process table full"),
            SyscallError::FdTableFull => write!(f, "file descriptor table full"),
            SyscallError::FileTableFull => write!(f, "system open-file table full"),
            SyscallError::NotExecutable => write!(f, "not an executable image"),
            SyscallError::IllegalSeek => write!(f, "illegal seek"),
            SyscallError::NotADirectory => write!(f, "not a directory"),
            SyscallError::OutOfResources => write!(f, "out of resources"),
            SyscallError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl From<io::Error> for SyscallError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => SyscallError::NotFound,
            ErrorKind::AlreadyExists => SyscallError::AlreadyExists,
            ErrorKind::PermissionDenied => SyscallError::PermissionDenied,
            ErrorKind::NotADirectory => SyscallError::NotADirectory,
            ErrorKind::InvalidInput => SyscallError::InvalidArgument,
            _ => SyscallError::Io(e.to_string()),
        }
    }
}

impl From<MemoryError> for SyscallError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Unmapped { .. } | MemoryError::ReadOnly { .. } => {
                SyscallError::BadAddress
            }
            MemoryError::TooLong => SyscallError::NameTooLong,
            MemoryError::NotUtf8 => SyscallError::InvalidArgument,
            MemoryError::Overlap { .. } | MemoryError::InvalidSize => {
                SyscallError::InvalidArgument
            }
        }
    }
}

impl From<LoadError> for SyscallError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::EmptyImage | LoadError::ImageTooLarge => SyscallError::NotExecutable,
            LoadError::Io(msg) => SyscallError::Io(msg),
            LoadError::Memory(m) => m.into(),
        }
    }
}

pub type SyscallResult<T> = Result<T, SyscallError>;

bitflags! {
    /// Flags accepted by waitpid. Any other bit is an invalid argument.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WaitOptions: u32 {
        /// Return immediately, with no status, if the target still runs
        const NOHANG = 1;
    }
}

/// Where a seek offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: u32) -> Option<Whence> {
        match raw {
            0 => Some(Whence::Set),
            1 => Some(Whence::Cur),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// What a successful execv leaves behind for the dispatcher: the entry
/// point and stack of the fresh image. execv itself never returns control
/// into the old program; entering this image is the dispatcher's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecImage {
    pub entry: usize,
    pub stack_ptr: usize,
    pub argc: usize,
    /// Address of the null-terminated argv pointer vector
    pub argv: usize,
}

/// Resolve a user path against a working directory. Device paths pass
/// through untouched.
fn resolve_path(cwd: &Path, path: &str) -> String {
    if path == CONSOLE_PATH || path.starts_with('/') {
        path.to_string()
    } else {
        cwd.join(path).to_string_lossy().into_owned()
    }
}

impl Kernel {
    fn finish<T>(&self, name: &'static str, caller: Pid, res: SyscallResult<T>) -> SyscallResult<T> {
        self.tracer.record(name, caller.0, res.is_ok());
        res
    }

    // ========== FILE SYSCALLS ==========

    /// Open the file named by the user path at `upath`, returning the new
    /// descriptor. The low bits of `raw_flags` pick the access mode;
    /// `_mode` (permission bits) is accepted for surface compatibility and
    /// ignored, as the filesystem collaborator carries no permissions.
    pub fn sys_open(
        &self,
        caller: Pid,
        upath: usize,
        raw_flags: u32,
        _mode: u32,
    ) -> SyscallResult<Fd> {
        let res = self.open_inner(caller, upath, raw_flags);
        self.finish("open", caller, res)
    }

    fn open_inner(&self, caller: Pid, upath: usize, raw_flags: u32) -> SyscallResult<Fd> {
        let proc = self.proc(caller)?;
        let (path, cwd) = {
            let inner = proc.inner.acquire();
            let space = inner.space.as_ref().ok_or(SyscallError::BadAddress)?;
            (space.copy_in_str(upath, PATH_MAX)?, inner.cwd.clone())
        };
        let (mode, flags) = parse_open_flags(raw_flags).ok_or(SyscallError::InvalidArgument)?;
        let resolved = resolve_path(&cwd, &path);

        let vnode = self.vfs.open(
            &resolved,
            VfsOpenOptions::new()
                .read(mode.readable())
                .write(mode.writable())
                .create(flags.contains(super::OpenFlags::CREATE))
                .create_new(flags.contains(super::OpenFlags::EXCL))
                .truncate(flags.contains(super::OpenFlags::TRUNC)),
        )?;

        // Append starts at end of file, which takes a stat.
        let offset = if flags.contains(super::OpenFlags::APPEND) {
            match vnode.size() {
                Ok(n) => n,
                Err(e) => {
                    vnode.close();
                    return Err(e.into());
                }
            }
        } else {
            0
        };

        let handle = match self.files.insert(OpenFile::new(&resolved, vnode, mode, offset)) {
            Ok(handle) => handle,
            Err(file) => {
                file.vnode().close();
                return Err(SyscallError::FileTableFull);
            }
        };

        let fd = proc.inner.acquire().files.alloc(handle);
        match fd {
            Some(fd) => Ok(fd),
            None => {
                self.files.release(handle);
                Err(SyscallError::FdTableFull)
            }
        }
    }

    /// Close a descriptor. The open-file object it referenced lives on
    /// while other descriptors (here or in other processes) still alias it.
    pub fn sys_close(&self, caller: Pid, fd: Fd) -> SyscallResult<()> {
        let res = self.close_inner(caller, fd);
        self.finish("close", caller, res)
    }

    fn close_inner(&self, caller: Pid, fd: Fd) -> SyscallResult<()> {
        let proc = self.proc(caller)?;
        let handle = proc
            .inner
            .acquire()
            .files
            .clear(fd)
            .ok_or(SyscallError::BadFd)?;
        self.files.release(handle);
        Ok(())
    }

    /// Read up to `len` bytes at the descriptor's current offset into the
    /// user buffer at `ubuf`. Advances the offset by the bytes actually
    /// read and returns that count.
    pub fn sys_read(&self, caller: Pid, fd: Fd, ubuf: usize, len: usize) -> SyscallResult<usize> {
        let res = self.read_inner(caller, fd, ubuf, len);
        self.finish("read", caller, res)
    }

    fn read_inner(&self, caller: Pid, fd: Fd, ubuf: usize, len: usize) -> SyscallResult<usize> {
        let proc = self.proc(caller)?;
        let handle = proc
            .inner
            .acquire()
            .files
            .get(fd)
            .ok_or(SyscallError::BadFd)?;
        let file = self.files.get(handle).ok_or(SyscallError::BadFd)?;
        if !file.mode().readable() {
            return Err(SyscallError::BadFd);
        }

        // The vnode I/O and the offset advance happen under the object's
        // lock; concurrent readers of a shared object serialize here.
        let mut kbuf = vec![0u8; len];
        let n = {
            let mut st = file.state().acquire();
            let n = file.vnode().read_at(&mut kbuf, st.offset)?;
            st.offset += n as u64;
            n
        };
        kbuf.truncate(n);

        let mut inner = proc.inner.acquire();
        let space = inner.space.as_mut().ok_or(SyscallError::BadAddress)?;
        space.copy_out(ubuf, &kbuf)?;
        Ok(n)
    }

    /// Write `len` bytes from the user buffer at `ubuf` at the
    /// descriptor's current offset. Advances the offset by the bytes
    /// actually written and returns that count.
    pub fn sys_write(&self, caller: Pid, fd: Fd, ubuf: usize, len: usize) -> SyscallResult<usize> {
        let res = self.write_inner(caller, fd, ubuf, len);
        self.finish("write", caller, res)
    }

    fn write_inner(&self, caller: Pid, fd: Fd, ubuf: usize, len: usize) -> SyscallResult<usize> {
        let proc = self.proc(caller)?;
        let (handle, kbuf) = {
            let inner = proc.inner.acquire();
            let handle = inner.files.get(fd).ok_or(SyscallError::BadFd)?;
            let space = inner.space.as_ref().ok_or(SyscallError::BadAddress)?;
            let mut kbuf = vec![0u8; len];
            space.copy_in(ubuf, &mut kbuf)?;
            (handle, kbuf)
        };
        let file = self.files.get(handle).ok_or(SyscallError::BadFd)?;
        if !file.mode().writable() {
            return Err(SyscallError::BadFd);
        }

        let mut st = file.state().acquire();
        let n = file.vnode().write_at(&kbuf, st.offset)?;
        st.offset += n as u64;
        Ok(n)
    }

    /// Reposition a descriptor's offset. `End` is measured against the
    /// node's current size; the resulting offset may sit past end of file.
    pub fn sys_lseek(
        &self,
        caller: Pid,
        fd: Fd,
        offset: i64,
        whence_raw: u32,
    ) -> SyscallResult<u64> {
        let res = self.lseek_inner(caller, fd, offset, whence_raw);
        self.finish("lseek", caller, res)
    }

    fn lseek_inner(
        &self,
        caller: Pid,
        fd: Fd,
        offset: i64,
        whence_raw: u32,
    ) -> SyscallResult<u64> {
        let whence = Whence::from_raw(whence_raw).ok_or(SyscallError::InvalidArgument)?;
        let proc = self.proc(caller)?;
        let handle = proc
            .inner
            .acquire()
            .files
            .get(fd)
            .ok_or(SyscallError::BadFd)?;
        let file = self.files.get(handle).ok_or(SyscallError::BadFd)?;
        if !file.vnode().seekable() {
            return Err(SyscallError::IllegalSeek);
        }

        let mut st = file.state().acquire();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => st.offset as i64,
            Whence::End => file.vnode().size()? as i64,
        };
        let target = base
            .checked_add(offset)
            .ok_or(SyscallError::InvalidArgument)?;
        if target < 0 {
            return Err(SyscallError::InvalidArgument);
        }
        st.offset = target as u64;
        Ok(st.offset)
    }

    /// Make `newfd` alias the same open-file object as `oldfd`. A file
    /// previously open at `newfd` is closed first; `oldfd == newfd` is a
    /// no-op success.
    pub fn sys_dup2(&self, caller: Pid, oldfd: Fd, newfd: Fd) -> SyscallResult<Fd> {
        let res = self.dup2_inner(caller, oldfd, newfd);
        self.finish("dup2", caller, res)
    }

    fn dup2_inner(&self, caller: Pid, oldfd: Fd, newfd: Fd) -> SyscallResult<Fd> {
        if !oldfd.in_range() || !newfd.in_range() {
            return Err(SyscallError::BadFd);
        }
        let proc = self.proc(caller)?;
        let (old_handle, displaced) = {
            let inner = proc.inner.acquire();
            let old = inner.files.get(oldfd).ok_or(SyscallError::BadFd)?;
            (old, inner.files.get(newfd))
        };
        if oldfd == newfd {
            return Ok(newfd);
        }

        if !self.files.retain(old_handle) {
            return Err(SyscallError::BadFd);
        }
        proc.inner.acquire().files.set(newfd, old_handle);
        // Displaced file is released after the alias is in place, so a
        // descriptor pair already sharing one object nets out unchanged.
        if let Some(handle) = displaced {
            self.files.release(handle);
        }
        Ok(newfd)
    }

    /// Change the working directory.
    pub fn sys_chdir(&self, caller: Pid, upath: usize) -> SyscallResult<()> {
        let res = self.chdir_inner(caller, upath);
        self.finish("chdir", caller, res)
    }

    fn chdir_inner(&self, caller: Pid, upath: usize) -> SyscallResult<()> {
        let proc = self.proc(caller)?;
        let (path, cwd) = {
            let inner = proc.inner.acquire();
            let space = inner.space.as_ref().ok_or(SyscallError::BadAddress)?;
            (space.copy_in_str(upath, PATH_MAX)?, inner.cwd.clone())
        };
        let resolved = resolve_path(&cwd, &path);
        let meta = self.vfs.metadata(&resolved)?;
        if !meta.is_dir {
            return Err(SyscallError::NotADirectory);
        }
        proc.inner.acquire().cwd = PathBuf::from(resolved);
        Ok(())
    }

    /// Copy the working directory into the user buffer. Returns the bytes
    /// written, truncated to `len` - a thin pass-through plus the copyout.
    pub fn sys_getcwd(&self, caller: Pid, ubuf: usize, len: usize) -> SyscallResult<usize> {
        let res = self.getcwd_inner(caller, ubuf, len);
        self.finish("getcwd", caller, res)
    }

    fn getcwd_inner(&self, caller: Pid, ubuf: usize, len: usize) -> SyscallResult<usize> {
        let proc = self.proc(caller)?;
        let mut inner = proc.inner.acquire();
        let bytes = inner.cwd.to_string_lossy().into_owned().into_bytes();
        let n = bytes.len().min(len);
        let space = inner.space.as_mut().ok_or(SyscallError::BadAddress)?;
        space.copy_out(ubuf, &bytes[..n])?;
        Ok(n)
    }

    /// Remove a file. A placeholder in this kernel: the path is still
    /// copied in and validated, then the call reports success without
    /// touching the filesystem.
    pub fn sys_remove(&self, caller: Pid, upath: usize) -> SyscallResult<()> {
        let res = self.remove_inner(caller, upath);
        self.finish("remove", caller, res)
    }

    fn remove_inner(&self, caller: Pid, upath: usize) -> SyscallResult<()> {
        let proc = self.proc(caller)?;
        let inner = proc.inner.acquire();
        let space = inner.space.as_ref().ok_or(SyscallError::BadAddress)?;
        let _path = space.copy_in_str(upath, PATH_MAX)?;
        Ok(())
    }

    // ========== PROCESS SYSCALLS ==========

    /// The caller's own pid. Cannot fail for a live process.
    pub fn sys_getpid(&self, caller: Pid) -> SyscallResult<Pid> {
        let res = self.proc(caller).map(|p| p.pid());
        self.finish("getpid", caller, res)
    }

    /// Duplicate the calling process.
    ///
    /// The child gets a full copy of the address space, a descriptor table
    /// whose occupied slots alias the parent's open-file objects (offsets
    /// and modes shared, each object's reference count bumped), the
    /// parent's name and working directory, and a fresh thread running
    /// `child_entry` with the child's pid - the point symmetric to the
    /// parent's return, where a real child would observe zero.
    ///
    /// Any failure after the pid reservation rolls everything back and
    /// surfaces as an error in the parent; on success the parent gets the
    /// child's pid.
    pub fn sys_fork<F>(self: &Arc<Self>, caller: Pid, child_entry: F) -> SyscallResult<Pid>
    where
        F: FnOnce(Arc<Kernel>, Pid) + Send + 'static,
    {
        let res = self.fork_inner(caller, child_entry);
        self.finish("fork", caller, res)
    }

    fn fork_inner<F>(self: &Arc<Self>, caller: Pid, child_entry: F) -> SyscallResult<Pid>
    where
        F: FnOnce(Arc<Kernel>, Pid) + Send + 'static,
    {
        let parent = self.proc(caller)?;
        let child_pid = self.procs.reserve().ok_or(SyscallError::ProcTableFull)?;

        let (name, cwd, handles, space) = {
            let inner = parent.inner.acquire();
            (
                inner.name.clone(),
                inner.cwd.clone(),
                inner.files.entries().collect::<Vec<_>>(),
                inner.space.as_ref().map(|s| s.copy()),
            )
        };

        for (_, handle) in &handles {
            let alive = self.files.retain(*handle);
            assert!(alive, "fork: descriptor slot held a dead handle");
        }

        let child = Arc::new(super::Process::new(child_pid, &name, Some(caller), cwd));
        {
            let mut inner = child.inner.acquire();
            for (fd, handle) in &handles {
                inner.files.set(*fd, *handle);
            }
            inner.space = space;
        }
        self.procs.install(child_pid, Arc::clone(&child));
        parent.inner.acquire().children.push(child_pid);

        if let Err(e) = sched::spawn(Arc::clone(self), child, child_entry) {
            klog!("[kernel] fork from {} failed to spawn: {}", caller, e);
            self.destroy_process(child_pid);
            return Err(SyscallError::OutOfResources);
        }
        Ok(child_pid)
    }

    /// Replace the calling process's program image.
    ///
    /// The path and every argument string are copied into kernel memory
    /// first; the image is loaded and the argument stack laid out in a
    /// fresh address space. Only when nothing can fail anymore is the new
    /// space swapped in and the old one destroyed, so every error return
    /// leaves the old program intact. On success the old image is gone:
    /// the caller must transfer control into the returned [`ExecImage`]
    /// and never runs the old code again.
    pub fn sys_execv(&self, caller: Pid, upath: usize, uargv: usize) -> SyscallResult<ExecImage> {
        let res = self.execv_inner(caller, upath, uargv);
        self.finish("execv", caller, res)
    }

    fn execv_inner(&self, caller: Pid, upath: usize, uargv: usize) -> SyscallResult<ExecImage> {
        let proc = self.proc(caller)?;
        let (path, args, cwd) = {
            let inner = proc.inner.acquire();
            let space = inner.space.as_ref().ok_or(SyscallError::BadAddress)?;
            let path = space.copy_in_str(upath, PATH_MAX)?;

            let mut args = Vec::new();
            let mut total = 0usize;
            loop {
                let ptr = space.read_word(uargv + args.len() * WORD_SIZE)?;
                if ptr == 0 {
                    break;
                }
                let arg = space.copy_in_str(ptr, ARG_MAX)?;
                total += arg.len() + 1;
                if total > ARG_MAX {
                    return Err(SyscallError::ArgListTooLong);
                }
                args.push(arg);
            }
            (path, args, inner.cwd.clone())
        };

        let resolved = resolve_path(&cwd, &path);
        let vnode = self.vfs.open(&resolved, VfsOpenOptions::new().read(true))?;
        let mut new_space = AddressSpace::new();
        let staged = (|| -> SyscallResult<(usize, usize, usize)> {
            let entry = loader::load_image(&vnode, &mut new_space)?;
            let sp = new_space.define_stack()?;
            let (sp, argv) = loader::build_arg_stack(&mut new_space, sp, &args)?;
            Ok((entry, sp, argv))
        })();
        vnode.close();
        let (entry, stack_ptr, argv) = staged?;

        // Point of no return: the old image is discarded.
        {
            let mut inner = proc.inner.acquire();
            inner.space = Some(new_space);
            if let Some(space) = &inner.space {
                space.activate();
            }
        }

        Ok(ExecImage {
            entry,
            stack_ptr,
            argc: args.len(),
            argv,
        })
    }

    /// Wait for a child to exit and consume its status.
    ///
    /// Returns `Ok(None)` when `NOHANG` is set and the target still runs.
    /// Otherwise blocks on the target's condvar until its exit, then
    /// destroys the target - exactly one waiter ever consumes a given
    /// child's status, and destruction is unconditional once it has.
    pub fn sys_waitpid(
        &self,
        caller: Pid,
        target: Pid,
        options: u32,
    ) -> SyscallResult<Option<(Pid, ExitStatus)>> {
        let res = self.waitpid_inner(caller, target, options);
        self.finish("waitpid", caller, res)
    }

    fn waitpid_inner(
        &self,
        caller: Pid,
        target: Pid,
        options: u32,
    ) -> SyscallResult<Option<(Pid, ExitStatus)>> {
        let options = WaitOptions::from_bits(options).ok_or(SyscallError::InvalidArgument)?;
        if target == caller {
            return Err(SyscallError::NotChild);
        }
        let caller_proc = self.proc(caller)?;
        let target_proc = self.procs.lookup(target).ok_or(SyscallError::NoProcess)?;
        if !caller_proc.inner.acquire().is_child(target) {
            return Err(SyscallError::NotChild);
        }

        let status = {
            let mut inner = target_proc.inner.acquire();
            if inner.waited {
                // Another waiter consumed this child first.
                return Err(SyscallError::NotChild);
            }
            if inner.threads > 0 && options.contains(WaitOptions::NOHANG) {
                return Ok(None);
            }
            while inner.threads > 0 {
                inner = target_proc.exit.wait(inner);
            }
            let status = inner
                .status
                .expect("exited process has no recorded status");
            inner.waited = true;
            status
        };

        self.destroy_process(target);
        Ok(Some((target, status)))
    }

    /// Terminate the calling process.
    ///
    /// Records the encoded status, detaches the calling thread *before*
    /// signalling (a woken waiter must never observe a nonzero thread
    /// count), re-parents all children to the orphan sentinel, and wakes
    /// the waiter if one is blocked. The process structure itself survives
    /// until a waitpid consumes it; exit never destroys it. The calling
    /// thread must return immediately after this call.
    pub fn sys_exit(&self, caller: Pid, code: i32) -> SyscallResult<()> {
        let res = self.exit_inner(caller, code);
        self.finish("exit", caller, res)
    }

    fn exit_inner(&self, caller: Pid, code: i32) -> SyscallResult<()> {
        let proc = self.proc(caller)?;

        // Orphan the children first: once the exit is signalled, a waiter
        // may reap this process at any moment, and it must already find
        // every child re-parented.
        let children = std::mem::take(&mut proc.inner.acquire().children);
        for child in children {
            if let Some(cp) = self.procs.lookup(child) {
                cp.inner.acquire().parent = None;
            }
        }

        let mut inner = proc.inner.acquire();
        assert!(inner.status.is_none(), "{}: exit called twice", caller);
        assert!(
            inner.threads > 0,
            "{}: exit from a process with no attached thread",
            caller
        );
        inner.status = Some(ExitStatus::exited(code));
        // Detach before signalling: a woken waiter must never observe a
        // nonzero thread count.
        inner.threads -= 1;
        proc.exit.signal(&inner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::OPEN_MAX;
    use crate::vfs::{FileSystem, MemoryFs};

    const PATH_ADDR: usize = 0x1000;
    const ARG_ADDR: usize = 0x2000;
    const BUF_ADDR: usize = 0x3000;

    /// Kernel plus one user process with a scratch region mapped and a
    /// user-space copy of `path` staged at PATH_ADDR.
    fn boot_with(path: &str) -> (Arc<Kernel>, Pid, Arc<MemoryFs>) {
        let fs = Arc::new(MemoryFs::new());
        let kernel = Kernel::bootstrap(Arc::clone(&fs) as Arc<dyn crate::vfs::FileSystem>);
        let pid = kernel.create_user_process("test").unwrap().pid();
        kernel.map_user_region(pid, PATH_ADDR, 0x3000).unwrap();
        stage_str(&kernel, pid, PATH_ADDR, path);
        (kernel, pid, fs)
    }

    fn stage_str(kernel: &Kernel, pid: Pid, addr: usize, s: &str) {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        kernel.copy_out_user(pid, addr, &bytes).unwrap();
    }

    fn open(kernel: &Kernel, pid: Pid, path: &str, flags: u32) -> SyscallResult<Fd> {
        stage_str(kernel, pid, PATH_ADDR, path);
        kernel.sys_open(pid, PATH_ADDR, flags, 0)
    }

    fn write_bytes(kernel: &Kernel, pid: Pid, fd: Fd, data: &[u8]) -> SyscallResult<usize> {
        kernel.copy_out_user(pid, BUF_ADDR, data).unwrap();
        kernel.sys_write(pid, fd, BUF_ADDR, data.len())
    }

    fn read_bytes(kernel: &Kernel, pid: Pid, fd: Fd, len: usize) -> SyscallResult<Vec<u8>> {
        let n = kernel.sys_read(pid, fd, BUF_ADDR, len)?;
        kernel.copy_in_user(pid, BUF_ADDR, n)
    }

    // O_WRONLY | O_CREAT and friends, spelled as raw flag words.
    const WRONLY_CREATE: u32 = 1 | 4;
    const RDONLY: u32 = 0;
    const RDWR: u32 = 2;

    #[test]
    fn open_write_close_read_roundtrip() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/notes.txt", WRONLY_CREATE).unwrap();
        assert_eq!(fd, Fd(3));
        assert_eq!(write_bytes(&kernel, pid, fd, b"first line").unwrap(), 10);
        kernel.sys_close(pid, fd).unwrap();

        let fd = open(&kernel, pid, "/notes.txt", RDONLY).unwrap();
        assert_eq!(read_bytes(&kernel, pid, fd, 10).unwrap(), b"first line");
        // Offset advanced; the next read sees end of file.
        assert_eq!(read_bytes(&kernel, pid, fd, 10).unwrap(), b"");
        kernel.sys_close(pid, fd).unwrap();
    }

    #[test]
    fn open_rejects_bad_flag_words() {
        let (kernel, pid, _fs) = boot_with("/f");
        // Access-mode encoding 3.
        assert_eq!(
            kernel.sys_open(pid, PATH_ADDR, 3, 0),
            Err(SyscallError::InvalidArgument)
        );
        // Unknown flag bit.
        assert_eq!(
            kernel.sys_open(pid, PATH_ADDR, 1 << 9, 0),
            Err(SyscallError::InvalidArgument)
        );
    }

    #[test]
    fn open_faults_on_unmapped_path_pointer() {
        let (kernel, pid, _fs) = boot_with("/");
        assert_eq!(
            kernel.sys_open(pid, 0xdddd_0000, RDONLY, 0),
            Err(SyscallError::BadAddress)
        );
    }

    #[test]
    fn open_missing_file_reports_not_found() {
        let (kernel, pid, _fs) = boot_with("/");
        assert_eq!(
            open(&kernel, pid, "/absent", RDONLY),
            Err(SyscallError::NotFound)
        );
    }

    #[test]
    fn append_open_starts_at_end_of_file() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/log", WRONLY_CREATE).unwrap();
        write_bytes(&kernel, pid, fd, b"12345").unwrap();
        kernel.sys_close(pid, fd).unwrap();

        let fd = open(&kernel, pid, "/log", 1 | 32).unwrap();
        write_bytes(&kernel, pid, fd, b"67").unwrap();
        kernel.sys_close(pid, fd).unwrap();

        let fd = open(&kernel, pid, "/log", RDONLY).unwrap();
        assert_eq!(read_bytes(&kernel, pid, fd, 16).unwrap(), b"1234567");
        kernel.sys_close(pid, fd).unwrap();
    }

    #[test]
    fn read_requires_read_mode_and_write_requires_write_mode() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/f", WRONLY_CREATE).unwrap();
        assert_eq!(read_bytes(&kernel, pid, fd, 4), Err(SyscallError::BadFd));
        kernel.sys_close(pid, fd).unwrap();

        let fd = open(&kernel, pid, "/f", RDONLY).unwrap();
        assert_eq!(
            write_bytes(&kernel, pid, fd, b"x"),
            Err(SyscallError::BadFd)
        );
        kernel.sys_close(pid, fd).unwrap();
    }

    #[test]
    fn descriptor_validation_catches_range_and_empty_slots() {
        let (kernel, pid, _fs) = boot_with("/");
        assert_eq!(
            kernel.sys_close(pid, Fd(OPEN_MAX as u32)),
            Err(SyscallError::BadFd)
        );
        assert_eq!(kernel.sys_close(pid, Fd(17)), Err(SyscallError::BadFd));
        assert_eq!(
            kernel.sys_read(pid, Fd(17), BUF_ADDR, 1),
            Err(SyscallError::BadFd)
        );
    }

    #[test]
    fn write_faults_on_unreadable_user_buffer() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/f", WRONLY_CREATE).unwrap();
        assert_eq!(
            kernel.sys_write(pid, fd, 0xeeee_0000, 8),
            Err(SyscallError::BadAddress)
        );
        // The fault left the offset untouched.
        assert_eq!(write_bytes(&kernel, pid, fd, b"ok").unwrap(), 2);
        let h = kernel.proc(pid).unwrap().inner.acquire().files.get(fd).unwrap();
        assert_eq!(kernel.files().get(h).unwrap().state().acquire().offset, 2);
        kernel.sys_close(pid, fd).unwrap();
    }

    #[test]
    fn lseek_set_cur_end_arithmetic() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/f", WRONLY_CREATE).unwrap();
        write_bytes(&kernel, pid, fd, b"0123456789").unwrap();

        assert_eq!(kernel.sys_lseek(pid, fd, 4, 0).unwrap(), 4);
        assert_eq!(kernel.sys_lseek(pid, fd, 3, 1).unwrap(), 7);
        assert_eq!(kernel.sys_lseek(pid, fd, -2, 2).unwrap(), 8);
        // Past end of file is allowed; before the start is not.
        assert_eq!(kernel.sys_lseek(pid, fd, 100, 2).unwrap(), 110);
        assert_eq!(
            kernel.sys_lseek(pid, fd, -1, 0),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_lseek(pid, fd, 0, 7),
            Err(SyscallError::InvalidArgument)
        );
        kernel.sys_close(pid, fd).unwrap();
    }

    #[test]
    fn lseek_on_console_is_an_illegal_seek() {
        let (kernel, pid, _fs) = boot_with("/");
        assert_eq!(
            kernel.sys_lseek(pid, Fd::STDOUT, 0, 0),
            Err(SyscallError::IllegalSeek)
        );
    }

    #[test]
    fn dup2_aliases_share_offset_and_close_once() {
        let (kernel, pid, fs) = boot_with("/");
        let a = open(&kernel, pid, "/shared", 2 | 4).unwrap();
        let b = Fd(9);
        assert_eq!(kernel.sys_dup2(pid, a, b).unwrap(), b);

        write_bytes(&kernel, pid, a, b"abc").unwrap();
        write_bytes(&kernel, pid, b, b"def").unwrap();
        kernel.sys_lseek(pid, a, 0, 0).unwrap();
        assert_eq!(read_bytes(&kernel, pid, b, 6).unwrap(), b"abcdef");

        kernel.sys_close(pid, a).unwrap();
        // Still usable through the alias.
        kernel.sys_lseek(pid, b, 0, 0).unwrap();
        assert_eq!(read_bytes(&kernel, pid, b, 3).unwrap(), b"abc");
        kernel.sys_close(pid, b).unwrap();

        // Underlying node closed exactly once: opens minus closes is zero.
        assert_eq!(fs.open_handles("/shared"), Some(0));
    }

    #[test]
    fn dup2_onto_itself_is_a_no_op() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/f", WRONLY_CREATE).unwrap();
        let handle = kernel.proc(pid).unwrap().inner.acquire().files.get(fd).unwrap();
        assert_eq!(kernel.sys_dup2(pid, fd, fd).unwrap(), fd);
        assert_eq!(kernel.files().get(handle).unwrap().ref_count(), 1);
        kernel.sys_close(pid, fd).unwrap();
    }

    #[test]
    fn dup2_closes_what_newfd_held() {
        let (kernel, pid, fs) = boot_with("/");
        let a = open(&kernel, pid, "/a", WRONLY_CREATE).unwrap();
        let b = open(&kernel, pid, "/b", WRONLY_CREATE).unwrap();

        kernel.sys_dup2(pid, a, b).unwrap();
        assert_eq!(fs.open_handles("/b"), Some(0));
        let handle = kernel.proc(pid).unwrap().inner.acquire().files.get(a).unwrap();
        assert_eq!(kernel.files().get(handle).unwrap().ref_count(), 2);

        kernel.sys_close(pid, a).unwrap();
        kernel.sys_close(pid, b).unwrap();
        assert_eq!(fs.open_handles("/a"), Some(0));
    }

    #[test]
    fn dup2_validates_both_descriptors() {
        let (kernel, pid, _fs) = boot_with("/");
        assert_eq!(
            kernel.sys_dup2(pid, Fd(40), Fd(5)),
            Err(SyscallError::BadFd)
        );
        assert_eq!(
            kernel.sys_dup2(pid, Fd::STDOUT, Fd(OPEN_MAX as u32)),
            Err(SyscallError::BadFd)
        );
    }

    #[test]
    fn chdir_and_getcwd_roundtrip() {
        let (kernel, pid, fs) = boot_with("/");
        fs.create_dir("/home").unwrap();
        stage_str(&kernel, pid, PATH_ADDR, "/home");
        kernel.sys_chdir(pid, PATH_ADDR).unwrap();

        let n = kernel.sys_getcwd(pid, BUF_ADDR, 64).unwrap();
        assert_eq!(kernel.copy_in_user(pid, BUF_ADDR, n).unwrap(), b"/home");

        // Relative paths now resolve under /home.
        let fd = open(&kernel, pid, "notes", WRONLY_CREATE).unwrap();
        kernel.sys_close(pid, fd).unwrap();
        assert!(fs.metadata("/home/notes").unwrap().is_file);
    }

    #[test]
    fn chdir_to_a_file_is_rejected() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/plain", WRONLY_CREATE).unwrap();
        kernel.sys_close(pid, fd).unwrap();
        stage_str(&kernel, pid, PATH_ADDR, "/plain");
        assert_eq!(
            kernel.sys_chdir(pid, PATH_ADDR),
            Err(SyscallError::NotADirectory)
        );
    }

    #[test]
    fn remove_is_a_validated_no_op() {
        let (kernel, pid, fs) = boot_with("/");
        let fd = open(&kernel, pid, "/keepme", WRONLY_CREATE).unwrap();
        kernel.sys_close(pid, fd).unwrap();

        stage_str(&kernel, pid, PATH_ADDR, "/keepme");
        kernel.sys_remove(pid, PATH_ADDR).unwrap();
        // Success without effect.
        assert!(fs.metadata("/keepme").unwrap().is_file);
        assert_eq!(
            kernel.sys_remove(pid, 0xffff_0000),
            Err(SyscallError::BadAddress)
        );
    }

    #[test]
    fn getpid_returns_the_caller() {
        let (kernel, pid, _fs) = boot_with("/");
        assert_eq!(kernel.sys_getpid(pid).unwrap(), pid);
        assert_eq!(
            kernel.sys_getpid(Pid(55)),
            Err(SyscallError::NoProcess)
        );
    }

    #[test]
    fn waitpid_rejects_self_nonchild_and_bad_options() {
        let (kernel, pid, _fs) = boot_with("/");
        assert_eq!(
            kernel.sys_waitpid(pid, pid, 0),
            Err(SyscallError::NotChild)
        );

        let other = kernel.create_user_process("other").unwrap().pid();
        assert_eq!(
            kernel.sys_waitpid(pid, other, 0),
            Err(SyscallError::NotChild)
        );
        assert_eq!(
            kernel.sys_waitpid(pid, other, 0x80),
            Err(SyscallError::InvalidArgument)
        );
        assert_eq!(
            kernel.sys_waitpid(pid, Pid(77), 0),
            Err(SyscallError::NoProcess)
        );
        kernel.destroy_process(other);
    }

    #[test]
    fn execv_failures_leave_the_old_image_intact() {
        let (kernel, pid, fs) = boot_with("/");
        // Stage a marker in the current image.
        kernel.copy_out_user(pid, BUF_ADDR, b"still here").unwrap();

        // Missing image.
        stage_str(&kernel, pid, PATH_ADDR, "/bin/absent");
        kernel.copy_out_user(pid, ARG_ADDR, &0usize.to_le_bytes()).unwrap();
        assert_eq!(
            kernel.sys_execv(pid, PATH_ADDR, ARG_ADDR),
            Err(SyscallError::NotFound)
        );

        // Empty image.
        fs.create_dir("/bin").unwrap();
        let fd = open(&kernel, pid, "/bin/empty", WRONLY_CREATE).unwrap();
        kernel.sys_close(pid, fd).unwrap();
        stage_str(&kernel, pid, PATH_ADDR, "/bin/empty");
        assert_eq!(
            kernel.sys_execv(pid, PATH_ADDR, ARG_ADDR),
            Err(SyscallError::NotExecutable)
        );

        // The old address space survived both failures.
        assert_eq!(
            kernel.copy_in_user(pid, BUF_ADDR, 10).unwrap(),
            b"still here"
        );
    }

    #[test]
    fn tracer_counts_syscalls_when_enabled() {
        let (kernel, pid, _fs) = boot_with("/");
        kernel.trace_enable();
        let fd = open(&kernel, pid, "/t", WRONLY_CREATE).unwrap();
        kernel.sys_close(pid, fd).unwrap();
        let _ = kernel.sys_close(pid, Fd(90));

        let summary = kernel.trace_summary();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_errors, 1);
        let close = summary
            .by_call
            .iter()
            .find(|(n, _)| *n == "close")
            .unwrap()
            .1;
        assert_eq!(close.calls, 2);
        assert_eq!(close.errors, 1);
    }

    #[test]
    fn fork_and_exit_publish_status_to_waitpid() {
        let (kernel, pid, _fs) = boot_with("/");
        let child = kernel
            .sys_fork(pid, |k, me| {
                k.sys_exit(me, 42).unwrap();
            })
            .unwrap();

        let (reaped, status) = kernel.sys_waitpid(pid, child, 0).unwrap().unwrap();
        assert_eq!(reaped, child);
        assert_eq!(status.code(), 42);
        // The child is gone from the table.
        assert!(!kernel.procs().contains(child));
        assert!(kernel
            .proc(pid)
            .unwrap()
            .inner
            .acquire()
            .children
            .is_empty());
    }

    #[test]
    fn waitpid_nohang_reports_nothing_until_exit() {
        let (kernel, pid, _fs) = boot_with("/");
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let child = kernel
            .sys_fork(pid, move |k, me| {
                rx.recv().unwrap();
                k.sys_exit(me, 7).unwrap();
            })
            .unwrap();

        assert_eq!(
            kernel.sys_waitpid(pid, child, WaitOptions::NOHANG.bits()),
            Ok(None)
        );
        tx.send(()).unwrap();
        // Blocking wait still works after a NOHANG poll.
        let (_, status) = kernel.sys_waitpid(pid, child, 0).unwrap().unwrap();
        assert_eq!(status.code(), 7);
    }

    #[test]
    fn fork_shares_open_file_objects_with_the_child() {
        let (kernel, pid, _fs) = boot_with("/");
        let fd = open(&kernel, pid, "/shared", 2 | 4).unwrap();
        let handle = kernel.proc(pid).unwrap().inner.acquire().files.get(fd).unwrap();

        let child = kernel
            .sys_fork(pid, move |k, me| {
                // Same handle, same object, same offset.
                let mine = k.proc(me).unwrap().inner.acquire().files.get(fd).unwrap();
                assert_eq!(mine, handle);
                k.sys_exit(me, 0).unwrap();
            })
            .unwrap();

        kernel.sys_waitpid(pid, child, 0).unwrap();
        // Child's reference went away when it was reaped.
        assert_eq!(kernel.files().get(handle).unwrap().ref_count(), 1);
        kernel.sys_close(pid, fd).unwrap();
    }
}
