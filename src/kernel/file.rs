//! Open-file objects and the system-wide open-file pool
//!
//! An [`OpenFile`] is the state shared by every descriptor that refers to
//! the same underlying open — across dup2 and across fork. The seek offset
//! and the reference count live together under the object's own lock, so
//! aliased descriptors always observe a serialized view and the vnode is
//! closed exactly once, on the 1 -> 0 reference transition.

use super::process::OPEN_MAX;
use super::sync::Lock;
use crate::klog;
use crate::vfs::Vnode;
use bitflags::bitflags;
use slab::Slab;
use std::sync::Arc;

/// Bound on simultaneously open file objects across all processes.
pub const SYSTEM_OPEN_MAX: usize = 10 * OPEN_MAX;

/// Low two bits of an open flag word encode the access mode.
pub const O_ACCMODE: u32 = 3;

bitflags! {
    /// Flag bits of an open(2)-style flag word (the access mode lives in
    /// the low two bits and is not a flag).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const CREATE = 4;
        const EXCL = 8;
        const TRUNC = 16;
        const APPEND = 32;
    }
}

/// How a descriptor may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    /// Decode the low-bits encoding; `3` is not a mode.
    pub fn from_raw(raw: u32) -> Option<AccessMode> {
        match raw & O_ACCMODE {
            0 => Some(AccessMode::ReadOnly),
            1 => Some(AccessMode::WriteOnly),
            2 => Some(AccessMode::ReadWrite),
            _ => None,
        }
    }

    pub fn readable(self) -> bool {
        self != AccessMode::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != AccessMode::ReadOnly
    }
}

/// Split a raw flag word into access mode and flags. `None` when the mode
/// encoding or any unknown bit makes the word invalid.
pub fn parse_open_flags(raw: u32) -> Option<(AccessMode, OpenFlags)> {
    let mode = AccessMode::from_raw(raw)?;
    let flags = OpenFlags::from_bits(raw & !O_ACCMODE)?;
    Some((mode, flags))
}

/// Index into the [`FilePool`]. What a descriptor slot actually stores.
pub type FileHandle = usize;

/// The lock-guarded part of an open file: seek position and reference
/// count, mutated only together under the object's lock.
pub struct FileState {
    pub offset: u64,
    refs: u32,
}

/// One underlying opened file or device.
pub struct OpenFile {
    vnode: Arc<dyn Vnode>,
    mode: AccessMode,
    state: Lock<FileState>,
}

impl OpenFile {
    pub fn new(name: &str, vnode: Arc<dyn Vnode>, mode: AccessMode, offset: u64) -> Self {
        Self {
            vnode,
            mode,
            state: Lock::new(name.to_string(), FileState { offset, refs: 1 }),
        }
    }

    pub fn vnode(&self) -> &Arc<dyn Vnode> {
        &self.vnode
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn state(&self) -> &Lock<FileState> {
        &self.state
    }

    pub fn ref_count(&self) -> u32 {
        self.state.acquire().refs
    }
}

/// Global bounded pool of open-file objects. Descriptor tables store
/// handles into it; the pool hands out `Arc`s so I/O never runs under the
/// pool's own lock.
pub struct FilePool {
    slots: spin::Mutex<Slab<Arc<OpenFile>>>,
}

impl FilePool {
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new(Slab::new()),
        }
    }

    /// Add a freshly opened file (reference count 1). Gives the file back
    /// when the pool is full.
    pub fn insert(&self, file: OpenFile) -> Result<FileHandle, OpenFile> {
        let mut slots = self.slots.lock();
        if slots.len() >= SYSTEM_OPEN_MAX {
            return Err(file);
        }
        Ok(slots.insert(Arc::new(file)))
    }

    pub fn get(&self, handle: FileHandle) -> Option<Arc<OpenFile>> {
        self.slots.lock().get(handle).cloned()
    }

    /// Add one reference (dup2, fork-time table copy). Returns false for a
    /// dead handle.
    pub fn retain(&self, handle: FileHandle) -> bool {
        let Some(file) = self.get(handle) else {
            return false;
        };
        file.state.acquire().refs += 1;
        true
    }

    /// Drop one reference. On the last one the vnode is closed and the
    /// slot freed for reuse.
    pub fn release(&self, handle: FileHandle) {
        let Some(file) = self.get(handle) else {
            klog!("[kernel] release of unknown file handle {}", handle);
            return;
        };
        let mut st = file.state.acquire();
        assert!(
            st.refs > 0,
            "open file '{}': reference count underflow",
            file.state.name()
        );
        st.refs -= 1;
        let last = st.refs == 0;
        drop(st);
        if last {
            // No descriptor can reach the handle anymore; close once and
            // free the slot.
            file.vnode.close();
            self.slots.lock().remove(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl Default for FilePool {
    fn default() -> Self {
        Self::new()
    }
}
