//! In-memory filesystem implementation
//!
//! Simple, fast, ephemeral. Files are byte vectors behind their own mutex;
//! the console device lives at [`CONSOLE_PATH`](super::CONSOLE_PATH) and
//! blocks readers on a semaphore until input arrives.

use super::{FileSystem, Metadata, OpenOptions, Vnode, CONSOLE_PATH};
use crate::kernel::sync::Semaphore;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A regular file's shared storage.
///
/// Handed to the kernel as a `Vnode`; `open_handles` counts opens minus
/// closes, so a double close drives it negative and tests can catch it.
pub struct FileNode {
    path: String,
    data: Mutex<Vec<u8>>,
    open_handles: AtomicI64,
}

impl FileNode {
    fn new(path: String) -> Self {
        Self {
            path,
            data: Mutex::new(Vec::new()),
            open_handles: AtomicI64::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Vnode for FileNode {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock().expect("file node poisoned");
        let position = offset as usize;
        let available = data.len().saturating_sub(position);
        let to_read = buf.len().min(available);
        buf[..to_read].copy_from_slice(&data[position..position + to_read]);
        Ok(to_read)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.data.lock().expect("file node poisoned");
        let position = offset as usize;
        if position + buf.len() > data.len() {
            data.resize(position + buf.len(), 0);
        }
        data[position..position + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.lock().expect("file node poisoned").len() as u64)
    }

    fn close(&self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The console device: a blocking input queue and an inspectable output
/// buffer. One instance is shared by every descriptor opened on `con:`.
pub struct ConsoleDevice {
    input: Mutex<VecDeque<u8>>,
    /// Counts the bytes queued in `input`; readers sleep here.
    available: Semaphore,
    output: Mutex<Vec<u8>>,
}

impl ConsoleDevice {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(VecDeque::new()),
            available: Semaphore::new("console input", 0),
            output: Mutex::new(Vec::new()),
        }
    }

    /// Feed bytes to the input side, waking blocked readers.
    pub fn push_input(&self, bytes: &[u8]) {
        let mut input = self.input.lock().expect("console poisoned");
        for &b in bytes {
            input.push_back(b);
        }
        drop(input);
        for _ in 0..bytes.len() {
            self.available.up();
        }
    }

    /// Drain and return everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.output.lock().expect("console poisoned"))
    }

    pub fn pending_input(&self) -> usize {
        self.input.lock().expect("console poisoned").len()
    }
}

impl Default for ConsoleDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Vnode for ConsoleDevice {
    fn read_at(&self, buf: &mut [u8], _offset: u64) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Block for the first byte, then take whatever else is queued.
        self.available.down();
        let mut n = 1;
        while n < buf.len() && self.available.try_down() {
            n += 1;
        }
        let mut input = self.input.lock().expect("console poisoned");
        for slot in buf[..n].iter_mut() {
            *slot = input.pop_front().expect("console count out of sync");
        }
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], _offset: u64) -> io::Result<usize> {
        self.output
            .lock()
            .expect("console poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "console has no size",
        ))
    }

    fn seekable(&self) -> bool {
        false
    }
}

/// A stored file or directory
enum Node {
    File(Arc<FileNode>),
    Directory,
}

/// In-memory filesystem
pub struct MemoryFs {
    /// All files and directories, keyed by normalized path
    nodes: Mutex<HashMap<String, Node>>,
    console: Arc<ConsoleDevice>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let fs = Self {
            nodes: Mutex::new(HashMap::new()),
            console: Arc::new(ConsoleDevice::new()),
        };
        // Root directory always exists
        fs.nodes
            .lock()
            .expect("fs poisoned")
            .insert("/".to_string(), Node::Directory);
        fs
    }

    pub fn console(&self) -> &Arc<ConsoleDevice> {
        &self.console
    }

    /// Opens minus closes for a file, for auditing close-exactly-once.
    pub fn open_handles(&self, path: &str) -> Option<i64> {
        let path = Self::normalize_path(path);
        match self.nodes.lock().expect("fs poisoned").get(&path) {
            Some(Node::File(node)) => Some(node.open_handles.load(Ordering::SeqCst)),
            _ => None,
        }
    }

    /// Normalize a path (ensure leading slash, no trailing slash except root)
    fn normalize_path(path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        if path.len() > 1 && path.ends_with('/') {
            path[..path.len() - 1].to_string()
        } else {
            path
        }
    }

    /// Get parent directory of a path
    fn parent_path(path: &str) -> Option<String> {
        if path == "/" {
            return None;
        }
        let idx = path.rfind('/')?;
        if idx == 0 {
            Some("/".to_string())
        } else {
            Some(path[..idx].to_string())
        }
    }

    fn ensure_parent(nodes: &HashMap<String, Node>, path: &str) -> io::Result<()> {
        if let Some(parent) = Self::parent_path(path) {
            match nodes.get(&parent) {
                Some(Node::Directory) => {}
                Some(Node::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("Not a directory: {}", parent),
                    ));
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Parent directory not found: {}", parent),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFs {
    fn open(&self, path: &str, options: OpenOptions) -> io::Result<Arc<dyn Vnode>> {
        // Device namespace first: the console is not a stored node.
        if path == CONSOLE_PATH {
            return Ok(Arc::clone(&self.console) as Arc<dyn Vnode>);
        }

        let path = Self::normalize_path(path);
        let mut nodes = self.nodes.lock().expect("fs poisoned");

        let exists = nodes.contains_key(&path);
        if exists && options.create_new {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("File exists: {}", path),
            ));
        }
        if !exists {
            if !options.create && !options.create_new {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("File not found: {}", path),
                ));
            }
            Self::ensure_parent(&nodes, &path)?;
            nodes.insert(path.clone(), Node::File(Arc::new(FileNode::new(path.clone()))));
        }

        let node = match nodes.get(&path) {
            Some(Node::File(node)) => Arc::clone(node),
            Some(Node::Directory) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Cannot open directory as file",
                ));
            }
            None => unreachable!("just inserted"),
        };
        drop(nodes);

        if options.truncate {
            node.data.lock().expect("file node poisoned").clear();
        }
        node.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(node as Arc<dyn Vnode>)
    }

    fn metadata(&self, path: &str) -> io::Result<Metadata> {
        if path == CONSOLE_PATH {
            return Ok(Metadata {
                size: 0,
                is_dir: false,
                is_file: false,
            });
        }
        let path = Self::normalize_path(path);
        match self.nodes.lock().expect("fs poisoned").get(&path) {
            Some(Node::File(node)) => Ok(Metadata {
                size: node.data.lock().expect("file node poisoned").len() as u64,
                is_dir: false,
                is_file: true,
            }),
            Some(Node::Directory) => Ok(Metadata {
                size: 0,
                is_dir: true,
                is_file: false,
            }),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Not found: {}", path),
            )),
        }
    }

    fn create_dir(&self, path: &str) -> io::Result<()> {
        let path = Self::normalize_path(path);
        let mut nodes = self.nodes.lock().expect("fs poisoned");
        if nodes.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Already exists: {}", path),
            ));
        }
        Self::ensure_parent(&nodes, &path)?;
        nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        let path = Self::normalize_path(path);
        let mut nodes = self.nodes.lock().expect("fs poisoned");
        match nodes.get(&path) {
            Some(Node::File(_)) => {
                nodes.remove(&path);
                Ok(())
            }
            Some(Node::Directory) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Is a directory",
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Not found: {}", path),
            )),
        }
    }
}
