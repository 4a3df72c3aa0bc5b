//! Program image loading and argument layout
//!
//! The loader consumes a flat image: the file's bytes are mapped at
//! [`USER_CODE_BASE`] and the entry point is the base of the mapping.
//! Argument strings are laid out on the new user stack the traditional
//! way: each string copied and padded to word alignment, then a pointer
//! vector with a terminating null, with the stack pointer left just below.

use super::memory::{AddressSpace, MemoryError, USER_CODE_BASE, WORD_SIZE};
use crate::vfs::Vnode;
use std::io;
use std::sync::Arc;

/// Upper bound on the combined size of execv argument strings.
pub const ARG_MAX: usize = 65536;

/// Upper bound on a loadable image.
pub const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum LoadError {
    /// Zero-byte file: nothing to run
    EmptyImage,
    ImageTooLarge,
    Io(String),
    Memory(MemoryError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyImage => write!(f, "empty program image"),
            Self::ImageTooLarge => write!(f, "program image too large"),
            Self::Io(msg) => write!(f, "I/O error loading image: {}", msg),
            Self::Memory(e) => write!(f, "memory error loading image: {}", e),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        LoadError::Io(e.to_string())
    }
}

impl From<MemoryError> for LoadError {
    fn from(e: MemoryError) -> Self {
        LoadError::Memory(e)
    }
}

/// Read the whole node and map it at [`USER_CODE_BASE`] in `space`.
/// Returns the entry point.
pub fn load_image(vnode: &Arc<dyn Vnode>, space: &mut AddressSpace) -> Result<usize, LoadError> {
    let size = vnode.size()? as usize;
    if size == 0 {
        return Err(LoadError::EmptyImage);
    }
    if size > MAX_IMAGE_BYTES {
        return Err(LoadError::ImageTooLarge);
    }

    let mut image = vec![0u8; size];
    let mut read = 0;
    while read < size {
        let n = vnode.read_at(&mut image[read..], read as u64)?;
        if n == 0 {
            break;
        }
        read += n;
    }
    image.truncate(read);
    if image.is_empty() {
        return Err(LoadError::EmptyImage);
    }

    space.define_region(USER_CODE_BASE, image.len(), true)?;
    space.copy_out(USER_CODE_BASE, &image)?;
    Ok(USER_CODE_BASE)
}

/// Copy `args` onto the stack below `sp`.
///
/// Layout, high to low: the strings (each NUL-terminated and padded to
/// `WORD_SIZE`), then the argv pointer vector ending in a null entry. The
/// returned stack pointer doubles as the argv address.
pub fn build_arg_stack(
    space: &mut AddressSpace,
    sp: usize,
    args: &[String],
) -> Result<(usize, usize), MemoryError> {
    let padded: Vec<usize> = args
        .iter()
        .map(|a| (a.len() + 1).next_multiple_of(WORD_SIZE))
        .collect();
    let strings_bytes: usize = padded.iter().sum();
    let vector_bytes = (args.len() + 1) * WORD_SIZE;

    let strings_base = sp
        .checked_sub(strings_bytes)
        .ok_or(MemoryError::TooLong)?;
    let new_sp = strings_base
        .checked_sub(vector_bytes)
        .ok_or(MemoryError::TooLong)?;

    let mut cursor = strings_base;
    let mut pointers = Vec::with_capacity(args.len());
    for (arg, pad) in args.iter().zip(&padded) {
        let mut bytes = arg.as_bytes().to_vec();
        bytes.resize(*pad, 0);
        space.copy_out(cursor, &bytes)?;
        pointers.push(cursor);
        cursor += pad;
    }
    for (i, p) in pointers.iter().enumerate() {
        space.write_word(new_sp + i * WORD_SIZE, *p)?;
    }
    space.write_word(new_sp + args.len() * WORD_SIZE, 0)?;

    Ok((new_sp, new_sp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::memory::USER_STACK_TOP;
    use crate::vfs::{FileSystem, MemoryFs, OpenOptions};

    #[test]
    fn load_maps_file_bytes_at_code_base() {
        let fs = MemoryFs::new();
        let node = fs
            .open("/bin/true", OpenOptions::new().write(true).create(true))
            .unwrap();
        node.write_at(b"\x7fIMG fake program text", 0).unwrap();

        let mut space = AddressSpace::new();
        let entry = load_image(&node, &mut space).unwrap();
        assert_eq!(entry, USER_CODE_BASE);

        let mut buf = [0u8; 7];
        space.copy_in(USER_CODE_BASE, &mut buf).unwrap();
        assert_eq!(&buf, b"\x7fIMG fa");
        node.close();
    }

    #[test]
    fn empty_image_is_rejected() {
        let fs = MemoryFs::new();
        let node = fs
            .open("/bin/empty", OpenOptions::new().write(true).create(true))
            .unwrap();
        let mut space = AddressSpace::new();
        assert!(matches!(
            load_image(&node, &mut space),
            Err(LoadError::EmptyImage)
        ));
        assert_eq!(space.region_count(), 0);
        node.close();
    }

    #[test]
    fn arg_stack_layout_is_aligned_and_null_terminated() {
        let mut space = AddressSpace::new();
        let sp = space.define_stack().unwrap();
        let args = vec!["prog".to_string(), "-a".to_string(), "xyzzy".to_string()];

        let (sp, argv) = build_arg_stack(&mut space, sp, &args).unwrap();
        assert_eq!(sp, argv);
        assert_eq!(sp % WORD_SIZE, 0);
        assert!(sp < USER_STACK_TOP);

        // Three pointers then the terminating null.
        let p0 = space.read_word(argv).unwrap();
        let p1 = space.read_word(argv + WORD_SIZE).unwrap();
        let p2 = space.read_word(argv + 2 * WORD_SIZE).unwrap();
        assert_eq!(space.read_word(argv + 3 * WORD_SIZE).unwrap(), 0);

        assert_eq!(p0 % WORD_SIZE, 0);
        assert_eq!(p1 % WORD_SIZE, 0);
        assert_eq!(space.copy_in_str(p0, 64).unwrap(), "prog");
        assert_eq!(space.copy_in_str(p1, 64).unwrap(), "-a");
        assert_eq!(space.copy_in_str(p2, 64).unwrap(), "xyzzy");
    }

    #[test]
    fn empty_argv_still_gets_a_null_terminator() {
        let mut space = AddressSpace::new();
        let sp = space.define_stack().unwrap();
        let (sp, argv) = build_arg_stack(&mut space, sp, &[]).unwrap();
        assert_eq!(space.read_word(argv).unwrap(), 0);
        assert_eq!(sp, argv);
    }

    #[test]
    fn oversized_args_fault_instead_of_wrapping() {
        let mut space = AddressSpace::new();
        // Tiny stack: sp far below the args we ask for.
        let args = vec!["x".repeat(200_000)];
        assert!(build_arg_stack(&mut space, 64, &args).is_err());
    }
}
