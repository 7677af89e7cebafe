//! File primitives used alongside a context.
//!
//! Thin wrappers over the OS calls a journal needs around its asynchronous
//! reads and writes: opening with `O_DIRECT`, querying sizes, advisory
//! locking, preallocation and zero-filling.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;

use crate::environment::{Environment, ZERO_BLOCK_LEN};
use crate::error::{AioError, Result};

/// Open `path` read-write, creating it with mode `0666` if missing.
///
/// With `direct` the file is opened with `O_DIRECT`, so every transfer must
/// use aligned buffers, lengths and offsets.
pub fn open<P: AsRef<Path>>(path: P, direct: bool) -> Result<File> {
    let path = path.as_ref();
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).mode(0o666);
    if direct {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path).map_err(|e| {
        crate::aio_debug!("file", "open {} failed: {}", path.display(), e);
        AioError::os(e.raw_os_error().unwrap_or(libc::EIO), "Cannot open file")
    })
}

/// Close `file`, reporting the error `close(2)` returns.
pub fn close(file: File) -> Result<()> {
    let fd = file.into_raw_fd();
    // SAFETY: `fd` was just released from an owning `File`.
    if unsafe { libc::close(fd) } < 0 {
        return Err(AioError::last_os_error("Error closing file"));
    }
    Ok(())
}

fn fstat(fd: RawFd) -> Result<libc::stat> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `stat` is a valid out-pointer.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } < 0 {
        return Err(AioError::last_os_error("Cannot determine file size"));
    }
    // SAFETY: fstat succeeded and filled the struct.
    Ok(unsafe { stat.assume_init() })
}

/// Current size of the file in bytes.
pub fn size(fd: RawFd) -> Result<u64> {
    Ok(fstat(fd)?.st_size as u64)
}

/// Preferred I/O block size of an open file.
pub fn block_size(fd: RawFd) -> Result<usize> {
    Ok(fstat(fd)?.st_blksize as usize)
}

/// Preferred I/O block size of the file or directory at `path`.
pub fn block_size_path<P: AsRef<Path>>(path: P) -> Result<usize> {
    let c_path = CString::new(path.as_ref().as_os_str().as_bytes())
        .map_err(|_| AioError::InvalidArgument("path contains a NUL byte".to_string()))?;
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: NUL-terminated path and a valid out-pointer.
    if unsafe { libc::stat(c_path.as_ptr(), stat.as_mut_ptr()) } < 0 {
        return Err(AioError::last_os_error("Cannot determine file size"));
    }
    // SAFETY: stat succeeded.
    Ok(unsafe { stat.assume_init() }.st_blksize as usize)
}

/// Try to take a non-blocking exclusive advisory lock.
///
/// Returns `false` if another open file description holds it.
pub fn lock(fd: RawFd) -> bool {
    // SAFETY: flock has no memory-safety preconditions.
    unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

fn rewind(fd: RawFd) -> Result<()> {
    // SAFETY: lseek has no memory-safety preconditions.
    if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } < 0 {
        return Err(AioError::last_os_error("Cannot rewind file"));
    }
    Ok(())
}

/// Reserve `size` bytes of disk for the file, sync it, and rewind.
pub fn preallocate(fd: RawFd, size: u64) -> Result<()> {
    let len = libc::off_t::try_from(size)
        .map_err(|_| AioError::InvalidArgument(format!("size {size} too large")))?;
    // SAFETY: fallocate has no memory-safety preconditions.
    if unsafe { libc::fallocate(fd, 0, 0, len) } < 0 {
        return Err(AioError::last_os_error("Could not preallocate file"));
    }
    // SAFETY: as above.
    if unsafe { libc::fsync(fd) } < 0 {
        crate::aio_warn!("file", "fsync after preallocate failed on fd {}", fd);
    }
    rewind(fd)
}

fn write_fully(fd: RawFd, mut data: &[u8], context: &'static str) -> Result<()> {
    while !data.is_empty() {
        // SAFETY: `data` is valid for `data.len()` bytes.
        let ret = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(AioError::os(err.raw_os_error().unwrap_or(libc::EIO), context));
        }
        if ret == 0 {
            return Err(AioError::os(libc::EIO, context));
        }
        data = &data[ret as usize..];
    }
    Ok(())
}

/// Write `size` zero bytes from the start of the file, then rewind.
///
/// Uses the environment's shared 1 MiB zero block, aligned to `alignment`.
pub fn fill_with_zeroes(env: &Environment, fd: RawFd, alignment: usize, size: u64) -> Result<()> {
    fill_with_zeroes_in_chunks(env, fd, alignment, size, ZERO_BLOCK_LEN)
}

/// [`fill_with_zeroes`] writing at most `chunk` bytes per call.
pub fn fill_with_zeroes_in_chunks(
    env: &Environment,
    fd: RawFd,
    alignment: usize,
    size: u64,
    chunk: usize,
) -> Result<()> {
    if chunk == 0 || chunk > ZERO_BLOCK_LEN {
        return Err(AioError::InvalidArgument(format!(
            "fill chunk {chunk} must be between 1 and {ZERO_BLOCK_LEN}"
        )));
    }

    let guard = env.zero_block(alignment)?;
    let zeroes = guard
        .as_ref()
        .ok_or(AioError::OutOfMemory { size: ZERO_BLOCK_LEN })?
        .as_slice();

    let blocks = size / chunk as u64;
    let rest = (size % chunk as u64) as usize;
    crate::aio_debug!(
        "file",
        "fill fd {}: blocks={}, rest={}, alignment={}",
        fd,
        blocks,
        rest,
        alignment
    );

    rewind(fd)?;
    for _ in 0..blocks {
        write_fully(fd, &zeroes[..chunk], "Cannot initialize file")?;
    }
    if rest != 0 {
        write_fully(fd, &zeroes[..rest], "Cannot initialize file with final rest")?;
    }
    rewind(fd)
}
