//! Kernel AIO ABI mirrors.
//!
//! `libc` exposes the AIO syscall numbers but not the structures those
//! syscalls exchange, so they are reproduced here from `linux/aio_abi.h` and
//! `fs/aio.c`. Layouts are checked at compile time.

use std::mem;
use std::sync::atomic::AtomicU32;

/// Opcode for a positional read.
pub const IOCB_CMD_PREAD: u16 = 0;
/// Opcode for a positional write.
pub const IOCB_CMD_PWRITE: u16 = 1;

/// Magic value the kernel stores in a usable completion ring header.
pub const AIO_RING_MAGIC: u32 = 0xa10a_10a1;
/// Incompatible-feature bits this reader understands.
pub const AIO_RING_INCOMPAT_FEATURES: u32 = 0;

/// Kernel AIO context handle, as returned by `io_setup`.
///
/// On Linux the handle is the user-space address of the completion ring.
pub type AioContextId = libc::c_ulong;

/// Kernel I/O control block (`struct iocb`).
///
/// Field order matches little-endian targets, where `aio_key` precedes
/// `aio_rw_flags`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Iocb {
    /// Returned verbatim in [`IoEvent::data`]
    pub aio_data: u64,
    /// Kernel-owned key
    pub aio_key: u32,
    /// Per-request `RWF_*` flags
    pub aio_rw_flags: u32,
    /// One of the `IOCB_CMD_*` opcodes
    pub aio_lio_opcode: u16,
    /// Request priority
    pub aio_reqprio: i16,
    /// Target file descriptor
    pub aio_fildes: u32,
    /// Buffer address
    pub aio_buf: u64,
    /// Transfer length in bytes
    pub aio_nbytes: u64,
    /// File offset
    pub aio_offset: i64,
    /// Reserved, must be zero
    pub aio_reserved2: u64,
    /// `IOCB_FLAG_*` bits
    pub aio_flags: u32,
    /// Eventfd to signal on completion when `IOCB_FLAG_RESFD` is set
    pub aio_resfd: u32,
}

impl Iocb {
    /// Prepare a positional read, clearing any previous request state.
    pub fn prep_pread(&mut self, fd: i32, buf: *mut u8, len: usize, offset: u64) {
        self.prep(IOCB_CMD_PREAD, fd, buf as u64, len, offset);
    }

    /// Prepare a positional write, clearing any previous request state.
    pub fn prep_pwrite(&mut self, fd: i32, buf: *const u8, len: usize, offset: u64) {
        self.prep(IOCB_CMD_PWRITE, fd, buf as u64, len, offset);
    }

    fn prep(&mut self, opcode: u16, fd: i32, buf: u64, len: usize, offset: u64) {
        let data = self.aio_data;
        *self = Iocb {
            aio_data: data,
            aio_lio_opcode: opcode,
            aio_fildes: fd as u32,
            aio_buf: buf,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            ..Iocb::default()
        };
    }

    /// File descriptor this block targets.
    pub fn fd(&self) -> i32 {
        self.aio_fildes as i32
    }
}

/// Completion record (`struct io_event`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    /// Copy of [`Iocb::aio_data`]
    pub data: u64,
    /// Address of the completed [`Iocb`]
    pub obj: u64,
    /// Bytes transferred, or `-errno`
    pub res: i64,
    /// Secondary result, unused for reads and writes
    pub res2: i64,
}

/// Header of the kernel-maintained completion ring (`struct aio_ring`).
///
/// `head` is advanced only by the user-space reader and `tail` only by the
/// kernel, so both are atomics. The remaining fields are written once at
/// setup. The event array follows the header immediately.
#[repr(C)]
#[derive(Debug)]
pub struct RingHeader {
    /// Kernel internal index number
    pub id: u32,
    /// Number of event slots in the ring
    pub nr: u32,
    /// Next slot the reader will consume
    pub head: AtomicU32,
    /// Next slot the kernel will fill
    pub tail: AtomicU32,
    /// [`AIO_RING_MAGIC`] when the layout is the one described here
    pub magic: u32,
    /// Compatible feature bits
    pub compat_features: u32,
    /// Incompatible feature bits, must equal [`AIO_RING_INCOMPAT_FEATURES`]
    pub incompat_features: u32,
    /// Size of this header in bytes
    pub header_length: u32,
}

/// Size of [`RingHeader`] as the kernel lays it out.
pub const RING_HEADER_LEN: usize = 32;

static_assertions::const_assert_eq!(mem::size_of::<Iocb>(), 64);
static_assertions::const_assert_eq!(mem::size_of::<IoEvent>(), 32);
static_assertions::const_assert_eq!(mem::size_of::<RingHeader>(), RING_HEADER_LEN);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn iocb_field_offsets() {
        assert_eq!(offset_of!(Iocb, aio_data), 0);
        assert_eq!(offset_of!(Iocb, aio_lio_opcode), 16);
        assert_eq!(offset_of!(Iocb, aio_fildes), 20);
        assert_eq!(offset_of!(Iocb, aio_buf), 24);
        assert_eq!(offset_of!(Iocb, aio_nbytes), 32);
        assert_eq!(offset_of!(Iocb, aio_offset), 40);
        assert_eq!(offset_of!(Iocb, aio_flags), 56);
    }

    #[test]
    fn ring_header_field_order() {
        assert_eq!(offset_of!(RingHeader, id), 0);
        assert_eq!(offset_of!(RingHeader, nr), 4);
        assert_eq!(offset_of!(RingHeader, head), 8);
        assert_eq!(offset_of!(RingHeader, tail), 12);
        assert_eq!(offset_of!(RingHeader, magic), 16);
        assert_eq!(offset_of!(RingHeader, compat_features), 20);
        assert_eq!(offset_of!(RingHeader, incompat_features), 24);
        assert_eq!(offset_of!(RingHeader, header_length), 28);
    }

    #[test]
    fn prep_keeps_user_data() {
        let mut iocb = Iocb {
            aio_data: 7,
            aio_flags: 3,
            ..Iocb::default()
        };
        let mut byte = 0u8;
        iocb.prep_pread(5, &mut byte, 1, 4096);

        assert_eq!(iocb.aio_data, 7);
        assert_eq!(iocb.aio_flags, 0);
        assert_eq!(iocb.aio_lio_opcode, IOCB_CMD_PREAD);
        assert_eq!(iocb.fd(), 5);
        assert_eq!(iocb.aio_nbytes, 1);
        assert_eq!(iocb.aio_offset, 4096);
    }
}
