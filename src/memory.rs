//! memfd-backed shared mapping holding a ring control block and its
//! payload region.
//!
//! Layout within the mapping: the [`RingBuffer`] control block occupies
//! the first page, the payload region starts at the first page boundary.
//! Page alignment implies cache line alignment for both. A second process
//! maps the same fd with [`Memory::from_fd`] and sees the same control
//! block and payload at its own addresses.

use crate::cacheline::CACHE_LINE_SIZE;
use crate::error::SpscBufError;
use crate::ring::RingBuffer;
use core::ptr::NonNull;
use eyre::{ensure, Result, WrapErr};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::num::NonZero;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

pub struct Memory {
    ptr: NonNull<u8>,
    len: usize,
    page_size: usize,
    capacity: usize,
    fd: OwnedFd,
}

impl Memory {
    /// Creates a new shared region sized for a ring of `capacity` payload
    /// bytes.
    pub fn create(capacity: usize) -> Result<Self> {
        ensure!(
            capacity.is_power_of_two(),
            SpscBufError::CapacityNotPowerOfTwo(capacity)
        );

        let fd = memfd_create(c"spscbuf", MemFdCreateFlag::MFD_CLOEXEC)
            .wrap_err("failed to create memory file descriptor")?;

        let len = page_size() + capacity;
        ftruncate(&fd, len as i64).wrap_err("failed to set memory file size")?;

        Self::map(fd, capacity)
    }

    /// Maps an existing region created by another process.
    pub fn from_fd(fd: OwnedFd, capacity: usize) -> Result<Self> {
        ensure!(
            capacity.is_power_of_two(),
            SpscBufError::CapacityNotPowerOfTwo(capacity)
        );
        Self::map(fd, capacity)
    }

    fn map(fd: OwnedFd, capacity: usize) -> Result<Self> {
        let page_size = page_size();
        ensure!(
            std::mem::size_of::<RingBuffer>() <= page_size,
            "ring control block does not fit in one page"
        );

        let len = page_size + capacity;
        let ptr = unsafe {
            mmap(
                None,
                NonZero::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .wrap_err("failed to map ring buffer memory")?
        };

        let ptr = NonNull::new(ptr.as_ptr() as *mut u8).expect("mmap returned null pointer");

        Ok(Memory {
            ptr,
            len,
            page_size,
            capacity,
            fd,
        })
    }

    pub(crate) fn ring_ptr(&self) -> NonNull<RingBuffer> {
        debug_assert_eq!(self.ptr.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        self.ptr.cast()
    }

    /// Start of the payload region in this address space.
    pub fn data_ptr(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(self.page_size)) }
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn clone_fd(&self) -> Result<OwnedFd> {
        self.fd
            .try_clone()
            .wrap_err("failed to duplicate memory file descriptor")
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
