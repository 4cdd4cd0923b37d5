//! Cache line size constant, padding wrapper, and the runtime probe.
//!
//! The padding width is part of the shared-memory layout, so it is a
//! compile-time constant rather than whatever the allocator or a generic
//! padding type happens to pick. [`RingBuffer::initialize`] consults the
//! runtime probe once and refuses to run when a known L1 data cache line
//! size disagrees with the constant the binary was compiled with.
//!
//! [`RingBuffer::initialize`]: crate::RingBuffer::initialize

use std::ops::{Deref, DerefMut};

/// Cache line size the crate is compiled for.
///
/// 128 bytes on Apple Silicon, 64 bytes everywhere else.
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub const CACHE_LINE_SIZE: usize = 128;

/// Cache line size the crate is compiled for.
///
/// 128 bytes on Apple Silicon, 64 bytes everywhere else.
#[cfg(not(all(target_arch = "aarch64", target_os = "macos")))]
pub const CACHE_LINE_SIZE: usize = 64;

/// Pads and aligns `T` to [`CACHE_LINE_SIZE`] so neighboring fields never
/// share a line.
#[cfg_attr(
    all(target_arch = "aarch64", target_os = "macos"),
    repr(C, align(128))
)]
#[cfg_attr(
    not(all(target_arch = "aarch64", target_os = "macos")),
    repr(C, align(64))
)]
pub(crate) struct CacheAligned<T> {
    value: T,
}

const _: () = assert!(std::mem::align_of::<CacheAligned<()>>() == CACHE_LINE_SIZE);

impl<T> CacheAligned<T> {
    pub(crate) const fn new(value: T) -> Self {
        CacheAligned { value }
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Queries the CPU's L1 data cache line size, `None` when the platform
/// does not expose it.
pub fn runtime_cache_line_size() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        let line = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
        if line <= 0 {
            None
        } else {
            Some(line as usize)
        }
    }

    #[cfg(target_os = "macos")]
    {
        let mut line: i64 = 0;
        let mut len = std::mem::size_of::<i64>();
        let rc = unsafe {
            libc::sysctlbyname(
                c"hw.cachelinesize".as_ptr(),
                &mut line as *mut i64 as *mut libc::c_void,
                &mut len,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 || line <= 0 {
            None
        } else {
            Some(line as usize)
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}
