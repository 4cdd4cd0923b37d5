//! Wait-free single-producer single-consumer byte ring buffer with
//! aligned, variable-size records.
//!
//! The producer asks for `(size, alignment)` sized regions, writes into
//! them, and publishes; the consumer mirrors the exact same sequence of
//! calls and reads the same bytes back. There is no framing and no type
//! information in the ring: the two sides agree on record shapes out of
//! band, which keeps the hot path down to one atomic release store per
//! publish and one acquire load per refill.
//!
//! Records never straddle the end of the buffer, and every record starts
//! at an offset aligned to the caller's request, so the bytes can be
//! reinterpreted as plain-data values in place. The control block and the
//! payload live in one memfd-backed mapping, so a second process can map
//! the same fd and attach the opposite end.
//!
//! ```
//! let (mut writer, mut reader) = spscbuf::channel(4096)?;
//!
//! writer.write(&0x1122_3344u32);
//! let value: u32 = unsafe { reader.read() };
//! assert_eq!(value, 0x1122_3344);
//! # Ok::<(), eyre::Report>(())
//! ```
//!
//! Both ends poll: a writer without space and a reader without data spin
//! until the other side catches up. Callers that need to avoid spinning
//! check [`Writer::free_bytes`] or [`Reader::available_bytes`] first, or
//! layer their own signalling outside the ring.

pub mod cacheline;
pub mod error;
pub mod memory;
pub mod reader;
pub mod ring;
pub mod writer;

mod sync;
mod trace_macro;

use crate::memory::Memory;
use std::os::fd::OwnedFd;
use std::sync::Arc;

pub use cacheline::{runtime_cache_line_size, CACHE_LINE_SIZE};
pub use error::SpscBufError;
pub use reader::{Reader, Record, Values};
pub use ring::RingBuffer;
pub use writer::{Reserved, Writer};

// Re-export for convenience
pub use eyre::Result;

/// One mapped ring shared by a writer and a reader handle.
pub(crate) struct Channel {
    memory: Memory,
}

impl Channel {
    pub(crate) fn ring(&self) -> &RingBuffer {
        unsafe { self.memory.ring_ptr().as_ref() }
    }

    pub(crate) fn memory(&self) -> &Memory {
        &self.memory
    }
}

fn create_channel(capacity: usize) -> Result<Arc<Channel>> {
    let memory = Memory::create(capacity)?;
    let ring_ptr = memory.ring_ptr().as_ptr();
    unsafe {
        ring_ptr.write(RingBuffer::new());
        (*ring_ptr).initialize(memory.data_ptr(), capacity)?;
    }
    Ok(Arc::new(Channel { memory }))
}

/// Creates an in-process ring and returns both ends.
///
/// `capacity` is the payload size in bytes and must be a power of two.
///
/// # Example
/// ```
/// let (mut writer, mut reader) = spscbuf::channel(1 << 16)?;
/// writer.write_slice(b"hello");
/// let record = unsafe { reader.read_slice::<u8>(5) };
/// assert_eq!(&*record, b"hello");
/// # Ok::<(), eyre::Report>(())
/// ```
pub fn channel(capacity: usize) -> Result<(Writer, Reader)> {
    let channel = create_channel(capacity)?;
    Ok((Writer::new(channel.clone()), Reader::new(channel)))
}

/// Creates a new ring and returns its writing end.
///
/// Hand [`Writer::memory_fd`] and the capacity to the other process,
/// which attaches with [`attach_reader`].
pub fn create_writer(capacity: usize) -> Result<Writer> {
    Ok(Writer::new(create_channel(capacity)?))
}

/// Creates a new ring and returns its reading end.
pub fn create_reader(capacity: usize) -> Result<Reader> {
    Ok(Reader::new(create_channel(capacity)?))
}

/// Attaches the writing end of a ring created in another process.
///
/// Maps `fd` and rebinds the writer-side buffer pointer to this address
/// space; counters and the opposite side are left untouched.
///
/// # Safety
///
/// The caller must guarantee this becomes the only live writer of the
/// ring, and that `capacity` matches the value the ring was created with.
pub unsafe fn attach_writer(fd: OwnedFd, capacity: usize) -> Result<Writer> {
    let memory = Memory::from_fd(fd, capacity)?;
    let channel = Arc::new(Channel { memory });
    channel.ring().reattach_writer(channel.memory().data_ptr());
    Ok(Writer::new(channel))
}

/// Attaches the reading end of a ring created in another process.
///
/// # Safety
///
/// The caller must guarantee this becomes the only live reader of the
/// ring, and that `capacity` matches the value the ring was created with.
pub unsafe fn attach_reader(fd: OwnedFd, capacity: usize) -> Result<Reader> {
    let memory = Memory::from_fd(fd, capacity)?;
    let channel = Arc::new(Channel { memory });
    channel.ring().reattach_reader(channel.memory().data_ptr());
    Ok(Reader::new(channel))
}

/// Returns a ring to its freshly initialized state.
///
/// Taking both handles mutably proves that neither side is mid-record, so
/// the counters can be cleared without racing the protocol. Fails with
/// [`SpscBufError::HandleMismatch`] when the handles do not belong to the
/// same in-process ring; cross-process rings cannot be reset this way,
/// re-create them instead.
pub fn reset(writer: &mut Writer, reader: &mut Reader) -> Result<(), SpscBufError> {
    if !Arc::ptr_eq(&writer.channel, &reader.channel) {
        return Err(SpscBufError::HandleMismatch);
    }
    // Both sides are quiesced by the exclusive borrows.
    unsafe { writer.channel.ring().reset_in_place() };
    Ok(())
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::{model::Builder, thread};

    #[test]
    fn transfer_preserves_order_and_contents() {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }

        builder.check(|| {
            let (mut writer, mut reader) = channel(4096).unwrap();

            let handle = thread::spawn(move || {
                writer.write(&1u64);
                writer.write(&2u64);
            });

            unsafe {
                assert_eq!(reader.read::<u64>(), 1);
                assert_eq!(reader.read::<u64>(), 2);
            }

            handle.join().unwrap();
        });
    }

    #[test]
    fn transfer_across_the_wrap() {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(2);
        }

        builder.check(|| {
            // Nine 8-byte records through a 64-byte ring: the ninth wraps
            // and must wait for the reader to retire the first window.
            let (mut writer, mut reader) = channel(64).unwrap();

            let handle = thread::spawn(move || {
                for i in 0..9u64 {
                    writer.write(&i);
                }
            });

            unsafe {
                for i in 0..9u64 {
                    assert_eq!(reader.read::<u64>(), i);
                }
            }

            handle.join().unwrap();
        });
    }
}
