use crate::ring::RingBuffer;
use crate::Channel;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::os::fd::BorrowedFd;
use std::sync::Arc;

/// The producing end of a ring. Exactly one `Writer` exists per ring; the
/// type is not `Clone` and all operations take `&mut self`.
pub struct Writer {
    pub(crate) channel: Arc<Channel>,
}

impl Writer {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Writer { channel }
    }

    /// Allocates the next record and returns it as a writable slice.
    ///
    /// Nothing becomes visible to the reader until [`publish`](Self::publish);
    /// several records may be prepared and then published together.
    /// Spins while the ring lacks space.
    #[inline(always)]
    pub fn prepare(&mut self, size: usize, alignment: usize) -> &mut [u8] {
        unsafe {
            let ptr = self.channel.ring().prepare_write(size, alignment);
            std::slice::from_raw_parts_mut(ptr.as_ptr(), size)
        }
    }

    /// Publishes every record prepared since the last publish.
    #[inline(always)]
    pub fn publish(&mut self) {
        unsafe { self.channel.ring().finish_write() }
    }

    /// Allocates one record and publishes it when the returned guard
    /// drops.
    pub fn reserve(&mut self, size: usize, alignment: usize) -> Reserved<'_> {
        let ring = self.channel.ring();
        unsafe {
            let ptr = ring.prepare_write(size, alignment);
            Reserved {
                data: std::slice::from_raw_parts_mut(ptr.as_ptr(), size),
                ring,
            }
        }
    }

    /// Writes one value as a record of `size_of::<T>()` bytes at
    /// `align_of::<T>()`, published immediately.
    ///
    /// The reader must mirror this call with `read::<T>()`.
    #[inline(always)]
    pub fn write<T: Copy>(&mut self, value: &T) {
        let ring = self.channel.ring();
        unsafe {
            let dst = ring.prepare_write(size_of::<T>(), align_of::<T>());
            std::ptr::copy_nonoverlapping(
                value as *const T as *const u8,
                dst.as_ptr(),
                size_of::<T>(),
            );
            ring.finish_write();
        }
    }

    /// Writes a slice of values as one record, published immediately.
    ///
    /// The reader must mirror this call with `read_slice::<T>(values.len())`.
    pub fn write_slice<T: Copy>(&mut self, values: &[T]) {
        let ring = self.channel.ring();
        unsafe {
            let dst = ring.prepare_write(std::mem::size_of_val(values), align_of::<T>());
            std::ptr::copy_nonoverlapping(
                values.as_ptr() as *const u8,
                dst.as_ptr(),
                std::mem::size_of_val(values),
            );
            ring.finish_write();
        }
    }

    /// Bytes that can be written right now without spinning, ignoring
    /// alignment padding and records prepared but not yet published.
    pub fn free_bytes(&self) -> usize {
        let ring = self.channel.ring();
        ring.capacity() - ring.published().wrapping_sub(ring.consumed())
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.channel.ring().capacity()
    }

    /// File descriptor of the backing memory, for handing the ring to a
    /// reader in another process.
    pub fn memory_fd(&self) -> BorrowedFd<'_> {
        self.channel.memory().fd()
    }
}

/// A prepared record that publishes itself when dropped.
pub struct Reserved<'a> {
    data: &'a mut [u8],
    ring: &'a RingBuffer,
}

impl Deref for Reserved<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl DerefMut for Reserved<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

impl Drop for Reserved<'_> {
    fn drop(&mut self) {
        // The guard borrows the unique Writer mutably for its lifetime.
        unsafe { self.ring.finish_write() }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{channel, Reader};
    use rstest::*;

    #[fixture]
    fn pair() -> (Writer, Reader) {
        channel(4096).unwrap()
    }

    #[rstest]
    fn reserve_publishes_on_drop(pair: (Writer, Reader)) {
        let (mut writer, reader) = pair;

        {
            let mut reserved = writer.reserve(16, 8);
            reserved.copy_from_slice(&[0x5A; 16]);
            assert_eq!(reader.available_bytes(), 0);
        }
        assert_eq!(reader.available_bytes(), 16);
    }

    #[rstest]
    fn batched_prepare_publishes_once(pair: (Writer, Reader)) {
        let (mut writer, reader) = pair;

        writer.prepare(8, 8).fill(1);
        writer.prepare(8, 8).fill(2);
        assert_eq!(reader.available_bytes(), 0);
        writer.publish();
        assert_eq!(reader.available_bytes(), 16);
    }

    #[rstest]
    #[case(8)]
    #[case(64)]
    #[case(256)]
    fn free_bytes_tracks_published_records(pair: (Writer, Reader), #[case] size: usize) {
        let (mut writer, _reader) = pair;

        let capacity = writer.capacity();
        assert_eq!(writer.free_bytes(), capacity);
        writer.reserve(size, 8).fill(0xAB);
        assert_eq!(writer.free_bytes(), capacity - size);
    }

    #[rstest]
    fn typed_write_is_read_back(pair: (Writer, Reader)) {
        let (mut writer, mut reader) = pair;

        writer.write(&0x1122_3344u32);
        writer.write(&[1.5f64, -2.5]);
        let value: u32 = unsafe { reader.read() };
        assert_eq!(value, 0x1122_3344);
        let floats: [f64; 2] = unsafe { reader.read() };
        assert_eq!(floats, [1.5, -2.5]);
    }

    #[rstest]
    fn slice_write_is_read_back(pair: (Writer, Reader)) {
        let (mut writer, mut reader) = pair;

        let values: Vec<u64> = (0..32).map(|i| i * 3).collect();
        writer.write_slice(&values);
        let record = unsafe { reader.read_slice::<u64>(32) };
        assert_eq!(&*record, &values[..]);
    }
}
