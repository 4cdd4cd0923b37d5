//! The coordination core: one producer and one consumer exchange
//! variable-size aligned records through a shared byte region, ordered by
//! two monotonically growing cursors.
//!
//! # Memory ordering
//!
//! - `finish_write` publishes `writer.base + writer.pos` to the `published`
//!   cursor with a Release store; the reader's space loop loads it with
//!   Acquire. That edge makes every byte written into a record visible
//!   before the record becomes readable.
//! - `finish_read` publishes `reader.base + reader.pos` to the `consumed`
//!   cursor with a Release store; the writer's space loop loads it with
//!   Acquire, so space is never reused while the reader may still touch it.
//! - Nothing stronger is used anywhere. Each side's private state is only
//!   ever accessed by that side.
//!
//! # Wrap rule
//!
//! Records never straddle the end of the buffer. When an aligned record
//! would not fit in the remainder of the current window, the tail is
//! skipped: the record moves to offset 0 of the next window and `base`
//! advances by the capacity. Both sides derive the same skip from the same
//! `(size, alignment)` sequence, so the unused tail bytes are never
//! observed by either side.
//!
//! Cursors are not taken modulo the capacity. Occupied bytes are
//! `published - consumed`; the subtraction is compared as signed so a
//! transient overshoot during the wrap reads as "no space yet" instead of
//! a huge positive number.

use crate::cacheline::{runtime_cache_line_size, CacheAligned, CACHE_LINE_SIZE};
use crate::error::SpscBufError;
use crate::sync::{AtomicUsize, Backoff, Ordering};
use std::cell::UnsafeCell;
use std::ptr::NonNull;

/// One side's private view of the ring.
///
/// `base + pos` is the side's true monotonic cursor; `end` is the highest
/// offset in the current window known to be safe without consulting the
/// other side.
#[derive(Copy, Clone)]
#[repr(C)]
pub(crate) struct SideState {
    pub(crate) buffer: *mut u8,
    pub(crate) pos: usize,
    pub(crate) end: usize,
    pub(crate) base: usize,
    pub(crate) size: usize,
}

impl Default for SideState {
    fn default() -> Self {
        SideState {
            buffer: std::ptr::null_mut(),
            pos: 0,
            end: 0,
            base: 0,
            size: 0,
        }
    }
}

/// Shared control block of the ring.
///
/// The layout is a wire contract: writer state, reader state, published
/// cursor, consumed cursor, each padded to one cache line, in that order.
/// Placing a `RingBuffer` in shared memory makes the whole protocol
/// process-shared; each attaching process rebinds its own side's `buffer`
/// pointer with [`reattach_writer`](Self::reattach_writer) or
/// [`reattach_reader`](Self::reattach_reader), everything else is
/// position-independent.
#[repr(C)]
pub struct RingBuffer {
    writer: CacheAligned<UnsafeCell<SideState>>,
    reader: CacheAligned<UnsafeCell<SideState>>,
    published: CacheAligned<AtomicUsize>,
    consumed: CacheAligned<AtomicUsize>,
}

#[cfg(not(feature = "loom"))]
const _: () = {
    assert!(std::mem::size_of::<RingBuffer>() == 4 * CACHE_LINE_SIZE);
    assert!(std::mem::offset_of!(RingBuffer, writer) == 0);
    assert!(std::mem::offset_of!(RingBuffer, reader) == CACHE_LINE_SIZE);
    assert!(std::mem::offset_of!(RingBuffer, published) == 2 * CACHE_LINE_SIZE);
    assert!(std::mem::offset_of!(RingBuffer, consumed) == 3 * CACHE_LINE_SIZE);
};

// The raw side-state pointers are only dereferenced by the single producer
// and single consumer respectively; the cursors carry the synchronization.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

#[inline(always)]
fn align_up(pos: usize, alignment: usize) -> usize {
    if cfg!(feature = "unaligned") {
        pos
    } else {
        (pos + alignment - 1) & !(alignment - 1)
    }
}

impl RingBuffer {
    /// All-zero control block, ready to be placed into a mapping and
    /// [`initialize`](Self::initialize)d.
    pub fn new() -> Self {
        RingBuffer {
            writer: CacheAligned::new(UnsafeCell::new(SideState::default())),
            reader: CacheAligned::new(UnsafeCell::new(SideState::default())),
            published: CacheAligned::new(AtomicUsize::new(0)),
            consumed: CacheAligned::new(AtomicUsize::new(0)),
        }
    }

    /// Binds the ring to a byte region and resets all state.
    ///
    /// The buffer must be aligned to [`CACHE_LINE_SIZE`] and `capacity`
    /// must be a power of two. Fails when the runtime cache line probe
    /// reports a line size different from the one the binary was compiled
    /// with; a mismatch would silently re-introduce false sharing between
    /// the four padded regions.
    pub fn initialize(
        &mut self,
        buffer: NonNull<u8>,
        capacity: usize,
    ) -> Result<(), SpscBufError> {
        if !capacity.is_power_of_two() {
            return Err(SpscBufError::CapacityNotPowerOfTwo(capacity));
        }
        let addr = buffer.as_ptr() as usize;
        if addr % CACHE_LINE_SIZE != 0 {
            return Err(SpscBufError::BufferMisaligned {
                addr,
                required: CACHE_LINE_SIZE,
            });
        }
        if let Some(probed) = runtime_cache_line_size() {
            if probed != CACHE_LINE_SIZE {
                return Err(SpscBufError::CacheLineMismatch {
                    compiled: CACHE_LINE_SIZE,
                    probed,
                });
            }
        }

        self.reset();
        // Exclusive access through `&mut self`, no side can be active.
        unsafe {
            self.reattach_writer(buffer);
            self.reattach_reader(buffer);
            let writer = &mut *self.writer.get();
            let reader = &mut *self.reader.get();
            writer.size = capacity;
            writer.end = capacity;
            reader.size = capacity;
        }
        Ok(())
    }

    /// Clears both cursors and both sides back to the unbound state.
    ///
    /// Must not run while either side is active; `&mut self` enforces that
    /// for in-process rings. See [`crate::reset`] for resetting a live
    /// channel pair.
    pub fn reset(&mut self) {
        unsafe {
            *self.writer.get() = SideState::default();
            *self.reader.get() = SideState::default();
        }
        self.published.store(0, Ordering::Release);
        self.consumed.store(0, Ordering::Release);
    }

    /// Zeroes cursors and positions while keeping each side's buffer
    /// binding and the capacity.
    ///
    /// # Safety
    ///
    /// Caller must guarantee both sides are quiescent.
    pub(crate) unsafe fn reset_in_place(&self) {
        let writer = &mut *self.writer.get();
        let reader = &mut *self.reader.get();
        *writer = SideState {
            buffer: writer.buffer,
            pos: 0,
            end: writer.size,
            base: 0,
            size: writer.size,
        };
        *reader = SideState {
            buffer: reader.buffer,
            pos: 0,
            end: 0,
            base: 0,
            size: reader.size,
        };
        self.published.store(0, Ordering::Release);
        self.consumed.store(0, Ordering::Release);
    }

    /// Rebinds the producer-side buffer pointer to this address space's
    /// mapping of the region.
    ///
    /// # Safety
    ///
    /// Caller must be the unique producer, and `buffer` must map the same
    /// region the ring was initialized with.
    pub unsafe fn reattach_writer(&self, buffer: NonNull<u8>) {
        (*self.writer.get()).buffer = buffer.as_ptr();
    }

    /// Rebinds the consumer-side buffer pointer.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer, and `buffer` must map the same
    /// region the ring was initialized with.
    pub unsafe fn reattach_reader(&self, buffer: NonNull<u8>) {
        (*self.reader.get()).buffer = buffer.as_ptr();
    }

    /// Allocates `size` bytes at the next `alignment`-aligned offset and
    /// returns the write pointer. Spins while the ring lacks space.
    ///
    /// # Safety
    ///
    /// Caller must be the unique producer of an initialized ring. The
    /// returned region is valid for writes of `size` bytes until the next
    /// producer-side call.
    #[inline(always)]
    pub unsafe fn prepare_write(&self, size: usize, alignment: usize) -> NonNull<u8> {
        let writer = &mut *self.writer.get();
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(size + (alignment - 1) <= writer.size);

        let mut pos = align_up(writer.pos, alignment);
        let mut end = pos + size;
        if end > writer.end {
            self.acquire_write_window(writer, &mut pos, &mut end);
        }
        writer.pos = end;
        NonNull::new_unchecked(writer.buffer.add(pos))
    }

    /// Publishes everything prepared so far to the consumer.
    ///
    /// # Safety
    ///
    /// Caller must be the unique producer.
    #[inline(always)]
    pub unsafe fn finish_write(&self) {
        let writer = &*self.writer.get();
        self.published
            .store(writer.base.wrapping_add(writer.pos), Ordering::Release);
    }

    /// Locates the next record, assuming the consumer mirrors the
    /// producer's `(size, alignment)` sequence. Spins while the record is
    /// not yet published.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer of an initialized ring, and
    /// `(size, alignment)` must equal what the producer used for this
    /// record. The returned region is valid for reads of `size` bytes
    /// until [`finish_read`](Self::finish_read).
    #[inline(always)]
    pub unsafe fn prepare_read(&self, size: usize, alignment: usize) -> NonNull<u8> {
        let reader = &mut *self.reader.get();
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(size + (alignment - 1) <= reader.size);

        let mut pos = align_up(reader.pos, alignment);
        let mut end = pos + size;
        if end > reader.end {
            self.acquire_read_window(reader, &mut pos, &mut end);
        }
        reader.pos = end;
        NonNull::new_unchecked(reader.buffer.add(pos))
    }

    /// Returns everything read so far to the producer.
    ///
    /// # Safety
    ///
    /// Caller must be the unique consumer. Record bytes obtained from
    /// earlier `prepare_read` calls must no longer be accessed.
    #[inline(always)]
    pub unsafe fn finish_read(&self) {
        let reader = &*self.reader.get();
        self.consumed
            .store(reader.base.wrapping_add(reader.pos), Ordering::Release);
    }

    fn acquire_write_window(&self, writer: &mut SideState, pos: &mut usize, end: &mut usize) {
        if *end > writer.size {
            // Skip the tail: the record restarts at offset 0 of the next
            // window and the skipped bytes are never published.
            *end -= *pos;
            *pos = 0;
            writer.base = writer.base.wrapping_add(writer.size);
            crate::spsc_trace!(base = writer.base, "writer wrapped");
        }
        let backoff = Backoff::new();
        loop {
            let consumed = self.consumed.load(Ordering::Acquire);
            let available = consumed.wrapping_sub(writer.base).wrapping_add(writer.size);
            // Signed compare: when the writer's base has run ahead of the
            // consumed cursor the subtraction underflows, and the value
            // must read as "no space yet" rather than as a huge offset.
            if available as isize >= *end as isize {
                writer.end = available.min(writer.size);
                return;
            }
            crate::spsc_trace!(consumed, needed = *end, "writer waiting for space");
            backoff.spin();
        }
    }

    fn acquire_read_window(&self, reader: &mut SideState, pos: &mut usize, end: &mut usize) {
        if *end > reader.size {
            *end -= *pos;
            *pos = 0;
            reader.base = reader.base.wrapping_add(reader.size);
            crate::spsc_trace!(base = reader.base, "reader wrapped");
        }
        let backoff = Backoff::new();
        loop {
            let published = self.published.load(Ordering::Acquire);
            let available = published.wrapping_sub(reader.base);
            if available as isize >= *end as isize {
                reader.end = available.min(reader.size);
                return;
            }
            crate::spsc_trace!(published, needed = *end, "reader waiting for data");
            backoff.spin();
        }
    }

    /// Total bytes the producer has published.
    #[inline(always)]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    /// Total bytes the consumer has retired.
    #[inline(always)]
    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::Acquire)
    }

    /// Ring capacity in bytes, as recorded on the producer side. Safe to
    /// call from the producer or while the ring is quiescent.
    pub fn capacity(&self) -> usize {
        unsafe { (*self.writer.get()).size }
    }

    // The consumer reads its own copy so it never touches the producer's
    // cache line.
    pub(crate) fn reader_capacity(&self) -> usize {
        unsafe { (*self.reader.get()).size }
    }

    #[cfg(test)]
    pub(crate) fn writer_state(&self) -> SideState {
        unsafe { *self.writer.get() }
    }

    #[cfg(test)]
    pub(crate) fn reader_state(&self) -> SideState {
        unsafe { *self.reader.get() }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct AlignedBuf {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl AlignedBuf {
        fn new(capacity: usize) -> Self {
            let layout = Layout::from_size_align(capacity, CACHE_LINE_SIZE).unwrap();
            let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            AlignedBuf { ptr, layout }
        }
    }

    impl Drop for AlignedBuf {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    fn ring_with(capacity: usize) -> (RingBuffer, AlignedBuf) {
        let buf = AlignedBuf::new(capacity);
        let mut ring = RingBuffer::new();
        ring.initialize(buf.ptr, capacity).unwrap();
        (ring, buf)
    }

    #[test]
    fn rejects_non_power_of_two_capacity() {
        let buf = AlignedBuf::new(128);
        let mut ring = RingBuffer::new();
        assert!(matches!(
            ring.initialize(buf.ptr, 100),
            Err(SpscBufError::CapacityNotPowerOfTwo(100))
        ));
    }

    #[test]
    fn rejects_misaligned_buffer() {
        let buf = AlignedBuf::new(128);
        let mut ring = RingBuffer::new();
        let skewed = unsafe { NonNull::new_unchecked(buf.ptr.as_ptr().add(1)) };
        assert!(matches!(
            ring.initialize(skewed, 64),
            Err(SpscBufError::BufferMisaligned { .. })
        ));
    }

    #[test]
    fn single_record_roundtrip() {
        let (ring, _buf) = ring_with(64);
        unsafe {
            let dst = ring.prepare_write(4, 4);
            (dst.as_ptr() as *mut u32).write(0x1122_3344);
            ring.finish_write();

            let src = ring.prepare_read(4, 4);
            assert_eq!((src.as_ptr() as *const u32).read(), 0x1122_3344);
            ring.finish_read();
        }
        assert_eq!(ring.published(), 4);
        assert_eq!(ring.consumed(), 4);
        let writer = ring.writer_state();
        let reader = ring.reader_state();
        assert_eq!((writer.base, writer.pos), (0, 4));
        assert_eq!((reader.base, reader.pos), (0, 4));
    }

    #[test]
    fn exact_fit_fills_the_window_and_next_record_wraps() {
        let (ring, _buf) = ring_with(64);
        unsafe {
            // 16 records of 4 bytes fill the 64-byte window exactly.
            for i in 0..16u32 {
                let dst = ring.prepare_write(4, 4);
                (dst.as_ptr() as *mut u32).write(i);
                ring.finish_write();
            }
            assert_eq!(ring.writer_state().pos, 64);
            assert_eq!(ring.writer_state().base, 0);
            assert_eq!(ring.published(), 64);

            for i in 0..16u32 {
                let src = ring.prepare_read(4, 4);
                assert_eq!((src.as_ptr() as *const u32).read(), i);
                ring.finish_read();
            }
            assert_eq!(ring.reader_state().pos, 64);

            // Record 17 starts a new window.
            let dst = ring.prepare_write(4, 4);
            (dst.as_ptr() as *mut u32).write(16);
            ring.finish_write();
            assert_eq!(ring.writer_state().base, 64);
            assert_eq!(ring.writer_state().pos, 4);

            let src = ring.prepare_read(4, 4);
            assert_eq!((src.as_ptr() as *const u32).read(), 16);
            ring.finish_read();
            assert_eq!(ring.reader_state().base, 64);
            assert_eq!(ring.reader_state().pos, 4);
        }
    }

    #[test]
    fn alignment_padding_is_skipped_on_both_sides() {
        let (ring, buf) = ring_with(64);
        unsafe {
            let first = ring.prepare_write(1, 1);
            first.as_ptr().write(0xAA);
            let second = ring.prepare_write(8, 8);
            assert_eq!(
                second.as_ptr().offset_from(buf.ptr.as_ptr()),
                8,
                "8-byte record starts at the next 8-aligned offset"
            );
            (second.as_ptr() as *mut u64).write(0xDEAD_BEEF_CAFE_F00D);
            ring.finish_write();
            assert_eq!(ring.published(), 16);

            let first = ring.prepare_read(1, 1);
            assert_eq!(first.as_ptr().read(), 0xAA);
            let second = ring.prepare_read(8, 8);
            assert_eq!((second.as_ptr() as *const u64).read(), 0xDEAD_BEEF_CAFE_F00D);
            ring.finish_read();
            assert_eq!(ring.consumed(), 16);
        }
    }

    #[test]
    fn returned_pointers_honor_the_requested_alignment() {
        let (ring, _buf) = ring_with(1024);
        unsafe {
            for size in [1usize, 3, 7, 8, 24, 64] {
                for alignment in [1usize, 2, 4, 8, 16, 64] {
                    let dst = ring.prepare_write(size, alignment);
                    assert_eq!(dst.as_ptr() as usize % alignment, 0);
                    ring.finish_write();
                    let src = ring.prepare_read(size, alignment);
                    assert_eq!(src.as_ptr() as usize % alignment, 0);
                    assert_eq!(src, dst);
                    ring.finish_read();
                }
            }
        }
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let (ring, _buf) = ring_with(256);
        unsafe {
            for _ in 0..64 {
                ring.prepare_write(24, 8);
                ring.finish_write();
                let occupied = ring.published().wrapping_sub(ring.consumed());
                assert!((occupied as isize) >= 0);
                assert!(occupied <= 256);
                ring.prepare_read(24, 8);
                ring.finish_read();
            }
        }
    }

    #[test]
    fn writer_blocks_on_full_ring_until_reader_retires() {
        let (ring, buf) = ring_with(16);
        let base = buf.ptr.as_ptr() as usize;
        std::thread::scope(|scope| {
            scope.spawn(|| unsafe {
                // Holds the whole window for a moment before retiring it.
                let src = ring.prepare_read(12, 4);
                assert_eq!(src.as_ptr() as usize - base, 0);
                std::thread::sleep(std::time::Duration::from_millis(50));
                ring.finish_read();

                let src = ring.prepare_read(8, 4);
                assert_eq!(src.as_ptr() as usize - base, 0, "record wrapped to offset 0");
                ring.finish_read();
            });

            unsafe {
                let dst = ring.prepare_write(12, 4);
                dst.as_ptr().write_bytes(0x11, 12);
                ring.finish_write();

                // Aligned start 12, end 20 > 16: wraps, then spins until
                // the reader has retired the 12-byte record.
                let dst = ring.prepare_write(8, 4);
                assert_eq!(dst.as_ptr() as usize - base, 0);
                dst.as_ptr().write_bytes(0x22, 8);
                ring.finish_write();
            }
        });
        assert_eq!(ring.published(), 16 + 8);
        assert_eq!(ring.consumed(), 16 + 8);
    }

    #[test]
    fn reader_blocks_on_empty_ring_until_writer_publishes() {
        let (ring, _buf) = ring_with(64);
        std::thread::scope(|scope| {
            scope.spawn(|| unsafe {
                std::thread::sleep(std::time::Duration::from_millis(50));
                let dst = ring.prepare_write(8, 8);
                (dst.as_ptr() as *mut u64).write(7);
                ring.finish_write();
            });

            unsafe {
                let src = ring.prepare_read(8, 8);
                assert_eq!((src.as_ptr() as *const u64).read(), 7);
                ring.finish_read();
            }
        });
    }

    #[test]
    fn reset_restores_fresh_initialize_behavior() {
        let (mut ring, buf) = ring_with(64);
        unsafe {
            for _ in 0..10 {
                ring.prepare_write(8, 8);
                ring.finish_write();
                ring.prepare_read(8, 8);
                ring.finish_read();
            }
        }
        assert!(ring.published() > 0);

        ring.initialize(buf.ptr, 64).unwrap();
        assert_eq!(ring.published(), 0);
        assert_eq!(ring.consumed(), 0);
        unsafe {
            let dst = ring.prepare_write(4, 4);
            assert_eq!(dst.as_ptr(), buf.ptr.as_ptr());
            (dst.as_ptr() as *mut u32).write(9);
            ring.finish_write();
            let src = ring.prepare_read(4, 4);
            assert_eq!((src.as_ptr() as *const u32).read(), 9);
            ring.finish_read();
        }
        assert_eq!(ring.published(), 4);
        assert_eq!(ring.consumed(), 4);
    }

    #[test]
    fn batched_publish_exposes_all_records_at_once() {
        let (ring, _buf) = ring_with(64);
        unsafe {
            ring.prepare_write(4, 4);
            ring.prepare_write(4, 4);
            ring.prepare_write(4, 4);
            assert_eq!(ring.published(), 0);
            ring.finish_write();
            assert_eq!(ring.published(), 12);
        }
    }
}
