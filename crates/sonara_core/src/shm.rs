//! Shared-memory audio ring
//!
//! Each stream owns one shm region shared with its client: a header of
//! atomics followed by two equal sample buffers. One side produces (the
//! client for playback, the server for capture), the other consumes. The
//! producer owns the buffer named by `write_buf_idx`, the consumer the one
//! named by `read_buf_idx`; when both name the same buffer the consumer may
//! read `[read_offset, write_offset)` of it concurrently.
//!
//! Publication protocol: offsets are stored with release ordering and read
//! with acquire ordering, so committed samples are visible before the
//! offset that announces them. The writer flips `write_buf_idx` only once
//! `write_offset` reaches `used_size`; the reader flips `read_buf_idx` only
//! once `read_offset` reaches `used_size`, resetting both offsets of the
//! consumed buffer for reuse.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memfd::{FileSeal, MemfdOptions};

use crate::error::{CoreError, CoreResult};
use crate::unix::monotonic_ns;

/// Header at the start of every stream's shm region. Field order is part of
/// the client ABI.
#[repr(C)]
pub struct ShmHeader {
    read_buf_idx: AtomicU32,
    write_buf_idx: AtomicU32,
    read_offset: [AtomicU32; 2],
    write_offset: [AtomicU32; 2],
    frame_bytes: AtomicU32,
    used_size: AtomicU32,
    /// f32 bits; per-stream volume written by the client.
    volume_scaler: AtomicU32,
    mute: AtomicU32,
    /// Set while a REQUEST_DATA is outstanding for this stream.
    callback_pending: AtomicU32,
    /// Monotonic ns of the first sample in each buffer.
    buffer_ts_ns: [AtomicU64; 2],
}

pub const SHM_HEADER_SIZE: usize = std::mem::size_of::<ShmHeader>();

/// The server-side mapping of one stream's audio ring.
pub struct ShmRing {
    file: std::fs::File,
    map: *mut u8,
    map_len: usize,
    used_size: usize,
    frame_bytes: usize,
}

// The mapping is owned by this struct; access is serialized by the owning
// Stream's lock. The client side is a separate process with its own rules.
unsafe impl Send for ShmRing {}

impl ShmRing {
    /// Creates the shm region for a stream: header + two buffers of
    /// `buffer_frames` frames each.
    pub fn create(name: &str, buffer_frames: usize, frame_bytes: usize) -> CoreResult<Self> {
        if buffer_frames == 0 || frame_bytes == 0 {
            return Err(CoreError::InvalidArgument("empty shm ring"));
        }
        let used_size = buffer_frames * frame_bytes;
        let map_len = SHM_HEADER_SIZE + 2 * used_size;

        let memfd = MemfdOptions::default()
            .allow_sealing(true)
            .create(name)
            .map_err(|_| CoreError::ResourceExhausted("memfd create"))?;
        memfd
            .as_file()
            .set_len(map_len as u64)
            .map_err(CoreError::Io)?;
        // Size is fixed for the stream's lifetime; the client can rely on it.
        let _ = memfd.add_seals(&[FileSeal::SealShrink, FileSeal::SealGrow]);
        let file = memfd.into_file();

        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(CoreError::ResourceExhausted("mmap shm ring"));
        }

        let ring = Self {
            map: map as *mut u8,
            map_len,
            used_size,
            frame_bytes,
            file,
        };
        let hdr = ring.header();
        hdr.frame_bytes.store(frame_bytes as u32, Ordering::Relaxed);
        hdr.used_size.store(used_size as u32, Ordering::Relaxed);
        hdr.volume_scaler
            .store(1.0f32.to_bits(), Ordering::Relaxed);
        Ok(ring)
    }

    pub fn header(&self) -> &ShmHeader {
        unsafe { &*(self.map as *const ShmHeader) }
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn total_size(&self) -> usize {
        self.map_len
    }

    pub fn used_size(&self) -> usize {
        self.used_size
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn buffer_frames(&self) -> usize {
        self.used_size / self.frame_bytes
    }

    fn buf_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < 2);
        unsafe { self.map.add(SHM_HEADER_SIZE + idx * self.used_size) }
    }

    fn buf_slice(&self, idx: usize, start: usize, len: usize) -> &[u8] {
        debug_assert!(start + len <= self.used_size);
        unsafe { std::slice::from_raw_parts(self.buf_ptr(idx).add(start), len) }
    }

    fn buf_slice_mut(&mut self, idx: usize, start: usize, len: usize) -> &mut [u8] {
        debug_assert!(start + len <= self.used_size);
        unsafe { std::slice::from_raw_parts_mut(self.buf_ptr(idx).add(start), len) }
    }

    // ---- producer side ----

    /// Frames that can currently be written without overrunning.
    pub fn writable_frames(&self) -> usize {
        let hdr = self.header();
        let wb = hdr.write_buf_idx.load(Ordering::Relaxed) as usize & 1;
        let wo = hdr.write_offset[wb].load(Ordering::Relaxed) as usize;
        let mut avail = self.used_size - wo;
        let other = wb ^ 1;
        if hdr.write_offset[other].load(Ordering::Acquire) == 0
            && hdr.read_offset[other].load(Ordering::Acquire) == 0
            && hdr.read_buf_idx.load(Ordering::Acquire) as usize != other
        {
            avail += self.used_size;
        }
        avail / self.frame_bytes
    }

    /// Returns the writable region of the current write buffer, up to
    /// `max_frames`. Zero usable frames means the ring is full.
    pub fn producer_get_write_buf(&mut self, max_frames: usize) -> (&mut [u8], usize) {
        let (wb, wo) = self.producer_pos();
        let usable = ((self.used_size - wo) / self.frame_bytes).min(max_frames);
        let len = usable * self.frame_bytes;
        (self.buf_slice_mut(wb, wo, len), usable)
    }

    fn producer_pos(&mut self) -> (usize, usize) {
        let hdr = self.header();
        let mut wb = hdr.write_buf_idx.load(Ordering::Relaxed) as usize & 1;
        let mut wo = hdr.write_offset[wb].load(Ordering::Relaxed) as usize;
        if wo == self.used_size {
            // Current buffer full; move on only if the other one was
            // consumed and reset.
            let other = wb ^ 1;
            let other_idle = hdr.write_offset[other].load(Ordering::Acquire) == 0
                && hdr.read_offset[other].load(Ordering::Acquire) == 0
                && hdr.read_buf_idx.load(Ordering::Acquire) as usize != other;
            if other_idle {
                hdr.write_buf_idx.store(other as u32, Ordering::Release);
                wb = other;
                wo = 0;
            }
        }
        (wb, wo)
    }

    /// Writable region starting `offset_frames` past the write pointer,
    /// for producers (capture devices) that advance at their own pace
    /// before a shared commit. Limited to the current write buffer.
    pub fn producer_get_write_buf_at(
        &mut self,
        offset_frames: usize,
        max_frames: usize,
    ) -> (&mut [u8], usize) {
        let (wb, wo) = self.producer_pos();
        let offset = offset_frames * self.frame_bytes;
        let start = wo + offset;
        if start >= self.used_size {
            return (&mut [], 0);
        }
        let usable = ((self.used_size - start) / self.frame_bytes).min(max_frames);
        let len = usable * self.frame_bytes;
        (self.buf_slice_mut(wb, start, len), usable)
    }

    /// Publishes `frames` written to the current write buffer.
    pub fn producer_commit(&mut self, frames: usize) {
        let (wb, wo) = self.producer_pos();
        let bytes = frames * self.frame_bytes;
        debug_assert!(wo + bytes <= self.used_size);
        let hdr = self.header();
        if wo == 0 && frames > 0 {
            hdr.buffer_ts_ns[wb].store(monotonic_ns(), Ordering::Relaxed);
        }
        hdr.write_offset[wb].store((wo + bytes) as u32, Ordering::Release);
    }

    // ---- consumer side ----

    /// Total committed frames not yet released, across both buffers.
    pub fn curr_read_frames(&self) -> usize {
        let hdr = self.header();
        let mut bytes = 0usize;
        for i in 0..2 {
            let wo = hdr.write_offset[i].load(Ordering::Acquire) as usize;
            let ro = hdr.read_offset[i].load(Ordering::Relaxed) as usize;
            bytes += wo.saturating_sub(ro);
        }
        bytes / self.frame_bytes
    }

    /// The contiguous readable region of the current read buffer.
    pub fn consumer_get_read_buf(&self) -> (&[u8], usize) {
        let hdr = self.header();
        let rb = hdr.read_buf_idx.load(Ordering::Relaxed) as usize & 1;
        let wo = hdr.write_offset[rb].load(Ordering::Acquire) as usize;
        let ro = hdr.read_offset[rb].load(Ordering::Relaxed) as usize;
        let len = wo.saturating_sub(ro);
        (self.buf_slice(rb, ro, len), len / self.frame_bytes)
    }

    /// Readable samples starting `offset_frames` past the read pointer,
    /// following into the second buffer when the first is exhausted.
    pub fn get_readable_frames(&self, offset_frames: usize) -> (&[u8], usize) {
        let hdr = self.header();
        let rb = hdr.read_buf_idx.load(Ordering::Relaxed) as usize & 1;
        let offset_bytes = offset_frames * self.frame_bytes;

        let wo = hdr.write_offset[rb].load(Ordering::Acquire) as usize;
        let ro = hdr.read_offset[rb].load(Ordering::Relaxed) as usize;
        let first = wo.saturating_sub(ro);
        if offset_bytes < first {
            let len = first - offset_bytes;
            return (
                self.buf_slice(rb, ro + offset_bytes, len),
                len / self.frame_bytes,
            );
        }

        let other = rb ^ 1;
        let offset2 = offset_bytes - first;
        let wo2 = hdr.write_offset[other].load(Ordering::Acquire) as usize;
        let ro2 = hdr.read_offset[other].load(Ordering::Relaxed) as usize;
        let second = wo2.saturating_sub(ro2);
        if offset2 < second {
            let len = second - offset2;
            return (
                self.buf_slice(other, ro2 + offset2, len),
                len / self.frame_bytes,
            );
        }
        (&[], 0)
    }

    /// Releases `frames` consumed frames, flipping buffers as they drain.
    pub fn consumer_release(&mut self, frames: usize) {
        let mut bytes = frames * self.frame_bytes;
        while bytes > 0 {
            let hdr = self.header();
            let rb = hdr.read_buf_idx.load(Ordering::Relaxed) as usize & 1;
            let wo = hdr.write_offset[rb].load(Ordering::Acquire) as usize;
            let ro = hdr.read_offset[rb].load(Ordering::Relaxed) as usize;
            let take = bytes.min(wo.saturating_sub(ro));
            if take == 0 {
                break;
            }
            let new_ro = ro + take;
            hdr.read_offset[rb].store(new_ro as u32, Ordering::Release);
            bytes -= take;
            if new_ro == self.used_size {
                // Buffer fully consumed: reset it for the producer and move
                // to the other one.
                hdr.write_offset[rb].store(0, Ordering::Relaxed);
                hdr.read_offset[rb].store(0, Ordering::Relaxed);
                hdr.read_buf_idx.store((rb ^ 1) as u32, Ordering::Release);
            }
        }
    }

    // ---- header state shared with the client ----

    pub fn volume_scaler(&self) -> f32 {
        f32::from_bits(self.header().volume_scaler.load(Ordering::Relaxed))
    }

    pub fn set_volume_scaler(&self, scaler: f32) {
        self.header()
            .volume_scaler
            .store(scaler.to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.header().mute.load(Ordering::Relaxed) != 0
    }

    pub fn set_mute(&self, mute: bool) {
        self.header().mute.store(mute as u32, Ordering::Relaxed);
    }

    pub fn callback_pending(&self) -> bool {
        self.header().callback_pending.load(Ordering::Acquire) != 0
    }

    pub fn set_callback_pending(&self, pending: bool) {
        self.header()
            .callback_pending
            .store(pending as u32, Ordering::Release);
    }
}

impl Drop for ShmRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
        }
    }
}
