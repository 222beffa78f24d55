//! Shared-memory frame reader — attaches to the named segment the browser
//! writes JPEG frames into and exposes attach/wait/read/is_active (spec
//! §4.G). All access happens while the stream registry's mutex is held, so
//! this type does no locking of its own beyond the atomics needed to track
//! the last sequence number seen.

use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Header layout written by the browser at the start of the segment: an
/// 8-byte big-endian sequence number, an 8-byte big-endian payload length,
/// and 4-byte big-endian width/height (spec §3 VideoFrame dimensions). The
/// browser writes `u64::MAX` as the sequence number as a tombstone when it
/// stops producing frames for this segment, letting a reader detect
/// end-of-stream without a separate liveness channel.
const HEADER_LEN: usize = 24;
const CLOSED_SEQUENCE: u64 = u64::MAX;

#[derive(thiserror::Error, Debug)]
pub enum FrameReaderError {
    #[error("failed to attach to shared memory segment {0:?}: {1}")]
    Attach(String, ShmemError),
    #[error("no frame became available within the wait timeout")]
    WaitTimeout,
    #[error("frame segment too small for its declared payload length")]
    Truncated,
}

pub struct VideoFrame {
    pub sequence: u64,
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

pub struct FrameReader {
    shmem: Shmem,
    last_sequence: AtomicU64,
}

// The browser process is the sole writer into this segment; this reader
// only ever reads, so sharing the handle across the tokio runtime's worker
// threads under the stream registry's mutex is safe even though the
// underlying pointer isn't `Send`/`Sync` by default.
unsafe impl Send for FrameReader {}
unsafe impl Sync for FrameReader {}

impl FrameReader {
    pub fn attach(name: &str) -> Result<Self, FrameReaderError> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| FrameReaderError::Attach(name.to_string(), e))?;
        Ok(Self {
            shmem,
            last_sequence: AtomicU64::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn attach_for_test() -> Self {
        let shmem = ShmemConf::new()
            .size(HEADER_LEN + 4096)
            .create()
            .expect("create anonymous test segment");
        Self {
            shmem,
            last_sequence: AtomicU64::new(0),
        }
    }

    fn current_sequence(&self) -> u64 {
        let base = self.shmem.as_ptr();
        let mut buf = [0u8; 8];
        unsafe { std::ptr::copy_nonoverlapping(base, buf.as_mut_ptr(), 8) };
        u64::from_be_bytes(buf)
    }

    /// `true` once the browser has written the closed tombstone.
    pub fn is_active(&self) -> bool {
        self.current_sequence() != CLOSED_SEQUENCE
    }

    /// Poll until a frame newer than the last one this reader returned
    /// appears, or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<(), FrameReaderError> {
        let deadline = Instant::now() + timeout;
        loop {
            let seq = self.current_sequence();
            if seq == CLOSED_SEQUENCE || seq > self.last_sequence.load(Ordering::Acquire) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FrameReaderError::WaitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Read the most recently written frame.
    pub fn read(&self) -> Result<VideoFrame, FrameReaderError> {
        let base = self.shmem.as_ptr();
        let total = self.shmem.len();
        if total < HEADER_LEN {
            return Err(FrameReaderError::Truncated);
        }
        let mut header = [0u8; HEADER_LEN];
        unsafe { std::ptr::copy_nonoverlapping(base, header.as_mut_ptr(), HEADER_LEN) };
        let sequence = u64::from_be_bytes(header[0..8].try_into().unwrap());
        let len = u64::from_be_bytes(header[8..16].try_into().unwrap()) as usize;
        let width = u32::from_be_bytes(header[16..20].try_into().unwrap());
        let height = u32::from_be_bytes(header[20..24].try_into().unwrap());
        if HEADER_LEN + len > total {
            return Err(FrameReaderError::Truncated);
        }
        let mut jpeg = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(base.add(HEADER_LEN), jpeg.as_mut_ptr(), len) };
        self.last_sequence.store(sequence, Ordering::Release);
        Ok(VideoFrame {
            sequence,
            jpeg,
            width,
            height,
            captured_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_frame(reader: &FrameReader, sequence: u64, payload: &[u8]) {
        write_frame_sized(reader, sequence, payload, 1920, 1080);
    }

    fn write_frame_sized(reader: &FrameReader, sequence: u64, payload: &[u8], width: u32, height: u32) {
        let base = reader.shmem.as_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(sequence.to_be_bytes().as_ptr(), base, 8);
            std::ptr::copy_nonoverlapping((payload.len() as u64).to_be_bytes().as_ptr(), base.add(8), 8);
            std::ptr::copy_nonoverlapping(width.to_be_bytes().as_ptr(), base.add(16), 4);
            std::ptr::copy_nonoverlapping(height.to_be_bytes().as_ptr(), base.add(20), 4);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), base.add(HEADER_LEN), payload.len());
        }
    }

    #[test]
    fn reads_back_a_written_frame() {
        let reader = FrameReader::attach_for_test();
        write_frame(&reader, 1, b"\xff\xd8fake-jpeg");
        let frame = reader.read().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.jpeg, b"\xff\xd8fake-jpeg");
        assert_eq!(frame.width, 1920);
        assert_eq!(frame.height, 1080);
    }

    #[test]
    fn is_active_false_once_closed_tombstone_written() {
        let reader = FrameReader::attach_for_test();
        write_frame(&reader, 1, b"x");
        assert!(reader.is_active());
        write_frame(&reader, CLOSED_SEQUENCE, b"");
        assert!(!reader.is_active());
    }

    #[tokio::test]
    async fn wait_times_out_when_no_new_frame_arrives() {
        let reader = FrameReader::attach_for_test();
        write_frame(&reader, 1, b"x");
        let _ = reader.read().unwrap();
        let err = reader.wait(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, FrameReaderError::WaitTimeout));
    }

    #[tokio::test]
    async fn wait_resolves_once_sequence_advances() {
        let reader = FrameReader::attach_for_test();
        write_frame(&reader, 1, b"x");
        let _ = reader.read().unwrap();
        write_frame(&reader, 2, b"y");
        reader.wait(Duration::from_millis(100)).await.unwrap();
    }
}
