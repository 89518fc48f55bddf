pub mod capture;
pub mod file;
pub mod playback;

pub use capture::CaptureSource;
pub use file::FileSource;
pub use playback::Playback;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A bounded, promptly-returning PCM reader. Positions are counted in
/// interleaved samples.
pub trait PcmReader: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn position(&self) -> u64;
    fn seek(&mut self, sample: u64);

    /// Reads raw little-endian i16 PCM into `buf` and advances the cursor.
    /// Returns the number of bytes written, short near end of stream.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// The two independently positioned streams the pipeline reads: the playback
/// reader's position is authoritative, the analysis reader is re-seeked from
/// it every tick.
pub struct SourcePair {
    pub playback: Box<dyn PcmReader>,
    pub analysis: Box<dyn PcmReader>,
}

enum Cursor {
    Local(u64),
    /// Driven externally, e.g. by the playback sink pulling samples.
    Shared(Arc<AtomicU64>),
}

/// PCM reader over a decoded in-memory buffer.
pub struct MemoryReader {
    samples: Arc<Vec<i16>>,
    sample_rate: u32,
    channels: u16,
    cursor: Cursor,
}

impl MemoryReader {
    pub fn new(samples: Arc<Vec<i16>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            cursor: Cursor::Local(0),
        }
    }

    pub fn with_shared_cursor(
        samples: Arc<Vec<i16>>,
        sample_rate: u32,
        channels: u16,
        cursor: Arc<AtomicU64>,
    ) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            cursor: Cursor::Shared(cursor),
        }
    }
}

impl PcmReader for MemoryReader {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn position(&self) -> u64 {
        match &self.cursor {
            Cursor::Local(pos) => *pos,
            Cursor::Shared(pos) => pos.load(Ordering::Relaxed),
        }
    }

    fn seek(&mut self, sample: u64) {
        match &mut self.cursor {
            Cursor::Local(pos) => *pos = sample,
            Cursor::Shared(pos) => pos.store(sample, Ordering::Relaxed),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let start = (self.position() as usize).min(self.samples.len());
        let wanted = buf.len() / 2;
        let count = wanted.min(self.samples.len() - start);

        for (i, &sample) in self.samples[start..start + count].iter().enumerate() {
            let bytes = sample.to_le_bytes();
            buf[i * 2] = bytes[0];
            buf[i * 2 + 1] = bytes[1];
        }
        self.seek((start + count) as u64);
        count * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(samples: Vec<i16>) -> MemoryReader {
        MemoryReader::new(Arc::new(samples), 11025, 1)
    }

    #[test]
    fn reads_little_endian_bytes() {
        let mut r = reader(vec![1, -2, 300]);
        let mut buf = [0u8; 6];
        assert_eq!(r.read(&mut buf), 6);
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), 1);
        assert_eq!(i16::from_le_bytes([buf[2], buf[3]]), -2);
        assert_eq!(i16::from_le_bytes([buf[4], buf[5]]), 300);
        assert_eq!(r.position(), 3);
    }

    #[test]
    fn short_read_near_end_of_stream() {
        let mut r = reader(vec![0; 10]);
        r.seek(8);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf), 4);
        assert_eq!(r.position(), 10);
    }

    #[test]
    fn seek_past_end_reads_nothing() {
        let mut r = reader(vec![0; 4]);
        r.seek(100);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf), 0);
    }

    #[test]
    fn shared_cursor_tracks_external_writes() {
        let cursor = Arc::new(AtomicU64::new(0));
        let r = MemoryReader::with_shared_cursor(Arc::new(vec![0; 100]), 44100, 2, cursor.clone());
        cursor.store(48, Ordering::Relaxed);
        assert_eq!(r.position(), 48);
    }
}
