use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, Source};

use super::{MemoryReader, SourcePair};

/// One audio file decoded into the two buffers the pipeline needs: the
/// interleaved playback stream at native rate, and a mono decimated analysis
/// stream that keeps per-tick transforms cheap.
pub struct FileSource {
    sample_rate: u32,
    channels: u16,
    samples: Arc<Vec<i16>>,
    analysis_samples: Arc<Vec<i16>>,
    analysis_rate: u32,
}

impl FileSource {
    pub fn load<P: AsRef<Path>>(path: P, decimation: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        );
        let source =
            Decoder::new(file).with_context(|| format!("decoding {}", path.display()))?;

        let sample_rate = source.sample_rate();
        let channels = source.channels().max(1);
        let samples: Vec<i16> = source.convert_samples().collect();

        let decimation = decimation.max(1);
        let mono: Vec<i16> = samples
            .chunks_exact(channels as usize)
            .map(|frame| {
                (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16
            })
            .collect();
        let analysis_samples: Vec<i16> = mono.iter().step_by(decimation as usize).copied().collect();
        let analysis_rate = sample_rate / decimation;

        info!(
            "loaded {}: {} Hz, {} ch, {} samples; analysis stream {} Hz, {} samples",
            path.display(),
            sample_rate,
            channels,
            samples.len(),
            analysis_rate,
            analysis_samples.len()
        );

        Ok(Self {
            sample_rate,
            channels,
            samples: Arc::new(samples),
            analysis_samples: Arc::new(analysis_samples),
            analysis_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn analysis_rate(&self) -> u32 {
        self.analysis_rate
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / (self.sample_rate as f64 * self.channels as f64)
    }

    /// Reader pair for the pipeline. The playback side follows `cursor`,
    /// which the playback sink advances as audio is rendered.
    pub fn source_pair(&self, cursor: Arc<AtomicU64>) -> SourcePair {
        SourcePair {
            playback: Box::new(MemoryReader::with_shared_cursor(
                self.samples.clone(),
                self.sample_rate,
                self.channels,
                cursor,
            )),
            analysis: Box::new(MemoryReader::new(
                self.analysis_samples.clone(),
                self.analysis_rate,
                1,
            )),
        }
    }

    pub(crate) fn playback_buffer(&self) -> SamplesBuffer<i16> {
        SamplesBuffer::new(self.channels, self.sample_rate, self.samples.as_ref().clone())
    }
}
