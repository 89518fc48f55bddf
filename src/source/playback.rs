use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::info;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};

use super::file::FileSource;

/// Wraps a playback source and counts every sample the sink pulls, making
/// the shared cursor the authoritative playback position.
pub struct TrackedSource<S> {
    inner: S,
    cursor: Arc<AtomicU64>,
}

impl<S> TrackedSource<S> {
    pub fn new(inner: S, cursor: Arc<AtomicU64>) -> Self {
        Self { inner, cursor }
    }
}

impl<S> Iterator for TrackedSource<S>
where
    S: Source<Item = i16>,
{
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        let sample = self.inner.next();
        if sample.is_some() {
            self.cursor.fetch_add(1, Ordering::Relaxed);
        }
        sample
    }
}

impl<S> Source for TrackedSource<S>
where
    S: Source<Item = i16>,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

/// Audio output transport. Analysis only needs the cursor; everything else
/// here is plain playback control.
pub struct Playback {
    #[allow(dead_code)]
    stream: OutputStream,
    stream_handle: OutputStreamHandle,
    sink: Option<Sink>,
    cursor: Arc<AtomicU64>,
}

impl Playback {
    pub fn new() -> Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()?;
        Ok(Self {
            stream,
            stream_handle,
            sink: None,
            cursor: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The shared playback cursor, counted in interleaved samples.
    pub fn cursor(&self) -> Arc<AtomicU64> {
        self.cursor.clone()
    }

    pub fn start_file(&mut self, file: &FileSource) -> Result<()> {
        let sink = Sink::try_new(&self.stream_handle)?;
        self.cursor.store(0, Ordering::Relaxed);
        sink.append(TrackedSource::new(file.playback_buffer(), self.cursor.clone()));
        self.sink = Some(sink);
        info!("audio playback started");
        Ok(())
    }

    pub fn pause(&self) {
        if let Some(sink) = &self.sink {
            sink.pause();
            info!("audio playback paused");
        }
    }

    pub fn resume(&self) {
        if let Some(sink) = &self.sink {
            sink.play();
        }
    }

    pub fn stop(&self) {
        if let Some(sink) = &self.sink {
            sink.stop();
            info!("audio playback stopped");
        }
    }

    pub fn set_volume(&self, volume: f32) {
        if let Some(sink) = &self.sink {
            sink.set_volume(volume.clamp(0.0, 1.0));
        }
    }

    pub fn is_playing(&self) -> bool {
        self.sink.as_ref().map_or(false, |sink| !sink.is_paused())
    }

    pub fn is_finished(&self) -> bool {
        self.sink.as_ref().map_or(true, |sink| sink.empty())
    }
}
