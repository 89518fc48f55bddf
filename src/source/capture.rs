use std::sync::{Arc, Mutex};

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};

use super::{PcmReader, SourcePair};

/// Live input source. The capture callback downmixes to mono and hands
/// chunks over a channel; `drain` appends them to the capture buffer on the
/// orchestrator's thread. The write head doubles as the playback cursor, so
/// the sync formula degenerates to identity (same rate, one channel).
pub struct CaptureSource {
    #[allow(dead_code)]
    stream: Stream,
    receiver: Receiver<Vec<f32>>,
    captured: Arc<Mutex<Vec<i16>>>,
    sample_rate: u32,
}

impl CaptureSource {
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No input device available"))?;

        let config = device
            .default_input_config()
            .map_err(|e| anyhow::anyhow!("Failed to get default input config: {}", e))?;

        info!(
            "Using capture device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let sample_rate = config.sample_rate().0;
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stream = Self::create_input_stream(&device, &config.into(), sender)?;
        stream.play()?;

        Ok(Self {
            stream,
            receiver,
            captured: Arc::new(Mutex::new(Vec::new())),
            sample_rate,
        })
    }

    fn create_input_stream(
        device: &Device,
        config: &StreamConfig,
        sender: Sender<Vec<f32>>,
    ) -> Result<Stream> {
        let channels = config.channels as usize;

        let stream = device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono_data: Vec<f32> = if channels == 1 {
                    data.to_vec()
                } else {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                };

                if sender.send(mono_data).is_err() {
                    warn!("Failed to send captured audio");
                }
            },
            |err| {
                warn!("Capture stream error: {}", err);
            },
            None,
        )?;

        Ok(stream)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Moves pending capture chunks into the shared buffer. Called once per
    /// tick before reading.
    pub fn drain(&self) {
        let mut captured = self.captured.lock().unwrap();
        while let Ok(chunk) = self.receiver.try_recv() {
            captured.extend(
                chunk
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
            );
        }
    }

    pub fn source_pair(&self) -> SourcePair {
        SourcePair {
            playback: Box::new(CaptureReader {
                captured: self.captured.clone(),
                sample_rate: self.sample_rate,
                pos: 0,
                write_head: true,
            }),
            analysis: Box::new(CaptureReader {
                captured: self.captured.clone(),
                sample_rate: self.sample_rate,
                pos: 0,
                write_head: false,
            }),
        }
    }
}

struct CaptureReader {
    captured: Arc<Mutex<Vec<i16>>>,
    sample_rate: u32,
    pos: u64,
    /// The playback-side view reports the buffer's write head as its
    /// position instead of a read cursor.
    write_head: bool,
}

impl PcmReader for CaptureReader {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        1
    }

    fn position(&self) -> u64 {
        if self.write_head {
            self.captured.lock().unwrap().len() as u64
        } else {
            self.pos
        }
    }

    fn seek(&mut self, sample: u64) {
        self.pos = sample;
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let captured = self.captured.lock().unwrap();
        let start = (self.pos as usize).min(captured.len());
        let count = (buf.len() / 2).min(captured.len() - start);

        for (i, &sample) in captured[start..start + count].iter().enumerate() {
            let bytes = sample.to_le_bytes();
            buf[i * 2] = bytes[0];
            buf[i * 2 + 1] = bytes[1];
        }
        self.pos = (start + count) as u64;
        count * 2
    }
}
