use std::collections::BTreeMap;

use log::{debug, warn};
use serde::Serialize;

use super::plugin::{SignalDetector, SignalProcessor};
use super::registry::{StagePlugin, StageRegistry};
use super::smoothing::SpectrumSmoother;
use super::{Detection, OutputScale, PipelineError, SignalBuffer};
use crate::source::SourcePair;

/// Bytes pulled from the analysis stream per tick.
const DEFAULT_CHUNK_BYTES: usize = 16384;

/// Published result of the analysis phase: the smoothed spectrum and its
/// gain metrics.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisFrame {
    pub spectrum: Vec<f64>,
    pub scale: OutputScale,
    pub max_gain: f64,
    pub avg_gain: f64,
}

/// Published result of the detection phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionFrame {
    pub detections: Vec<Detection>,
    pub positions: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickOutput {
    pub analysis: Option<AnalysisFrame>,
    pub detection: DetectionFrame,
}

/// The active stage assembly, rebuilt atomically from each user selection.
/// Slot maps point into the registry; the split index is the slot of the
/// first primary detector (0 while none is found).
#[derive(Debug, Default)]
struct ActiveAssembly {
    processors: BTreeMap<usize, usize>,
    detectors: BTreeMap<usize, usize>,
    split_index: usize,
}

/// Drives the two-phase pipeline once per tick: spectral analysis below the
/// split index, feature detection from the split onward. Owns the assembly
/// and the smoothing history; stages are owned by the registry.
pub struct PipelineEngine {
    registry: StageRegistry,
    assembly: ActiveAssembly,
    smoother: SpectrumSmoother,
    chunk_bytes: usize,
    /// Un-smoothed output of the last analysis phase; detection starts here.
    processed: Option<(Vec<f64>, OutputScale)>,
}

impl PipelineEngine {
    pub fn new(registry: StageRegistry, smoothing_depth: usize) -> Self {
        Self {
            registry,
            assembly: ActiveAssembly::default(),
            smoother: SpectrumSmoother::new(smoothing_depth),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            processed: None,
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut StageRegistry {
        &mut self.registry
    }

    pub fn set_smoothing_depth(&mut self, depth: usize) {
        self.smoother.set_depth(depth);
    }

    pub fn set_chunk_bytes(&mut self, bytes: usize) {
        self.chunk_bytes = bytes.max(2);
    }

    /// Rebuilds the assembly from an ordered slot -> registry-index mapping.
    /// Selections referencing unknown registry entries model intentionally
    /// empty slots and are dropped without error. The smoothing history goes
    /// with the old assembly; spectra are not comparable across pipelines.
    pub fn apply_selection(
        &mut self,
        selection: &BTreeMap<usize, usize>,
    ) -> Result<(), PipelineError> {
        if !self.registry.is_ready() {
            return Err(PipelineError::RegistryLoading);
        }

        let mut assembly = ActiveAssembly::default();
        for (&slot, &registry_index) in selection {
            match self.registry.get(registry_index) {
                Some(StagePlugin::Processor(_)) => {
                    assembly.processors.insert(slot, registry_index);
                }
                Some(StagePlugin::Detector(detector)) => {
                    if detector.is_primary() && assembly.split_index == 0 {
                        assembly.split_index = slot;
                    }
                    assembly.detectors.insert(slot, registry_index);
                }
                None => {
                    debug!(
                        "selection slot {} references unknown stage {}; leaving slot empty",
                        slot, registry_index
                    );
                }
            }
        }

        debug!(
            "assembly applied: {} processors, {} detectors, split at slot {}",
            assembly.processors.len(),
            assembly.detectors.len(),
            assembly.split_index
        );
        self.assembly = assembly;
        self.smoother.clear();
        self.processed = None;
        Ok(())
    }

    /// Forces the analysis cursor to the sample equivalent of the playback
    /// position, then pulls one fixed-size chunk. Drift against the
    /// independently-clocked playback stream is corrected here every tick
    /// instead of being allowed to accumulate.
    fn read_synced_frame(&self, source: &mut SourcePair) -> Result<Vec<i16>, PipelineError> {
        let position_scale =
            source.playback.sample_rate() as f64 / source.analysis.sample_rate() as f64;
        let synced = (source.playback.position() as f64
            / position_scale
            / source.playback.channels() as f64) as u64;
        source.analysis.seek(synced);

        let mut bytes = vec![0u8; self.chunk_bytes];
        let got = source.analysis.read(&mut bytes);
        if got < bytes.len() {
            return Err(PipelineError::InsufficientSampleData {
                wanted: bytes.len(),
                got,
            });
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    /// Runs every processor slot below the split over one synchronized PCM
    /// frame. Returns None when there is nothing to display this tick: a
    /// short read, an empty assembly, or the stages' no-data sentinel.
    pub fn run_analysis_phase(&mut self, source: &mut SourcePair) -> Option<AnalysisFrame> {
        self.processed = None;

        let samples = match self.read_synced_frame(source) {
            Ok(samples) => samples,
            Err(e) => {
                debug!("analysis tick skipped: {}", e);
                return None;
            }
        };
        let sample_rate = source.analysis.sample_rate();

        let mut buffer = SignalBuffer::Pcm(samples);
        let mut scale = OutputScale::Factor(1.0);
        for (&slot, &registry_index) in &self.assembly.processors {
            if slot >= self.assembly.split_index {
                break;
            }
            match self.registry.get_mut(registry_index) {
                Some(StagePlugin::Processor(processor)) => {
                    match processor.process(&buffer, sample_rate) {
                        Ok((output, output_scale)) => {
                            buffer = output;
                            scale = output_scale;
                        }
                        Err(e @ PipelineError::UnsupportedInputKind { .. }) => {
                            warn!("processor in slot {} skipped: {}", slot, e);
                        }
                        Err(e) => {
                            warn!("analysis phase aborted at slot {}: {}", slot, e);
                            return None;
                        }
                    }
                }
                _ => {}
            }
        }

        let spectrum = match buffer {
            SignalBuffer::Spectrum(spectrum) if !spectrum.is_empty() => spectrum,
            other => {
                debug!("analysis ended with {} buffer; nothing to publish", other.kind());
                return None;
            }
        };

        // Detection reads the un-smoothed frame, sentinel or not.
        let sentinel = !spectrum[0].is_finite();
        self.processed = Some((spectrum.clone(), scale));
        if sentinel {
            return None;
        }

        let smoothed = self.smoother.smooth(&spectrum);
        let max_gain = smoothed.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg_gain = smoothed.iter().sum::<f64>() / smoothed.len() as f64;

        Some(AnalysisFrame {
            spectrum: smoothed,
            scale,
            max_gain,
            avg_gain,
        })
    }

    /// Chains slots from the split index to the end: processors keep
    /// transforming, detectors reduce to labeled detections and positional
    /// markers. The last detector's output is the published result; with no
    /// detectors the result is empty, which is not an error.
    pub fn run_detection_phase(&mut self, sample_rate: u32) -> DetectionFrame {
        let (spectrum, scale) = match &self.processed {
            Some((spectrum, scale)) => (spectrum.clone(), *scale),
            None => return DetectionFrame::default(),
        };

        let split = self.assembly.split_index;
        let mut slots: Vec<usize> = self
            .assembly
            .processors
            .range(split..)
            .map(|(&slot, _)| slot)
            .chain(self.assembly.detectors.range(split..).map(|(&slot, _)| slot))
            .collect();
        slots.sort_unstable();

        let mut buffer = SignalBuffer::Spectrum(spectrum);
        let mut positions = Vec::new();
        for slot in slots {
            if let Some(&registry_index) = self.assembly.processors.get(&slot) {
                if let Some(StagePlugin::Processor(processor)) =
                    self.registry.get_mut(registry_index)
                {
                    match processor.process(&buffer, sample_rate) {
                        Ok((output, _)) => buffer = output,
                        Err(e) => warn!("processor in slot {} skipped: {}", slot, e),
                    }
                }
            } else if let Some(&registry_index) = self.assembly.detectors.get(&slot) {
                if let Some(StagePlugin::Detector(detector)) =
                    self.registry.get_mut(registry_index)
                {
                    match detector.detect(&buffer, &scale) {
                        Ok(output) => {
                            buffer = output.buffer;
                            positions = output.positions;
                        }
                        Err(e) => warn!("detector in slot {} skipped: {}", slot, e),
                    }
                }
            }
        }

        match buffer {
            SignalBuffer::Detections(detections) => DetectionFrame {
                detections,
                positions,
            },
            _ => DetectionFrame::default(),
        }
    }

    /// One cooperative tick: analysis, then detection.
    pub fn run_tick(&mut self, source: &mut SourcePair) -> TickOutput {
        let analysis = self.run_analysis_phase(source);
        let detection = self.run_detection_phase(source.analysis.sample_rate());
        TickOutput {
            analysis,
            detection,
        }
    }
}
