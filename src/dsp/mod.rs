pub mod engine;
pub mod plugin;
pub mod registry;
pub mod smoothing;
pub mod stages;

pub use engine::{AnalysisFrame, DetectionFrame, PipelineEngine, TickOutput};
pub use plugin::{SignalDetector, SignalProcessor, StageSettings};
pub use registry::StageRegistry;

use rustfft::num_complex::Complex;
use serde::Serialize;
use thiserror::Error;

/// One labeled detection: a frequency in Hz mapped to its magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub frequency: f64,
    pub magnitude: f64,
}

/// Closed set of buffer types exchanged between pipeline stages.
#[derive(Debug, Clone)]
pub enum SignalBuffer {
    /// Raw integer PCM samples, the input to time-domain stages.
    Pcm(Vec<i16>),
    /// Real-valued magnitude or dB spectrum.
    Spectrum(Vec<f64>),
    /// Complex half-spectrum, for stages that need phase information.
    ComplexSpectrum(Vec<Complex<f64>>),
    /// Labeled detections produced by detector stages.
    Detections(Vec<Detection>),
}

impl SignalBuffer {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalBuffer::Pcm(_) => "Pcm",
            SignalBuffer::Spectrum(_) => "Spectrum",
            SignalBuffer::ComplexSpectrum(_) => "ComplexSpectrum",
            SignalBuffer::Detections(_) => "Detections",
        }
    }
}

/// How a stage's output bins map back to frequencies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum OutputScale {
    /// Linear bins: frequency = index * factor (Hz per bin).
    Factor(f64),
    /// Logarithmic bins: frequency = min * 2^(index / bins_per_octave).
    LogFrequency {
        min_frequency: f64,
        bins_per_octave: u32,
    },
}

impl OutputScale {
    pub fn bin_frequency(&self, index: usize) -> f64 {
        match *self {
            OutputScale::Factor(bin_width) => index as f64 * bin_width,
            OutputScale::LogFrequency {
                min_frequency,
                bins_per_octave,
            } => min_frequency * 2f64.powf(index as f64 / bins_per_octave as f64),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage expects {expected} input, got {got}")]
    UnsupportedInputKind {
        expected: &'static str,
        got: &'static str,
    },

    #[error("invalid value {value:?} for parameter {key}: {reason}")]
    InvalidParameterValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("short read from analysis stream: wanted {wanted} bytes, got {got}")]
    InsufficientSampleData { wanted: usize, got: usize },

    #[error("stage registry is still loading")]
    RegistryLoading,
}

/// Spectrum frame signalling "no data this tick". The orchestrator checks
/// element 0 and skips smoothing and gain computation when it is NaN or
/// infinite.
pub(crate) fn silence_sentinel(len: usize) -> Vec<f64> {
    let mut frame = vec![0.0; len.max(1)];
    frame[0] = f64::NAN;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_scale_doubles_every_octave() {
        let scale = OutputScale::LogFrequency {
            min_frequency: 32.7,
            bins_per_octave: 48,
        };
        assert!((scale.bin_frequency(0) - 32.7).abs() < 1e-9);
        assert!((scale.bin_frequency(48) - 65.4).abs() < 1e-9);
        assert!((scale.bin_frequency(96) - 130.8).abs() < 1e-9);
    }

    #[test]
    fn factor_scale_is_linear() {
        let scale = OutputScale::Factor(10.766);
        assert_eq!(scale.bin_frequency(0), 0.0);
        assert!((scale.bin_frequency(100) - 1076.6).abs() < 1e-9);
    }

    #[test]
    fn sentinel_is_detectable_at_index_zero() {
        let frame = silence_sentinel(240);
        assert_eq!(frame.len(), 240);
        assert!(frame[0].is_nan());
        assert_eq!(frame[1], 0.0);
    }
}
