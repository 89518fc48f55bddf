use crate::dsp::plugin::{
    DetectionOutput, ParameterSpec, PipelineStage, SignalDetector, StageSettings,
};
use crate::dsp::{Detection, OutputScale, PipelineError, SignalBuffer};

/// Picks spectral peaks above an adaptive threshold. Primary detector: its
/// slot marks where spectral analysis ends and feature detection begins.
pub struct PeakDetector {
    settings: StageSettings,
}

impl PeakDetector {
    pub fn new() -> Self {
        Self {
            settings: StageSettings::new(vec![
                ParameterSpec::int("MAX_PEAKS", "Maximum Peaks", "8", 1, 50),
                ParameterSpec::double("THRESHOLD_SIGMA", "Threshold (std devs)", "1.5", 0.0, 10.0),
            ]),
        }
    }
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStage for PeakDetector {
    fn name(&self) -> &'static str {
        "Spectral Peaks"
    }

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut StageSettings {
        &mut self.settings
    }
}

impl SignalDetector for PeakDetector {
    fn is_primary(&self) -> bool {
        true
    }

    fn detect(
        &mut self,
        input: &SignalBuffer,
        scale: &OutputScale,
    ) -> Result<DetectionOutput, PipelineError> {
        let spectrum = match input {
            SignalBuffer::Spectrum(s) => s,
            other => {
                return Err(PipelineError::UnsupportedInputKind {
                    expected: "Spectrum",
                    got: other.kind(),
                })
            }
        };

        let empty = || DetectionOutput {
            buffer: SignalBuffer::Detections(Vec::new()),
            positions: Vec::new(),
        };

        // A no-data frame carries the NaN/Infinity sentinel at index 0.
        if spectrum.len() < 3 || !spectrum[0].is_finite() {
            return Ok(empty());
        }

        let max_peaks = self.settings.int("MAX_PEAKS")? as usize;
        let sigma = self.settings.double("THRESHOLD_SIGMA")?;

        let mean = spectrum.iter().sum::<f64>() / spectrum.len() as f64;
        let variance = spectrum.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (spectrum.len() - 1) as f64;
        let threshold = mean + sigma * variance.sqrt();

        let mut peaks: Vec<(usize, f64)> = spectrum
            .windows(3)
            .enumerate()
            .filter(|(_, w)| w[0] < w[1] && w[1] >= w[2] && w[1] > threshold)
            .map(|(i, w)| (i + 1, w[1]))
            .collect();

        peaks.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        peaks.truncate(max_peaks);

        let positions = peaks.iter().map(|&(bin, _)| bin as f64).collect();
        let detections = peaks
            .into_iter()
            .map(|(bin, magnitude)| Detection {
                frequency: scale.bin_frequency(bin),
                magnitude,
            })
            .collect();

        Ok(DetectionOutput {
            buffer: SignalBuffer::Detections(detections),
            positions,
        })
    }
}
