use rustfft::{num_complex::Complex, FftPlanner};

use super::{hamming, to_db_absolute, to_db_relative, MIN_AMPLITUDE};
use crate::dsp::plugin::{ParameterSpec, PipelineStage, SignalProcessor, StageSettings};
use crate::dsp::{silence_sentinel, OutputScale, PipelineError, SignalBuffer};

const DB_FLOOR: f64 = -120.0;

/// Plain windowed FFT over raw PCM. Linear bins, so the output scale is the
/// constant bin width in Hz.
pub struct FftProcessor {
    settings: StageSettings,
    planner: FftPlanner<f64>,
}

impl FftProcessor {
    pub fn new() -> Self {
        Self {
            settings: StageSettings::new(vec![
                ParameterSpec::options("WINDOW_SIZE", "Window Size", "4096", "1024|2048|4096|8192"),
                ParameterSpec::options("OUTPUT_MODE", "Output Mode", "Magnitude", "Magnitude|dB|Complex"),
                ParameterSpec::options("DB_REFERENCE", "dB Reference", "Relative", "Relative|Absolute"),
            ]),
            planner: FftPlanner::new(),
        }
    }
}

impl Default for FftProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStage for FftProcessor {
    fn name(&self) -> &'static str {
        "Fourier Transform"
    }

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut StageSettings {
        &mut self.settings
    }
}

impl SignalProcessor for FftProcessor {
    fn process(
        &mut self,
        input: &SignalBuffer,
        sample_rate: u32,
    ) -> Result<(SignalBuffer, OutputScale), PipelineError> {
        let pcm = match input {
            SignalBuffer::Pcm(samples) => samples,
            other => {
                return Err(PipelineError::UnsupportedInputKind {
                    expected: "Pcm",
                    got: other.kind(),
                })
            }
        };

        let window_size = self.settings.int("WINDOW_SIZE")? as usize;
        let scale = OutputScale::Factor(sample_rate as f64 / window_size as f64);

        let mut frame: Vec<Complex<f64>> = (0..window_size)
            .map(|n| {
                let sample = pcm.get(n).copied().unwrap_or(0) as f64 / i16::MAX as f64;
                Complex::new(sample * hamming(n, window_size), 0.0)
            })
            .collect();
        let fft = self.planner.plan_fft_forward(window_size);
        fft.process(&mut frame);

        // Only the first half carries information for real input.
        let half = &frame[..window_size / 2];

        if self.settings.value("OUTPUT_MODE") == "Complex" {
            return Ok((SignalBuffer::ComplexSpectrum(half.to_vec()), scale));
        }

        let mut mags: Vec<f64> = half
            .iter()
            .map(|c| c.norm() * 2.0 / window_size as f64)
            .collect();

        if self.settings.value("OUTPUT_MODE") == "dB" {
            let max = mags.iter().cloned().fold(0.0, f64::max);
            if max <= MIN_AMPLITUDE {
                return Ok((SignalBuffer::Spectrum(silence_sentinel(mags.len())), scale));
            }
            match self.settings.value("DB_REFERENCE") {
                "Absolute" => to_db_absolute(&mut mags, DB_FLOOR),
                _ => to_db_relative(&mut mags),
            }
        }

        Ok((SignalBuffer::Spectrum(mags), scale))
    }
}
