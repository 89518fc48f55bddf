use log::debug;
use rustfft::{num_complex::Complex, FftPlanner};

use super::{hamming, to_db_absolute, to_db_relative, MIN_AMPLITUDE};
use crate::dsp::plugin::{ParameterSpec, PipelineStage, SignalProcessor, StageSettings};
use crate::dsp::{silence_sentinel, OutputScale, PipelineError, SignalBuffer};

/// Kernel coefficients with both |re| and |im| below this are zeroed to keep
/// the projection sparse.
const SPARSITY_THRESHOLD: f64 = 0.0054;
const KERNEL_GAIN: f64 = 1000.0;
const DB_FLOOR: f64 = -120.0;

/// Sparse-kernel Constant-Q Transform. Frequency bins are spaced
/// logarithmically with a constant frequency-to-bandwidth ratio Q, trading
/// linear-FFT resolution for musical-interval resolution.
pub struct CqtProcessor {
    settings: StageSettings,
    planner: FftPlanner<f64>,
    kernel: Option<CqtKernel>,
}

/// Projection matrix in conjugate-transposed sparse-column form: column k
/// holds the nonzero (fft bin, coefficient) pairs for CQ bin k.
struct CqtKernel {
    columns: Vec<Vec<(usize, Complex<f64>)>>,
    rows: usize,
    sample_rate: u32,
}

impl CqtProcessor {
    pub fn new() -> Self {
        Self {
            settings: StageSettings::new(vec![
                ParameterSpec::int("OCTAVES", "Octaves", "5", 1, 10),
                ParameterSpec::options("BINS_PER_OCTAVE", "Bins Per Octave", "48", "12|24|48|96"),
                ParameterSpec::double("MIN_FREQ", "Minimum Frequency (Hz)", "32.7", 1.0, 1000.0),
                ParameterSpec::double("N_WEIGHTING", "Frequency Weighting Factor", "0.5", 0.0, 1.0),
                ParameterSpec::options("OUTPUT_MODE", "Output Mode", "Magnitude", "Magnitude|dB"),
                ParameterSpec::options("DB_REFERENCE", "dB Reference", "Relative", "Relative|Absolute"),
            ]),
            planner: FftPlanner::new(),
            kernel: None,
        }
    }

    fn build_kernel(&mut self, sample_rate: u32) -> Result<CqtKernel, PipelineError> {
        let octaves = self.settings.int("OCTAVES")? as u32;
        let bins_per_octave = self.settings.int("BINS_PER_OCTAVE")? as u32;
        let min_freq = self.settings.double("MIN_FREQ")?;
        let weighting = self.settings.double("N_WEIGHTING")?;

        let num_bins = (octaves * bins_per_octave) as usize;
        let q = 1.0 / (2f64.powf(1.0 / bins_per_octave as f64) - 1.0);

        let mut fft_len = 1usize;
        while (fft_len as f64) < q * sample_rate as f64 / min_freq {
            fft_len *= 2;
        }

        let fft = self.planner.plan_fft_forward(fft_len);
        let gain = KERNEL_GAIN * (1.0 + weighting * KERNEL_GAIN);

        let mut columns = vec![Vec::new(); num_bins];
        let mut row = vec![Complex::new(0.0, 0.0); fft_len];
        for (k, column) in columns.iter_mut().enumerate() {
            let f_k = min_freq * 2f64.powf(k as f64 / bins_per_octave as f64);
            let window_len = ((q * sample_rate as f64 / f_k).ceil() as usize).min(fft_len);

            row.fill(Complex::new(0.0, 0.0));
            let norm = window_len as f64 * (1.0 + weighting * window_len as f64);
            for n in 0..window_len {
                let amp = hamming(n, window_len) / norm * gain;
                let phase = -2.0 * std::f64::consts::PI * n as f64 * (q / window_len as f64);
                row[n] = Complex::from_polar(amp, phase);
            }

            // Forward FFT, normalized by 1/N; the sparsity threshold assumes
            // normalized coefficients.
            fft.process(&mut row);
            for coef in row.iter_mut() {
                *coef /= fft_len as f64;
            }

            for (i, coef) in row.iter().enumerate() {
                if coef.re.abs() < SPARSITY_THRESHOLD && coef.im.abs() < SPARSITY_THRESHOLD {
                    continue;
                }
                // Conjugate transpose of the row matrix, scaled once here
                // instead of in a second pass over the assembled matrix.
                column.push((i, coef.conj() * KERNEL_GAIN));
            }
        }

        Ok(CqtKernel {
            columns,
            rows: fft_len,
            sample_rate,
        })
    }
}

impl Default for CqtProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStage for CqtProcessor {
    fn name(&self) -> &'static str {
        "Constant-Q Transform"
    }

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut StageSettings {
        &mut self.settings
    }

    fn on_settings_change(&mut self) {
        self.kernel = None;
    }
}

impl SignalProcessor for CqtProcessor {
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

        let needs_rebuild = self
            .kernel
            .as_ref()
            .map_or(true, |k| k.sample_rate != sample_rate);
        if needs_rebuild {
            let kernel = self.build_kernel(sample_rate)?;
            let nonzero: usize = kernel.columns.iter().map(Vec::len).sum();
            debug!(
                "CQT kernel built: {} rows x {} bins, {} nonzero coefficients",
                kernel.rows,
                kernel.columns.len(),
                nonzero
            );
            self.kernel = Some(kernel);
        }
        let kernel = self.kernel.as_ref().expect("kernel built above");

        let scale = OutputScale::LogFrequency {
            min_frequency: self.settings.double("MIN_FREQ")?,
            bins_per_octave: self.settings.int("BINS_PER_OCTAVE")? as u32,
        };

        // Zero-pad or truncate the input to the kernel's row count; the
        // kernel is never truncated to fit a short frame.
        let mut samples = pcm.clone();
        samples.resize(kernel.rows, 0);

        let mut fft_points = 2usize;
        while fft_points * 2 <= samples.len() {
            fft_points *= 2;
        }

        let mut frame: Vec<Complex<f64>> = (0..fft_points)
            .map(|n| Complex::new(samples[n] as f64 * hamming(n, fft_points), 0.0))
            .collect();
        let fft = self.planner.plan_fft_forward(fft_points);
        fft.process(&mut frame);
        for value in frame.iter_mut() {
            *value /= fft_points as f64;
        }

        let mut mags: Vec<f64> = kernel
            .columns
            .iter()
            .map(|column| {
                let mut acc = Complex::new(0.0, 0.0);
                for &(i, coef) in column {
                    if let Some(v) = frame.get(i) {
                        acc += v * coef;
                    }
                }
                acc.norm()
            })
            .collect();

        if self.settings.value("OUTPUT_MODE") == "dB" {
            let max = mags.iter().cloned().fold(0.0, f64::max);
            if max <= MIN_AMPLITUDE {
                // Silence cannot be expressed in frame-relative dB; hand the
                // orchestrator its no-data sentinel instead of -Infinity.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cqt() -> CqtProcessor {
        let mut cqt = CqtProcessor::new();
        cqt.settings_mut().set("OCTAVES", "3").unwrap();
        cqt.settings_mut().set("BINS_PER_OCTAVE", "24").unwrap();
        cqt.settings_mut().set("MIN_FREQ", "110").unwrap();
        cqt.on_settings_change();
        cqt
    }

    fn sine_pcm(freq: f64, sample_rate: u32, len: usize) -> Vec<i16> {
        (0..len)
            .map(|n| {
                let phase = 2.0 * std::f64::consts::PI * freq * n as f64 / sample_rate as f64;
                (phase.sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn kernel_dimensions_follow_configuration() {
        let mut cqt = small_cqt();
        let kernel = cqt.build_kernel(8000).unwrap();

        let q = 1.0 / (2f64.powf(1.0 / 24.0) - 1.0);
        let min_len = q * 8000.0 / 110.0;
        assert!(kernel.rows.is_power_of_two());
        assert!(kernel.rows as f64 >= min_len);
        assert!(((kernel.rows / 2) as f64) < min_len);
        assert_eq!(kernel.columns.len(), 3 * 24);
    }

    #[test]
    fn sine_peaks_in_nearest_bin() {
        let mut cqt = small_cqt();
        let input = SignalBuffer::Pcm(sine_pcm(220.0, 8000, 4096));
        let (output, scale) = cqt.process(&input, 8000).unwrap();

        let spectrum = match output {
            SignalBuffer::Spectrum(s) => s,
            other => panic!("unexpected output {}", other.kind()),
        };
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();

        // The winning bin's center must be within half a bin of 220 Hz.
        let offset_bins = (scale.bin_frequency(peak) / 220.0).log2() * 24.0;
        assert!(
            offset_bins.abs() <= 0.5,
            "peak bin {} is {:.2} bins away from 220 Hz",
            peak,
            offset_bins
        );
    }

    #[test]
    fn silence_in_db_mode_yields_sentinel() {
        let mut cqt = small_cqt();
        cqt.settings_mut().set("OUTPUT_MODE", "dB").unwrap();
        cqt.on_settings_change();

        let input = SignalBuffer::Pcm(vec![0; 4096]);
        let (output, _) = cqt.process(&input, 8000).unwrap();
        match output {
            SignalBuffer::Spectrum(s) => assert!(s[0].is_nan()),
            other => panic!("unexpected output {}", other.kind()),
        }
    }

    #[test]
    fn silence_in_magnitude_mode_is_all_zero() {
        let mut cqt = small_cqt();
        let input = SignalBuffer::Pcm(vec![0; 4096]);
        let (output, _) = cqt.process(&input, 8000).unwrap();
        match output {
            SignalBuffer::Spectrum(s) => assert!(s.iter().all(|&v| v == 0.0)),
            other => panic!("unexpected output {}", other.kind()),
        }
    }

    #[test]
    fn short_input_is_zero_padded_not_rejected() {
        let mut cqt = small_cqt();
        let input = SignalBuffer::Pcm(sine_pcm(220.0, 8000, 1024));
        let (output, _) = cqt.process(&input, 8000).unwrap();
        match output {
            SignalBuffer::Spectrum(s) => assert_eq!(s.len(), 3 * 24),
            other => panic!("unexpected output {}", other.kind()),
        }
    }

    #[test]
    fn spectrum_input_is_unsupported() {
        let mut cqt = small_cqt();
        let err = cqt
            .process(&SignalBuffer::Spectrum(vec![1.0]), 8000)
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedInputKind { .. }));
    }

    #[test]
    fn settings_change_invalidates_kernel() {
        let mut cqt = small_cqt();
        let input = SignalBuffer::Pcm(sine_pcm(220.0, 8000, 2048));
        cqt.process(&input, 8000).unwrap();
        assert!(cqt.kernel.is_some());

        cqt.settings_mut().set("OCTAVES", "2").unwrap();
        cqt.on_settings_change();
        assert!(cqt.kernel.is_none());

        let (output, _) = cqt.process(&input, 8000).unwrap();
        match output {
            SignalBuffer::Spectrum(s) => assert_eq!(s.len(), 2 * 24),
            other => panic!("unexpected output {}", other.kind()),
        }
    }

    #[test]
    fn sample_rate_change_rebuilds_kernel() {
        let mut cqt = small_cqt();
        let input = SignalBuffer::Pcm(sine_pcm(220.0, 8000, 2048));
        cqt.process(&input, 8000).unwrap();
        let rows_8k = cqt.kernel.as_ref().unwrap().rows;

        cqt.process(&input, 16000).unwrap();
        let rows_16k = cqt.kernel.as_ref().unwrap().rows;
        assert_eq!(rows_16k, rows_8k * 2);
    }
}
