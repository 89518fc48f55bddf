pub mod cqt;
pub mod fft;
pub mod notes;
pub mod peaks;

pub use cqt::CqtProcessor;
pub use fft::FftProcessor;
pub use notes::NoteDetector;
pub use peaks::PeakDetector;

/// Floor applied before dB conversion so silent bins cannot emit -Infinity
/// into the smoothing history.
pub(crate) const MIN_AMPLITUDE: f64 = 1e-10;

pub(crate) fn hamming(n: usize, len: usize) -> f64 {
    if len < 2 {
        return 1.0;
    }
    0.54 - 0.46 * (2.0 * std::f64::consts::PI * n as f64 / (len - 1) as f64).cos()
}

/// Converts magnitudes to dB in place, normalized so the maximum bin sits at
/// 0 dB. Callers must reject all-zero frames before converting.
pub(crate) fn to_db_relative(mags: &mut [f64]) {
    let max = mags.iter().cloned().fold(0.0, f64::max);
    let max_db = 20.0 * max.max(MIN_AMPLITUDE).log10();
    for m in mags.iter_mut() {
        *m = 20.0 * m.max(MIN_AMPLITUDE).log10() - max_db;
    }
}

/// Converts magnitudes to absolute dB in place, clamped at `floor_db`.
pub(crate) fn to_db_absolute(mags: &mut [f64], floor_db: f64) {
    for m in mags.iter_mut() {
        *m = (20.0 * m.max(MIN_AMPLITUDE).log10()).max(floor_db);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_window_endpoints() {
        assert!((hamming(0, 512) - 0.08).abs() < 1e-9);
        assert!((hamming(511, 512) - 0.08).abs() < 1e-9);
        assert!((hamming(255, 511) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn relative_db_peaks_at_zero() {
        let mut mags = vec![0.5, 1.0, 0.25];
        to_db_relative(&mut mags);
        assert_eq!(mags[1], 0.0);
        assert!((mags[0] - (-6.02)).abs() < 0.01);
        assert!(mags[2] < mags[0]);
    }

    #[test]
    fn absolute_db_respects_floor() {
        let mut mags = vec![0.0, 1.0];
        to_db_absolute(&mut mags, -120.0);
        assert_eq!(mags[0], -120.0);
        assert_eq!(mags[1], 0.0);
    }
}
