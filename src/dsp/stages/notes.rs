use std::collections::BTreeMap;

use crate::dsp::plugin::{
    DetectionOutput, ParameterSpec, PipelineStage, SignalDetector, StageSettings,
};
use crate::dsp::{Detection, OutputScale, PipelineError, SignalBuffer};

/// Snaps spectral peaks to the nearest equal-tempered pitch, producing note
/// candidates. Positions carry the signed cent offset of each peak from the
/// pitch it was snapped to.
pub struct NoteDetector {
    settings: StageSettings,
}

impl NoteDetector {
    pub fn new() -> Self {
        Self {
            settings: StageSettings::new(vec![ParameterSpec::double(
                "A4_PITCH",
                "A4 Reference Pitch (Hz)",
                "440",
                415.0,
                466.0,
            )]),
        }
    }
}

impl Default for NoteDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStage for NoteDetector {
    fn name(&self) -> &'static str {
        "Note Candidates"
    }

    fn settings(&self) -> &StageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut StageSettings {
        &mut self.settings
    }
}

impl SignalDetector for NoteDetector {
    fn detect(
        &mut self,
        input: &SignalBuffer,
        _scale: &OutputScale,
    ) -> Result<DetectionOutput, PipelineError> {
        let peaks = match input {
            SignalBuffer::Detections(d) => d,
            other => {
                return Err(PipelineError::UnsupportedInputKind {
                    expected: "Detections",
                    got: other.kind(),
                })
            }
        };

        let a4 = self.settings.double("A4_PITCH")?;

        // Strongest magnitude and its cent offset per semitone number.
        let mut notes: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
        for peak in peaks {
            if peak.frequency <= 0.0 {
                continue;
            }
            let midi = 69.0 + 12.0 * (peak.frequency / a4).log2();
            let nearest = midi.round();
            let cents = (midi - nearest) * 100.0;
            let entry = notes
                .entry(nearest as i64)
                .or_insert((peak.magnitude, cents));
            if peak.magnitude > entry.0 {
                *entry = (peak.magnitude, cents);
            }
        }

        let mut detections = Vec::with_capacity(notes.len());
        let mut positions = Vec::with_capacity(notes.len());
        for (semitone, (magnitude, cents)) in notes {
            detections.push(Detection {
                frequency: a4 * 2f64.powf((semitone - 69) as f64 / 12.0),
                magnitude,
            });
            positions.push(cents);
        }

        Ok(DetectionOutput {
            buffer: SignalBuffer::Detections(detections),
            positions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(peaks: Vec<Detection>) -> DetectionOutput {
        NoteDetector::new()
            .detect(&SignalBuffer::Detections(peaks), &OutputScale::Factor(1.0))
            .unwrap()
    }

    #[test]
    fn snaps_flat_a_to_a4() {
        let out = detect(vec![Detection {
            frequency: 439.0,
            magnitude: 1.0,
        }]);
        match out.buffer {
            SignalBuffer::Detections(d) => {
                assert_eq!(d.len(), 1);
                assert!((d[0].frequency - 440.0).abs() < 1e-9);
            }
            other => panic!("unexpected output {}", other.kind()),
        }
        // 439 Hz is a few cents below A4.
        assert!(out.positions[0] < 0.0);
        assert!(out.positions[0] > -10.0);
    }

    #[test]
    fn merges_peaks_on_the_same_semitone() {
        let out = detect(vec![
            Detection {
                frequency: 438.0,
                magnitude: 0.4,
            },
            Detection {
                frequency: 441.0,
                magnitude: 0.9,
            },
        ]);
        match out.buffer {
            SignalBuffer::Detections(d) => {
                assert_eq!(d.len(), 1);
                assert!((d[0].magnitude - 0.9).abs() < 1e-9);
            }
            other => panic!("unexpected output {}", other.kind()),
        }
        // The stronger 441 Hz peak wins, so the offset is positive.
        assert!(out.positions[0] > 0.0);
    }

    #[test]
    fn output_is_sorted_by_frequency() {
        let out = detect(vec![
            Detection {
                frequency: 880.0,
                magnitude: 0.5,
            },
            Detection {
                frequency: 220.0,
                magnitude: 0.5,
            },
        ]);
        match out.buffer {
            SignalBuffer::Detections(d) => {
                assert_eq!(d.len(), 2);
                assert!(d[0].frequency < d[1].frequency);
            }
            other => panic!("unexpected output {}", other.kind()),
        }
    }

    #[test]
    fn alternate_reference_pitch_shifts_candidates() {
        let mut detector = NoteDetector::new();
        detector.settings_mut().set("A4_PITCH", "432").unwrap();
        let out = detector
            .detect(
                &SignalBuffer::Detections(vec![Detection {
                    frequency: 432.0,
                    magnitude: 1.0,
                }]),
                &OutputScale::Factor(1.0),
            )
            .unwrap();
        match out.buffer {
            SignalBuffer::Detections(d) => assert!((d[0].frequency - 432.0).abs() < 1e-9),
            other => panic!("unexpected output {}", other.kind()),
        }
    }

    #[test]
    fn zero_frequency_peaks_are_ignored() {
        let out = detect(vec![Detection {
            frequency: 0.0,
            magnitude: 9.0,
        }]);
        assert!(out.positions.is_empty());
    }

    #[test]
    fn spectrum_input_is_unsupported() {
        let err = NoteDetector::new()
            .detect(&SignalBuffer::Spectrum(vec![1.0]), &OutputScale::Factor(1.0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedInputKind { .. }));
    }
}
