use std::collections::HashMap;

use log::warn;

use super::{OutputScale, PipelineError, SignalBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Double,
    Enum,
}

/// Range for numeric parameters, option set for enum parameters.
#[derive(Debug, Clone)]
pub enum Constraint {
    Range { min: f64, max: f64 },
    Options(Vec<String>),
}

/// One entry of a stage's declarative parameter schema. Values are stored as
/// strings and parsed on demand so presets serialize uniformly regardless of
/// kind.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub default: &'static str,
    pub kind: ParamKind,
    pub constraint: Constraint,
}

impl ParameterSpec {
    pub fn int(key: &'static str, label: &'static str, default: &'static str, min: i64, max: i64) -> Self {
        Self {
            key,
            label,
            default,
            kind: ParamKind::Int,
            constraint: Constraint::Range {
                min: min as f64,
                max: max as f64,
            },
        }
    }

    pub fn double(key: &'static str, label: &'static str, default: &'static str, min: f64, max: f64) -> Self {
        Self {
            key,
            label,
            default,
            kind: ParamKind::Double,
            constraint: Constraint::Range { min, max },
        }
    }

    /// `options` is pipe-delimited, e.g. `"12|24|48|96"`.
    pub fn options(key: &'static str, label: &'static str, default: &'static str, options: &str) -> Self {
        Self {
            key,
            label,
            default,
            kind: ParamKind::Enum,
            constraint: Constraint::Options(options.split('|').map(str::to_owned).collect()),
        }
    }

    fn invalid(&self, value: &str, reason: impl Into<String>) -> PipelineError {
        PipelineError::InvalidParameterValue {
            key: self.key.to_owned(),
            value: value.to_owned(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self, value: &str) -> Result<(), PipelineError> {
        match (&self.kind, &self.constraint) {
            (ParamKind::Int, Constraint::Range { min, max }) => {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| self.invalid(value, "not an integer"))?;
                if (parsed as f64) < *min || (parsed as f64) > *max {
                    return Err(self.invalid(value, format!("outside [{}, {}]", min, max)));
                }
                Ok(())
            }
            (ParamKind::Double, Constraint::Range { min, max }) => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| self.invalid(value, "not a number"))?;
                if !parsed.is_finite() || parsed < *min || parsed > *max {
                    return Err(self.invalid(value, format!("outside [{}, {}]", min, max)));
                }
                Ok(())
            }
            (ParamKind::Enum, Constraint::Options(options)) => {
                if options.iter().any(|o| o == value) {
                    Ok(())
                } else {
                    Err(self.invalid(value, format!("not one of {}", options.join("|"))))
                }
            }
            _ => Err(self.invalid(value, "constraint does not match parameter kind")),
        }
    }
}

/// A stage's parameter schema plus its current values. Edits are validated
/// against the schema; a rejected edit leaves the previous value untouched.
#[derive(Debug, Clone)]
pub struct StageSettings {
    specs: Vec<ParameterSpec>,
    values: HashMap<String, String>,
}

impl StageSettings {
    pub fn new(specs: Vec<ParameterSpec>) -> Self {
        let values = specs
            .iter()
            .map(|s| (s.key.to_owned(), s.default.to_owned()))
            .collect();
        Self { specs, values }
    }

    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    pub fn value(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), PipelineError> {
        let spec = self.specs.iter().find(|s| s.key == key).ok_or_else(|| {
            PipelineError::InvalidParameterValue {
                key: key.to_owned(),
                value: value.to_owned(),
                reason: "unknown parameter".to_owned(),
            }
        })?;
        spec.validate(value)?;
        self.values.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    pub fn int(&self, key: &str) -> Result<i64, PipelineError> {
        self.value(key)
            .parse()
            .map_err(|_| self.parse_error(key, "not an integer"))
    }

    pub fn double(&self, key: &str) -> Result<f64, PipelineError> {
        self.value(key)
            .parse()
            .map_err(|_| self.parse_error(key, "not a number"))
    }

    fn parse_error(&self, key: &str, reason: &str) -> PipelineError {
        PipelineError::InvalidParameterValue {
            key: key.to_owned(),
            value: self.value(key).to_owned(),
            reason: reason.to_owned(),
        }
    }

    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    /// Applies persisted values. Invalid entries are skipped with a warning
    /// so one bad entry cannot take the whole stage down.
    pub fn restore(&mut self, saved: &HashMap<String, String>) {
        for (key, value) in saved {
            if let Err(e) = self.set(key, value) {
                warn!("ignoring persisted setting: {}", e);
            }
        }
    }
}

/// Capability shared by every pipeline stage.
pub trait PipelineStage: Send {
    fn name(&self) -> &'static str;
    fn settings(&self) -> &StageSettings;
    fn settings_mut(&mut self) -> &mut StageSettings;

    /// Called after any parameter edit. Stages drop cached derived state here
    /// (never rebuild eagerly) so bulk edits cost one rebuild at the next
    /// process call.
    fn on_settings_change(&mut self) {}
}

/// Transforms one buffer into another, e.g. PCM into a spectrum.
pub trait SignalProcessor: PipelineStage {
    fn process(
        &mut self,
        input: &SignalBuffer,
        sample_rate: u32,
    ) -> Result<(SignalBuffer, OutputScale), PipelineError>;
}

#[derive(Debug)]
pub struct DetectionOutput {
    pub buffer: SignalBuffer,
    /// Positional markers associated with each detection, e.g. bin offsets
    /// or cent deviations.
    pub positions: Vec<f64>,
}

/// Reduces a buffer into labeled detections.
pub trait SignalDetector: PipelineStage {
    /// The first primary detector in the assembly defines where spectral
    /// analysis ends and feature detection begins.
    fn is_primary(&self) -> bool {
        false
    }

    fn detect(
        &mut self,
        input: &SignalBuffer,
        scale: &OutputScale,
    ) -> Result<DetectionOutput, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cqt_like_settings() -> StageSettings {
        StageSettings::new(vec![
            ParameterSpec::int("OCTAVES", "Octaves", "5", 1, 10),
            ParameterSpec::options("BINS_PER_OCTAVE", "Bins Per Octave", "48", "12|24|48|96"),
            ParameterSpec::double("MIN_FREQ", "Minimum Frequency (Hz)", "32.7", 1.0, 1000.0),
        ])
    }

    #[test]
    fn defaults_are_seeded() {
        let settings = cqt_like_settings();
        assert_eq!(settings.value("OCTAVES"), "5");
        assert_eq!(settings.value("MIN_FREQ"), "32.7");
    }

    #[test]
    fn out_of_range_edit_keeps_prior_value() {
        let mut settings = cqt_like_settings();
        settings.set("OCTAVES", "7").unwrap();

        let err = settings.set("OCTAVES", "15").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameterValue { .. }));
        assert_eq!(settings.value("OCTAVES"), "7");
    }

    #[test]
    fn unparsable_edit_keeps_prior_value() {
        let mut settings = cqt_like_settings();
        assert!(settings.set("MIN_FREQ", "not-a-number").is_err());
        assert_eq!(settings.value("MIN_FREQ"), "32.7");
    }

    #[test]
    fn enum_edit_must_match_an_option() {
        let mut settings = cqt_like_settings();
        assert!(settings.set("BINS_PER_OCTAVE", "36").is_err());
        settings.set("BINS_PER_OCTAVE", "24").unwrap();
        assert_eq!(settings.int("BINS_PER_OCTAVE").unwrap(), 24);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut settings = cqt_like_settings();
        assert!(settings.set("NO_SUCH_KEY", "1").is_err());
    }

    #[test]
    fn restore_skips_invalid_entries() {
        let mut settings = cqt_like_settings();
        let mut saved = HashMap::new();
        saved.insert("OCTAVES".to_owned(), "3".to_owned());
        saved.insert("MIN_FREQ".to_owned(), "99999".to_owned());
        settings.restore(&saved);

        assert_eq!(settings.value("OCTAVES"), "3");
        assert_eq!(settings.value("MIN_FREQ"), "32.7");
    }
}
