use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use log::{info, warn};

use super::plugin::{PipelineStage, SignalDetector, SignalProcessor, StageSettings};
use super::stages::{CqtProcessor, FftProcessor, NoteDetector, PeakDetector};
use super::PipelineError;

/// A registered stage, partitioned by capability.
pub enum StagePlugin {
    Processor(Box<dyn SignalProcessor>),
    Detector(Box<dyn SignalDetector>),
}

impl StagePlugin {
    pub fn name(&self) -> &'static str {
        match self {
            StagePlugin::Processor(p) => p.name(),
            StagePlugin::Detector(d) => d.name(),
        }
    }

    pub fn settings(&self) -> &StageSettings {
        match self {
            StagePlugin::Processor(p) => p.settings(),
            StagePlugin::Detector(d) => d.settings(),
        }
    }

    fn settings_mut(&mut self) -> &mut StageSettings {
        match self {
            StagePlugin::Processor(p) => p.settings_mut(),
            StagePlugin::Detector(d) => d.settings_mut(),
        }
    }

    fn on_settings_change(&mut self) {
        match self {
            StagePlugin::Processor(p) => p.on_settings_change(),
            StagePlugin::Detector(d) => d.on_settings_change(),
        }
    }

    pub fn role(&self) -> StageRole {
        match self {
            StagePlugin::Processor(_) => StageRole::Processor,
            StagePlugin::Detector(d) => StageRole::Detector {
                primary: d.is_primary(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRole {
    Processor,
    Detector { primary: bool },
}

#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub index: usize,
    pub name: &'static str,
    pub role: StageRole,
}

type SavedSettings = HashMap<String, HashMap<String, String>>;

/// Holds every available stage instance. Indices are stable for the lifetime
/// of one load cycle; stage identity is index-based to match the ordered
/// selection list the user sees.
pub struct StageRegistry {
    plugins: Vec<StagePlugin>,
    pending: Option<Receiver<Vec<StagePlugin>>>,
    ready: bool,
}

impl StageRegistry {
    /// Builds the stage set off the caller's thread; persisted settings are
    /// applied during the build. `is_ready`/`wait_ready` gate the first
    /// selection so nothing observes a partially-loaded registry.
    pub fn load(settings_path: Option<PathBuf>) -> Self {
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let plugins = build_stages(settings_path.as_deref());
            let _ = tx.send(plugins);
        });
        Self {
            plugins: Vec::new(),
            pending: Some(rx),
            ready: false,
        }
    }

    /// Immediately-ready registry from explicit plugins. Used by tests and
    /// embedders that construct their own stage set.
    pub fn with_plugins(plugins: Vec<StagePlugin>) -> Self {
        Self {
            plugins,
            pending: None,
            ready: true,
        }
    }

    pub fn is_ready(&mut self) -> bool {
        if self.ready {
            return true;
        }
        let received = match &self.pending {
            Some(rx) => match rx.try_recv() {
                Ok(plugins) => Some(plugins),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => {
                    warn!("stage loader thread died; registry is empty");
                    Some(Vec::new())
                }
            },
            None => Some(Vec::new()),
        };
        if let Some(plugins) = received {
            self.install(plugins);
        }
        self.ready
    }

    pub fn wait_ready(&mut self) {
        if self.ready {
            return;
        }
        let plugins = match self.pending.take() {
            Some(rx) => rx.recv().unwrap_or_else(|_| {
                warn!("stage loader thread died; registry is empty");
                Vec::new()
            }),
            None => Vec::new(),
        };
        self.install(plugins);
    }

    fn install(&mut self, plugins: Vec<StagePlugin>) {
        info!("stage registry ready: {} stages", plugins.len());
        self.plugins = plugins;
        self.pending = None;
        self.ready = true;
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StagePlugin> {
        self.plugins.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut StagePlugin> {
        self.plugins.get_mut(index)
    }

    pub fn descriptors(&self) -> Vec<StageDescriptor> {
        self.plugins
            .iter()
            .enumerate()
            .map(|(index, plugin)| StageDescriptor {
                index,
                name: plugin.name(),
                role: plugin.role(),
            })
            .collect()
    }

    /// Read-only settings view for presentation.
    pub fn settings_for(&self, index: usize) -> Option<&StageSettings> {
        self.plugins.get(index).map(StagePlugin::settings)
    }

    /// Validates and applies one parameter edit, then lets the stage drop
    /// cached derived state. A rejected edit leaves the stage untouched.
    pub fn set_parameter(&mut self, index: usize, key: &str, value: &str) -> Result<(), PipelineError> {
        let plugin = self
            .plugins
            .get_mut(index)
            .ok_or(PipelineError::RegistryLoading)?;
        plugin.settings_mut().set(key, value)?;
        plugin.on_settings_change();
        Ok(())
    }

    pub fn save_settings(&self, path: &Path) -> Result<()> {
        let saved: SavedSettings = self
            .plugins
            .iter()
            .map(|p| (p.name().to_owned(), p.settings().values().clone()))
            .collect();
        let file = File::create(path)
            .with_context(|| format!("creating settings file {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &saved)?;
        Ok(())
    }
}

fn build_stages(settings_path: Option<&Path>) -> Vec<StagePlugin> {
    let mut plugins = vec![
        StagePlugin::Processor(Box::new(CqtProcessor::new())),
        StagePlugin::Processor(Box::new(FftProcessor::new())),
        StagePlugin::Detector(Box::new(PeakDetector::new())),
        StagePlugin::Detector(Box::new(NoteDetector::new())),
    ];

    if let Some(path) = settings_path {
        match load_settings_file(path) {
            Ok(saved) => {
                for plugin in &mut plugins {
                    if let Some(values) = saved.get(plugin.name()) {
                        // restore() isolates bad entries per parameter, so a
                        // corrupt value cannot take down its stage.
                        plugin.settings_mut().restore(values);
                        plugin.on_settings_change();
                    }
                }
            }
            Err(e) => warn!("stage settings not loaded from {}: {:#}", path.display(), e),
        }
    }

    plugins
}

fn load_settings_file(path: &Path) -> Result<SavedSettings> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let saved = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::SignalBuffer;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cadenza-registry-{}-{}", std::process::id(), name))
    }

    #[test]
    fn load_completes_and_partitions_stages() {
        let mut registry = StageRegistry::load(None);
        registry.wait_ready();
        assert!(registry.is_ready());
        assert_eq!(registry.len(), 4);

        let descriptors = registry.descriptors();
        assert_eq!(descriptors[0].role, StageRole::Processor);
        assert_eq!(descriptors[2].role, StageRole::Detector { primary: true });
        assert_eq!(descriptors[3].role, StageRole::Detector { primary: false });
    }

    #[test]
    fn invalid_edit_is_rejected_and_prior_value_kept() {
        let mut registry = StageRegistry::load(None);
        registry.wait_ready();

        let err = registry.set_parameter(0, "OCTAVES", "15").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameterValue { .. }));
        assert_eq!(registry.settings_for(0).unwrap().value("OCTAVES"), "5");

        registry.set_parameter(0, "OCTAVES", "3").unwrap();
        assert_eq!(registry.settings_for(0).unwrap().value("OCTAVES"), "3");
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let path = temp_path("roundtrip.json");

        let mut registry = StageRegistry::load(None);
        registry.wait_ready();
        registry.set_parameter(0, "MIN_FREQ", "55").unwrap();
        registry.save_settings(&path).unwrap();

        let mut reloaded = StageRegistry::load(Some(path.clone()));
        reloaded.wait_ready();
        assert_eq!(reloaded.settings_for(0).unwrap().value("MIN_FREQ"), "55");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_settings_file_still_loads_defaults() {
        let mut registry = StageRegistry::load(Some(temp_path("does-not-exist.json")));
        registry.wait_ready();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.settings_for(0).unwrap().value("OCTAVES"), "5");
    }

    #[test]
    fn corrupt_settings_file_is_isolated() {
        let path = temp_path("corrupt.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut registry = StageRegistry::load(Some(path.clone()));
        registry.wait_ready();
        assert_eq!(registry.len(), 4);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn edited_settings_flow_into_processing() {
        let mut registry = StageRegistry::load(None);
        registry.wait_ready();
        registry.set_parameter(1, "WINDOW_SIZE", "1024").unwrap();

        let plugin = registry.get_mut(1).unwrap();
        let spectrum = match plugin {
            StagePlugin::Processor(p) => p
                .process(&SignalBuffer::Pcm(vec![0; 1024]), 44100)
                .unwrap()
                .0,
            _ => panic!("expected processor at index 1"),
        };
        match spectrum {
            SignalBuffer::Spectrum(s) => assert_eq!(s.len(), 512),
            other => panic!("unexpected output {}", other.kind()),
        }
    }
}
