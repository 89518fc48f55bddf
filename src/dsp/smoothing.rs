use std::collections::VecDeque;

/// Averages the last `depth` spectra per bin to reduce frame-to-frame
/// flicker in the display.
pub struct SpectrumSmoother {
    depth: usize,
    history: VecDeque<Vec<f64>>,
}

impl SpectrumSmoother {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            history: VecDeque::new(),
        }
    }

    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth.max(1);
        while self.history.len() > self.depth {
            self.history.pop_front();
        }
    }

    /// Dropped history is not comparable across a changed pipeline, so the
    /// orchestrator calls this on every assembly rebuild.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn smooth(&mut self, frame: &[f64]) -> Vec<f64> {
        // A changed frame length means the producing stage was reconfigured;
        // old frames are no longer comparable.
        if self.history.front().map_or(false, |h| h.len() != frame.len()) {
            self.history.clear();
        }

        self.history.push_back(frame.to_vec());
        if self.history.len() > self.depth {
            self.history.pop_front();
        }

        let count = self.history.len() as f64;
        (0..frame.len())
            .map(|i| self.history.iter().map(|h| h[i]).sum::<f64>() / count)
            .collect()
    }
}
