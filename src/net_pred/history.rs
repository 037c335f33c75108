use std::collections::VecDeque;

/// One (transmitted size, observed delay) observation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sample {
    pub size_kb: f64,
    pub delay_ms: f64,
}

impl Sample {
    pub fn new(size_kb: f64, delay_ms: f64) -> Sample {
        Sample { size_kb, delay_ms }
    }

    /// Samples zeroed out by the safe fit carry no information.
    #[inline]
    pub fn is_void(&self) -> bool {
        self.delay_ms < 1e-6 && self.size_kb < 1e-6
    }
}

/// Rolling windows of observations, most recent first.
pub struct History {
    samples: VecDeque<Sample>,
    recorded_len: usize,
    // Last few samples that were large enough to say something about the bandwidth
    effective: VecDeque<Sample>,
    effective_data_len: usize,
    effective_size_threshold: f64,
}

impl History {
    pub fn new(recorded_len: usize) -> History {
        History {
            samples: VecDeque::with_capacity(recorded_len + 1),
            recorded_len,
            effective: VecDeque::new(),
            effective_data_len: 2,
            effective_size_threshold: 1.0,
        }
    }

    pub fn add_sample(&mut self, sample: Sample) {
        self.samples.push_front(sample);
        self.samples.truncate(self.recorded_len);

        if sample.size_kb >= self.effective_size_threshold {
            self.effective.push_front(sample);
            self.effective.truncate(self.effective_data_len);
        }
    }

    pub fn set_recorded_len(&mut self, recorded_len: usize) {
        self.recorded_len = recorded_len;
        self.samples.truncate(recorded_len);
    }

    pub fn recorded_len(&self) -> usize {
        self.recorded_len
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &VecDeque<Sample> {
        &self.samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.effective.clear();
    }

    /// Copy of the main window to fit on.
    ///
    /// When the window holds nothing above the effective size threshold (a long run of
    /// empty frames, for example) the effective samples replace the most recent entries so
    /// the fit still sees some real signal. The window length is kept.
    pub fn fit_window(&self) -> Vec<Sample> {
        let informative = self
            .samples
            .iter()
            .any(|s| s.size_kb >= self.effective_size_threshold);

        if informative {
            return self.samples.iter().copied().collect();
        }

        let mut window = self.samples.clone();
        for sample in self.effective.iter().rev() {
            window.push_front(*sample);
            window.pop_back();
        }
        window.into_iter().collect()
    }
}
