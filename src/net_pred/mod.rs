//! Online bandwidth and delay model.
//!
//! Every observation of a transmitted frame (size, one-way delay) refits the linear model
//! `delay = reverse_bandwidth * size + propagation_delay` over an exponentially weighted
//! window. The model is then inverted to find the frame size that keeps the delay just below
//! the target delay.

mod fit;
mod history;
mod limitor;

pub use self::{
    fit::{FitMode, LinearModel},
    limitor::LimitorState,
};

use self::{
    fit::Fitter,
    history::{History, Sample},
    limitor::NetworkLimitor,
};
use crate::util::frame_size::FrameSize;

const DEFAULT_RECORDED_LEN: usize = 100;

const DEFAULT_TARGET_DELAY_MS: f64 = 16.0;

// Aim slightly below the target delay
const TARGET_DELAY_MARGIN: f64 = 0.9;

// Target size decay for each sample with an unknown delay
const INVALID_INPUT_DECAY: f64 = 0.95;

/// Residuals above this many standard errors mark the sample as an exception.
const EXCEPTION_THRESHOLD: f64 = 1.0;

pub struct NetPred {
    target_delay: f64,
    history: History,
    fitter: Fitter,
    model: LinearModel,
    last_fit: Option<FitMode>,
    limitor: NetworkLimitor,
    fps: f64,
    max_target_size: f64,
    min_target_size: f64,
    next_target_size: f64,
    filtered_target_size: f64,
    filter_factor: f64,
}

impl Default for NetPred {
    fn default() -> Self {
        NetPred::new()
    }
}

impl NetPred {
    pub fn new() -> NetPred {
        NetPred {
            target_delay: DEFAULT_TARGET_DELAY_MS,
            history: History::new(DEFAULT_RECORDED_LEN),
            fitter: Fitter::new(DEFAULT_RECORDED_LEN),
            model: LinearModel::default(),
            last_fit: None,
            limitor: NetworkLimitor::new(),
            fps: 30.0,
            max_target_size: 1000.0,
            min_target_size: 5.0,
            next_target_size: 0.0,
            filtered_target_size: 0.0,
            filter_factor: 0.5,
        }
    }

    /// Empties the observation windows. The current model is kept.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Feeds one frame's feedback. A negative `delay_ms` means the delay could not be measured.
    pub fn update_size_and_delay(
        &mut self,
        transmitted_size_bytes: u32,
        encoded_size_bytes: u32,
        delay_ms: f64,
    ) {
        self.limitor.update(
            FrameSize::from_bytes(encoded_size_bytes).kilobytes(),
            delay_ms,
            self.target_delay,
            self.fps,
        );

        if delay_ms < 0.0 {
            // Nothing to learn from, assume the network is getting worse
            self.next_target_size = f64::max(
                self.next_target_size * INVALID_INPUT_DECAY,
                self.min_target_size,
            );
            log::trace!(
                "Unknown delay, target size decays to {:.3} KB",
                self.next_target_size
            );
            return;
        }

        let size_kb = FrameSize::from_bytes(transmitted_size_bytes).kilobytes();
        self.history.add_sample(Sample::new(size_kb, delay_ms));
        self.update_model();

        let model = self.exception_adjusted_model(size_kb, delay_ms);

        let target = (TARGET_DELAY_MARGIN * self.target_delay - model.propagation_delay)
            / model.reverse_bandwidth;
        let target = self.limitor.adjust(target);

        // Written so that NaN ends up at the floor
        let target = if target >= self.min_target_size {
            f64::min(target, self.max_target_size)
        } else {
            self.min_target_size
        };

        if self.filtered_target_size < 1.0 {
            self.filtered_target_size = target;
        }
        let smoothing = TARGET_DELAY_MARGIN * self.filter_factor;
        self.filtered_target_size =
            self.filtered_target_size * smoothing + target * (1.0 - smoothing);
        self.next_target_size = self.filtered_target_size;

        log::trace!(
            "size {:.3} KB delay {:.1} ms -> model ({:.4} ms/KB, {:.3} ms) target {:.3} KB",
            size_kb,
            delay_ms,
            self.model.reverse_bandwidth,
            self.model.propagation_delay,
            self.next_target_size
        );
    }

    fn update_model(&mut self) {
        let window = self.history.fit_window();

        match self.fitter.fit(&window) {
            Some((model, mode)) => {
                if self.last_fit != Some(mode) {
                    log::debug!("Bandwidth model fit mode: {:?}", mode);
                }
                self.model = model;
                self.last_fit = Some(mode);
            }
            None => {
                log::debug!("No sane bandwidth model fit, keeping {:?}", self.model);
                self.last_fit = None;
            }
        }
    }

    /// Model to compute this frame's target with.
    ///
    /// A sample far above the fitted line only moves the intercept for this one target.
    /// When the delay is close to the target as well, half of the jump is blended in and the
    /// slope is re-derived through the sample.
    fn exception_adjusted_model(&self, size_kb: f64, delay_ms: f64) -> LinearModel {
        let mut model = self.model;

        if !self.fitter.has_enough_samples(self.history.len()) {
            return model;
        }

        let samples = self.history.samples();
        let Some(standard_error) = self.fitter.standard_error(&self.model, samples) else {
            return model;
        };

        if delay_ms - self.model.estimate_delay(size_kb) > EXCEPTION_THRESHOLD * standard_error {
            model.propagation_delay = delay_ms - self.model.reverse_bandwidth * size_kb;
            if delay_ms > TARGET_DELAY_MARGIN * self.target_delay {
                model.propagation_delay =
                    0.5 * model.propagation_delay + 0.5 * self.model.propagation_delay;
                model.reverse_bandwidth = (delay_ms - model.propagation_delay) / size_kb;
            }
        }
        model
    }

    /// Target size of the next frame in bytes, 0 until the first valid sample.
    pub fn next_frame_size(&self) -> u32 {
        FrameSize::from_kilobytes(self.next_target_size).bytes()
    }

    pub fn next_target_size(&self) -> f64 {
        self.next_target_size
    }

    pub fn filtered_target_size(&self) -> f64 {
        self.filtered_target_size
    }

    pub fn model(&self) -> LinearModel {
        self.model
    }

    pub fn last_fit(&self) -> Option<FitMode> {
        self.last_fit
    }

    pub fn limitor(&self) -> &LimitorState {
        self.limitor.state()
    }

    /// Whether a frame size ceiling is currently applied.
    pub fn limitor_active(&self) -> bool {
        self.limitor.is_active()
    }

    pub fn sample_count(&self) -> usize {
        self.history.len()
    }

    pub fn set_recorded_len(&mut self, recorded_len: usize) {
        let recorded_len = recorded_len.max(1);
        self.history.set_recorded_len(recorded_len);
        self.fitter = Fitter::new(recorded_len);
    }

    pub fn recorded_len(&self) -> usize {
        self.history.recorded_len()
    }

    pub fn set_target_delay(&mut self, target_delay_ms: f64) {
        self.target_delay = target_delay_ms;
    }

    pub fn target_delay(&self) -> f64 {
        self.target_delay
    }

    pub fn set_max_target_size(&mut self, max_bytes: u32) {
        self.max_target_size = FrameSize::from_bytes(max_bytes).kilobytes();
    }

    pub fn set_min_target_size(&mut self, min_bytes: u32) {
        self.min_target_size = FrameSize::from_bytes(min_bytes).kilobytes();
    }

    pub fn max_target_size(&self) -> f64 {
        self.max_target_size
    }

    pub fn min_target_size(&self) -> f64 {
        self.min_target_size
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    /// Enables detection of hard bandwidth ceilings such as those of network emulators.
    pub fn set_network_emulator_hint(&mut self, hint: bool) {
        self.limitor.set_enabled(hint);
    }

    /// 0.0 reacts fastest but lets spikes through, 1.0 smooths the most. 0.5 by default.
    pub fn set_output_filter_factor(&mut self, factor: f64) {
        self.filter_factor = factor.clamp(0.0, 1.0);
    }

    pub fn output_filter_factor(&self) -> f64 {
        self.filter_factor
    }
}
