//! Detection of hard bandwidth ceilings, as produced by network emulators.
//!
//! A run of high-delay samples followed by a good one is read as the end of a bandwidth
//! drop. The average encoded size seen during the drop becomes a ceiling for the target
//! size. After a while the ceiling is raised on every sample, and it is forgotten after a
//! timeout, so it only ever covers one episode.

/// Number of consecutive high-delay samples that make a spike.
const OBSERVE_COUNTER_THRESHOLD: u32 = 5;

/// Seconds after which the ceiling starts being raised.
const TIME_TO_EXPLORE_SECS: u32 = 10;

/// Seconds after which the ceiling is dropped.
const TIMEOUT_SECS: u32 = 30;

const EXPLORE_STEP: f64 = 1.05;

const CEILING_MARGIN: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LimitorState {
    /// Consecutive samples with a delay above target (or an invalid delay).
    pub observe_counter: u32,
    /// Sum of encoded sizes (KB) during the current high-delay run.
    pub estimate_acc: f64,
    pub estimate_counts: u32,
    /// Ceiling in KB, 0 when unknown.
    pub estimated_threshold_size: f64,
    pub limitor_used: bool,
    pub start_estimate: bool,
    /// Samples seen since the ceiling was estimated.
    pub explore_frames: u32,
}

pub struct NetworkLimitor {
    enabled: bool,
    state: LimitorState,
}

impl NetworkLimitor {
    pub fn new() -> NetworkLimitor {
        NetworkLimitor {
            enabled: false,
            state: LimitorState::default(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn state(&self) -> &LimitorState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.state.limitor_used && self.state.estimated_threshold_size > 1e-6
    }

    pub fn update(
        &mut self,
        encoded_size_kb: f64,
        delay_ms: f64,
        target_delay_ms: f64,
        fps: f64,
    ) {
        if !self.enabled {
            return;
        }

        let state = &mut self.state;
        if delay_ms > target_delay_ms || delay_ms < 0.0 {
            state.observe_counter += 1;
            state.estimate_acc += encoded_size_kb;
            state.estimate_counts += 1;
        } else {
            if state.observe_counter >= OBSERVE_COUNTER_THRESHOLD && state.estimate_counts > 0 {
                state.estimated_threshold_size = state.estimate_acc / state.estimate_counts as f64;
                state.limitor_used = true;
                state.start_estimate = true;
                state.explore_frames = 0;
                log::debug!(
                    "Delay spike of {} samples ended, limiting frame size to {:.2} KB",
                    state.observe_counter,
                    CEILING_MARGIN * state.estimated_threshold_size
                );
            }
            state.observe_counter = 0;
            state.estimate_acc = 0.0;
            state.estimate_counts = 0;
        }

        if !state.start_estimate {
            return;
        }

        state.explore_frames += 1;

        let explore_frames = (TIME_TO_EXPLORE_SECS as f64 * fps).round() as u32;
        let timeout_frames = (TIMEOUT_SECS as f64 * fps).round() as u32;

        if state.explore_frames > timeout_frames {
            log::debug!("Frame size ceiling timed out");
            *state = LimitorState {
                observe_counter: state.observe_counter,
                estimate_acc: state.estimate_acc,
                estimate_counts: state.estimate_counts,
                ..Default::default()
            };
        } else if state.explore_frames > explore_frames {
            state.estimated_threshold_size *= EXPLORE_STEP;
        }
    }

    /// Caps `target_size_kb` below the estimated ceiling while one is known.
    pub fn adjust(&self, target_size_kb: f64) -> f64 {
        if self.is_active() {
            f64::min(target_size_kb, CEILING_MARGIN * self.state.estimated_threshold_size)
        } else {
            target_size_kb
        }
    }
}
