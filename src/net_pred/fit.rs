use super::history::Sample;

/// Linear delay model: `delay_ms = reverse_bandwidth * size_kb + propagation_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearModel {
    /// Milliseconds of delay per kilobyte, the inverse of the effective throughput.
    pub reverse_bandwidth: f64,
    /// Size independent delay in milliseconds.
    pub propagation_delay: f64,
}

impl Default for LinearModel {
    fn default() -> Self {
        LinearModel {
            reverse_bandwidth: 1.0,
            propagation_delay: 0.0,
        }
    }
}

impl LinearModel {
    pub fn is_sane(&self) -> bool {
        self.reverse_bandwidth > 0.0 && self.propagation_delay >= 0.0
    }

    #[inline]
    pub fn estimate_delay(&self, size_kb: f64) -> f64 {
        self.reverse_bandwidth * size_kb + self.propagation_delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Weighted least squares over the whole window.
    Normal,
    /// Least squares after voiding samples that pull the slope the wrong way.
    Safe,
    /// Slope through the weighted means, nominal intercept.
    Small,
}

const SMALL_FIT_PROPAGATION_DELAY_MS: f64 = 0.1;

/// Exponentially weighted regression over a window of samples, newest first.
pub struct Fitter {
    forget_ratio: f64,
    // Normal fitting needs at least this many samples
    min_samples: f64,
}

impl Fitter {
    pub fn new(recorded_len: usize) -> Fitter {
        let recorded_len = recorded_len.max(1) as f64;
        Fitter {
            // The weight of the oldest sample in a full window decays to 1%
            forget_ratio: 0.01f64.powf(1.0 / (2.0 * recorded_len)),
            min_samples: 0.2 * recorded_len,
        }
    }

    pub fn has_enough_samples(&self, len: usize) -> bool {
        len as f64 >= self.min_samples
    }

    /// Tries Normal, Safe and Small fits in that order and returns the first sane one.
    pub fn fit(&self, window: &[Sample]) -> Option<(LinearModel, FitMode)> {
        [
            self.fit_normal(window),
            self.fit_safe(window),
            self.fit_small(window),
        ]
        .into_iter()
        .flatten()
        .find(|(model, _)| model.is_sane())
    }

    fn weighted_mean(&self, values: impl Iterator<Item = f64>) -> f64 {
        let mut acc_d = 0.0;
        let mut acc_n = 0.0;
        let mut weight = 1.0;
        for value in values {
            acc_d += weight * value;
            acc_n += weight;
            weight *= self.forget_ratio;
        }
        if acc_n < 1e-6 {
            0.0
        } else {
            acc_d / acc_n
        }
    }

    fn means(&self, window: &[Sample]) -> (f64, f64) {
        (
            self.weighted_mean(window.iter().map(|s| s.delay_ms)),
            self.weighted_mean(window.iter().map(|s| s.size_kb)),
        )
    }

    fn fit_normal(&self, window: &[Sample]) -> Option<(LinearModel, FitMode)> {
        if !self.has_enough_samples(window.len()) {
            return self.fit_small(window);
        }

        let (mean_delay, mean_size) = self.means(window);

        let mut acc_d = 0.0;
        let mut acc_n = 0.0;
        let mut weight = 1.0;
        for sample in window {
            if !sample.is_void() {
                let w2 = weight * weight;
                acc_d += w2 * (sample.delay_ms - mean_delay) * (sample.size_kb - mean_size);
                acc_n += w2 * (sample.size_kb - mean_size) * (sample.size_kb - mean_size);
            }
            weight *= self.forget_ratio;
        }

        if acc_n < 1e-6 {
            return self.fit_small(window);
        }

        let reverse_bandwidth = acc_d / acc_n;
        let model = LinearModel {
            reverse_bandwidth,
            propagation_delay: mean_delay - reverse_bandwidth * mean_size,
        };
        Some((model, FitMode::Normal))
    }

    fn fit_safe(&self, window: &[Sample]) -> Option<(LinearModel, FitMode)> {
        let (mean_delay, mean_size) = self.means(window);

        let safe: Vec<Sample> = window
            .iter()
            .map(|s| {
                if (s.delay_ms - mean_delay) * (s.size_kb - mean_size) > 0.0 {
                    *s
                } else {
                    Sample::default()
                }
            })
            .collect();

        self.fit_normal(&safe).map(|(model, mode)| match mode {
            FitMode::Normal => (model, FitMode::Safe),
            _ => (model, mode),
        })
    }

    fn fit_small(&self, window: &[Sample]) -> Option<(LinearModel, FitMode)> {
        let (mean_delay, mean_size) = self.means(window);

        if mean_size < 1e-6 || mean_delay < 1e-6 {
            return None;
        }

        let model = LinearModel {
            reverse_bandwidth: mean_delay / mean_size,
            propagation_delay: SMALL_FIT_PROPAGATION_DELAY_MS,
        };
        Some((model, FitMode::Small))
    }

    /// Weighted standard error of the model over all but the newest sample.
    pub fn standard_error<'a>(
        &self,
        model: &LinearModel,
        window: impl IntoIterator<Item = &'a Sample>,
    ) -> Option<f64> {
        let mut mse = 0.0;
        let mut count = 0.0;
        let mut weight = 1.0;
        for sample in window.into_iter().skip(1) {
            if !sample.is_void() {
                let residual = sample.delay_ms - model.estimate_delay(sample.size_kb);
                mse += weight * weight * residual * residual;
                count += weight * weight;
            }
            weight *= self.forget_ratio;
        }

        if count > 1e-6 {
            Some((mse / count).sqrt())
        } else {
            None
        }
    }
}
