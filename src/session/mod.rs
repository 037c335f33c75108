//! Per-stream predictor session.
//!
//! The transport thread reports network feedback and the encoder thread reports encoded
//! frame sizes. Both only touch the feedback caches. Once per frame the encoder asks for the
//! next frame's settings, which drains the caches into the bandwidth model and applies the
//! keyframe and frame drop policies.

mod cache;
mod config;

pub use self::config::SessionConfig;

use self::cache::FeedbackCache;
use crate::{
    error::{Result, TcaeError},
    net_pred::NetPred,
    types::{
        EncodedFrameFeedback, Features, FrameSettings, FrameType, InitParams, PerFrameNetworkData,
    },
    util::frame_size::delay_us_to_ms,
};
use std::sync::Mutex;

const IDR_SIZE_INCREASE_COEFF: u32 = 3;

/// Network feedback waiting to be paired with an encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NetworkSample {
    transmitted_size: u32,
    delay_ms: u32,
}

/// One model update, taken out of the caches.
struct ModelUpdate {
    transmitted_size: u32,
    encoded_size: u32,
    delay_ms: f64,
}

/// State shared between the producers and the predictor.
struct Inputs {
    // None while the session is stopped
    features: Option<Features>,
    bitstream: FeedbackCache<u32>,
    network: FeedbackCache<NetworkSample>,
    idr_requested: bool,
}

impl Inputs {
    fn new() -> Inputs {
        Inputs {
            features: None,
            bitstream: FeedbackCache::new("bitstream", cache::DEFAULT_CACHE_CAPACITY),
            network: FeedbackCache::new("network", cache::DEFAULT_CACHE_CAPACITY),
            idr_requested: false,
        }
    }

    fn features(&self) -> Result<Features> {
        self.features.ok_or(TcaeError::NotInitialized)
    }

    fn reset(&mut self) {
        self.features = None;
        self.bitstream.reset();
        self.network.reset();
        self.idr_requested = false;
    }
}

/// State owned by the thread asking for predictions.
struct Predictor {
    config: SessionConfig,
    net_pred: NetPred,
    last_target_frame_size: u32,
    frame_drops_count: u32,
    frames_since_last_drop: u64,
    last_known_delay_ms: u32,
    last_transmitted_size: u32,
}

impl Predictor {
    fn new(config: SessionConfig) -> Predictor {
        let mut net_pred = NetPred::new();
        net_pred.set_max_target_size(config.max_frame_size_in_bytes);
        net_pred.set_min_target_size(config.max_frame_size_in_bytes / 10);
        net_pred.set_recorded_len(config.buffered_records_count as usize);
        net_pred.set_target_delay(config.target_delay_in_ms as f64);

        Predictor {
            frames_since_last_drop: config.min_drop_frames_distance as u64,
            config,
            net_pred,
            last_target_frame_size: 0,
            frame_drops_count: 0,
            last_known_delay_ms: 0,
            last_transmitted_size: 0,
        }
    }

    /// Takes the cached feedback out of `inputs`.
    ///
    /// Matching network and bitstream entries are paired in order. Surplus network feedback
    /// only updates the last known network state. Surplus encoded sizes are paired with the
    /// last known transmitted size and an unknown delay.
    fn drain(&mut self, inputs: &mut Inputs) -> Vec<ModelUpdate> {
        let count = inputs.bitstream.len().min(inputs.network.len());
        let mut updates = Vec::with_capacity(inputs.bitstream.len());
        let mut last_matched = None;

        for (encoded_size, sample) in inputs
            .bitstream
            .drain_up_to(count)
            .zip(inputs.network.drain_up_to(count))
        {
            updates.push(ModelUpdate {
                transmitted_size: sample.transmitted_size,
                encoded_size,
                delay_ms: sample.delay_ms as f64,
            });
            last_matched = Some(sample);
        }

        if let Some(latest) = inputs.network.back().copied() {
            self.last_known_delay_ms = latest.delay_ms;
            self.last_transmitted_size = latest.transmitted_size;
            inputs.network.clear();
        } else if let Some(sample) = last_matched.filter(|s| s.delay_ms != 0) {
            self.last_known_delay_ms = sample.delay_ms;
            self.last_transmitted_size = sample.transmitted_size;
        }

        if self.last_known_delay_ms != 0 {
            while let Some(encoded_size) = inputs.bitstream.pop() {
                updates.push(ModelUpdate {
                    transmitted_size: self.last_transmitted_size,
                    encoded_size,
                    delay_ms: -1.0,
                });
            }
        }

        updates
    }

    fn predict(&mut self, updates: Vec<ModelUpdate>, insert_idr: bool) -> FrameSettings {
        for update in updates {
            self.net_pred.update_size_and_delay(
                update.transmitted_size,
                update.encoded_size,
                update.delay_ms,
            );
        }

        let mut predicted_frame_size = match self.net_pred.next_frame_size() {
            // Not warmed up yet, may still be 0 in which case the encoder keeps its own rate
            0 => self.last_target_frame_size,
            size => size,
        };

        // Do not let quality fall off too fast
        predicted_frame_size = predicted_frame_size.max(self.last_target_frame_size >> 1);

        let target_delay = self.config.target_delay_in_ms;
        let mut settings = FrameSettings::default();

        if insert_idr {
            settings.enc_frame_type = FrameType::IDR | FrameType::REF | FrameType::I;

            // Give the keyframe extra room while the network keeps up
            if self.last_known_delay_ms < target_delay {
                predicted_frame_size = predicted_frame_size
                    .saturating_mul(IDR_SIZE_INCREASE_COEFF)
                    .min(self.config.max_frame_size_in_bytes);
            }
        } else if self.config.frame_drop()
            && self.frame_drops_count < self.config.max_sequential_drops_count as u32
        {
            let too_close = self.frame_drops_count == 0
                && self.frames_since_last_drop < self.config.min_drop_frames_distance as u64;

            if !too_close && self.last_known_delay_ms > target_delay {
                // Drop as many frames as the backlog spans delay budgets
                let calc_drops_count =
                    (self.last_known_delay_ms as f64 / target_delay as f64).round() as u32;
                if self.frame_drops_count < calc_drops_count {
                    self.frame_drops_count += 1;
                    self.frames_since_last_drop = 0;
                    log::debug!(
                        "Dropping frame {} of {}, last delay {} ms",
                        self.frame_drops_count,
                        calc_drops_count,
                        self.last_known_delay_ms
                    );

                    settings.drop_frame = true;
                    return settings;
                }
            }
        }

        self.frame_drops_count = 0;
        if self.config.frame_drop() {
            self.frames_since_last_drop += 1;
        }

        settings.frame_size_in_bytes = predicted_frame_size;
        self.last_target_frame_size = predicted_frame_size;
        settings
    }
}

/// Frame settings predictor for one streaming session.
///
/// All methods take `&self`; the session can be shared between the transport and encoder
/// threads.
pub struct PredictorSession {
    inputs: Mutex<Inputs>,
    predictor: Mutex<Option<Predictor>>,
}

impl Default for PredictorSession {
    fn default() -> Self {
        PredictorSession::new()
    }
}

impl PredictorSession {
    pub fn new() -> PredictorSession {
        PredictorSession {
            inputs: Mutex::new(Inputs::new()),
            predictor: Mutex::new(None),
        }
    }

    pub fn start(&self, params: &InitParams) -> Result<()> {
        let mut predictor = self.predictor.lock()?;
        if predictor.is_some() {
            return Err(TcaeError::Unsupported);
        }

        let config = SessionConfig::validate(params)?;
        log::info!(
            "Starting predictor: features {:?}, target delay {} ms, max frame size {} bytes",
            config.features,
            config.target_delay_in_ms,
            config.max_frame_size_in_bytes
        );

        {
            let mut inputs = self.inputs.lock()?;
            inputs.reset();
            inputs.bitstream.set_capacity(config.cache_capacity);
            inputs.network.set_capacity(config.cache_capacity);
            inputs.features = Some(config.features);
        }

        *predictor = Some(Predictor::new(config));
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut predictor = self.predictor.lock()?;
        if predictor.take().is_none() {
            return Err(TcaeError::NotInitialized);
        }
        self.inputs.lock()?.reset();

        log::info!("Predictor stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inputs
            .lock()
            .map(|inputs| inputs.features.is_some())
            .unwrap_or(false)
    }

    /// Caches the transport's feedback for one frame.
    pub fn update_network_state(&self, data: &PerFrameNetworkData) -> Result<()> {
        let mut inputs = self.inputs.lock()?;
        inputs.features()?;

        // A keyframe request stays pending until an IDR is predicted or sent
        inputs.idr_requested |= data.idr_required;

        if data.last_packet_delay_in_us == 0 || data.transmitted_data_size_in_bytes == 0 {
            return Err(TcaeError::InvalidArg);
        }

        inputs.network.push(NetworkSample {
            transmitted_size: data.transmitted_data_size_in_bytes,
            delay_ms: delay_us_to_ms(data.last_packet_delay_in_us),
        });
        Ok(())
    }

    /// Caches the size of a frame the encoder has produced.
    pub fn bitstream_sent(&self, feedback: &EncodedFrameFeedback) -> Result<()> {
        let mut inputs = self.inputs.lock()?;
        let features = inputs.features()?;

        // Frame order is only optional in standalone mode
        if !features.contains(Features::STANDALONE) && feedback.frame_order == 0 {
            return Err(TcaeError::InvalidArg);
        }

        if feedback.enc_frame_type.contains(FrameType::IDR) {
            inputs.idr_requested = false;
        }
        inputs.bitstream.push(feedback.frame_size_in_bytes);
        Ok(())
    }

    /// Settings for the next frame to encode.
    pub fn predict_enc_settings(&self) -> Result<FrameSettings> {
        let mut guard = self.predictor.lock()?;
        let predictor = guard.as_mut().ok_or(TcaeError::NotInitialized)?;

        let (updates, insert_idr) = {
            let mut inputs = self.inputs.lock()?;
            let updates = predictor.drain(&mut inputs);
            (updates, std::mem::take(&mut inputs.idr_requested))
        };

        Ok(predictor.predict(updates, insert_idr))
    }

    /// Adjusts model tunables that have no session parameter (fps, filter factor, ...).
    pub fn configure_model<F>(&self, configure: F) -> Result<()>
    where
        F: FnOnce(&mut NetPred),
    {
        let mut guard = self.predictor.lock()?;
        let predictor = guard.as_mut().ok_or(TcaeError::NotInitialized)?;
        configure(&mut predictor.net_pred);
        Ok(())
    }

    /// Read access to the model, for diagnostics.
    pub fn inspect_model<R, F>(&self, inspect: F) -> Result<R>
    where
        F: FnOnce(&NetPred) -> R,
    {
        let guard = self.predictor.lock()?;
        let predictor = guard.as_ref().ok_or(TcaeError::NotInitialized)?;
        Ok(inspect(&predictor.net_pred))
    }

    pub fn config(&self) -> Result<SessionConfig> {
        let guard = self.predictor.lock()?;
        let predictor = guard.as_ref().ok_or(TcaeError::NotInitialized)?;
        Ok(predictor.config.clone())
    }

    /// Feedback entries evicted from the caches because predictions did not keep up.
    pub fn dropped_samples(&self) -> u64 {
        self.inputs
            .lock()
            .map(|inputs| inputs.bitstream.overflows() + inputs.network.overflows())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(
        features: Features,
        target_delay_in_ms: u32,
        max_frame_size: u32,
    ) -> PredictorSession {
        let session = PredictorSession::new();
        session
            .start(&InitParams {
                features_set: features.bits(),
                target_delay_in_ms,
                max_frame_size_in_bytes: max_frame_size,
                ..Default::default()
            })
            .unwrap();
        session
    }

    fn network(delay_us: u32, size: u32) -> PerFrameNetworkData {
        PerFrameNetworkData {
            last_packet_delay_in_us: delay_us,
            transmitted_data_size_in_bytes: size,
            ..Default::default()
        }
    }

    fn encoded(size: u32, frame_order: u64) -> EncodedFrameFeedback {
        EncodedFrameFeedback {
            enc_frame_type: FrameType::P,
            frame_size_in_bytes: size,
            frame_order,
        }
    }

    fn frame(session: &PredictorSession, delay_us: u32, size: u32) -> FrameSettings {
        session.update_network_state(&network(delay_us, size)).unwrap();
        session.bitstream_sent(&encoded(size, 1)).unwrap();
        session.predict_enc_settings().unwrap()
    }

    #[test]
    fn calls_require_a_started_session() {
        let session = PredictorSession::new();
        assert!(!session.is_started());
        assert_eq!(
            session.update_network_state(&network(1000, 1000)),
            Err(TcaeError::NotInitialized)
        );
        assert_eq!(
            session.bitstream_sent(&encoded(1000, 1)),
            Err(TcaeError::NotInitialized)
        );
        assert_eq!(session.predict_enc_settings(), Err(TcaeError::NotInitialized));
        assert_eq!(session.stop(), Err(TcaeError::NotInitialized));
    }

    #[test]
    fn restart_is_unsupported_until_stopped() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 0);
        assert!(session.is_started());
        let params = InitParams {
            target_delay_in_ms: 60,
            ..Default::default()
        };
        assert_eq!(session.start(&params), Err(TcaeError::Unsupported));

        session.stop().unwrap();
        assert!(!session.is_started());
        assert_eq!(session.predict_enc_settings(), Err(TcaeError::NotInitialized));
        session.start(&params).unwrap();
    }

    #[test]
    fn failed_start_can_be_retried() {
        let session = PredictorSession::new();
        assert_eq!(
            session.start(&InitParams::default()),
            Err(TcaeError::InvalidArg)
        );
        assert!(!session.is_started());
        session
            .start(&InitParams {
                target_delay_in_ms: 60,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn model_is_configured_from_params() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 0);
        session
            .inspect_model(|net_pred| {
                assert_eq!(net_pred.max_target_size(), 50.0);
                assert_eq!(net_pred.min_target_size(), 5.0);
                assert_eq!(net_pred.target_delay(), 60.0);
                assert_eq!(net_pred.recorded_len(), 100);
            })
            .unwrap();
    }

    #[test]
    fn network_feedback_is_validated() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 0);
        assert_eq!(
            session.update_network_state(&network(0, 1000)),
            Err(TcaeError::InvalidArg)
        );
        assert_eq!(
            session.update_network_state(&network(1000, 0)),
            Err(TcaeError::InvalidArg)
        );
    }

    #[test]
    fn frame_order_is_required_unless_standalone() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 0);
        assert_eq!(
            session.bitstream_sent(&encoded(1000, 0)),
            Err(TcaeError::InvalidArg)
        );
        session.bitstream_sent(&encoded(1000, 7)).unwrap();

        let session = started(Features::STANDALONE, 60, 0);
        session.bitstream_sent(&encoded(1000, 0)).unwrap();
    }

    #[test]
    fn cold_session_predicts_zero() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 0);
        assert_eq!(session.predict_enc_settings().unwrap(), FrameSettings::default());
    }

    #[test]
    fn steady_feedback_predicts_model_target() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 50000);
        let settings = frame(&session, 40_000, 8000);
        // (0.9 * 60 - 0.1) / (40 / 8)
        assert_eq!(settings.frame_size_in_bytes, 10780);
        assert!(!settings.drop_frame);
        assert_eq!(settings.enc_frame_type, FrameType::empty());
    }

    #[test]
    fn idr_gets_boosted_while_network_is_healthy() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 100000);
        let predicted = frame(&session, 20_000, 8000).frame_size_in_bytes;
        assert_eq!(predicted, 21560);

        session
            .update_network_state(&PerFrameNetworkData {
                idr_required: true,
                ..network(20_000, 8000)
            })
            .unwrap();
        session.bitstream_sent(&encoded(8000, 2)).unwrap();
        let settings = session.predict_enc_settings().unwrap();
        assert_eq!(
            settings.enc_frame_type,
            FrameType::IDR | FrameType::REF | FrameType::I
        );
        assert_eq!(settings.frame_size_in_bytes, 3 * predicted);

        // The request is consumed
        let settings = frame(&session, 20_000, 8000);
        assert_eq!(settings.enc_frame_type, FrameType::empty());
    }

    #[test]
    fn idr_boost_is_capped() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 50000);
        frame(&session, 20_000, 8000);
        session
            .update_network_state(&PerFrameNetworkData {
                idr_required: true,
                ..network(20_000, 8000)
            })
            .unwrap();
        session.bitstream_sent(&encoded(8000, 2)).unwrap();
        let settings = session.predict_enc_settings().unwrap();
        assert!(settings.enc_frame_type.contains(FrameType::IDR));
        assert_eq!(settings.frame_size_in_bytes, 50000);
    }

    #[test]
    fn idr_is_not_boosted_on_congested_network() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 100000);
        session
            .update_network_state(&PerFrameNetworkData {
                idr_required: true,
                ..network(90_000, 8000)
            })
            .unwrap();
        session.bitstream_sent(&encoded(8000, 1)).unwrap();
        let settings = session.predict_enc_settings().unwrap();
        assert!(settings.enc_frame_type.contains(FrameType::IDR));
        let expected = session.inspect_model(|m| m.next_frame_size()).unwrap();
        assert_eq!(settings.frame_size_in_bytes, expected);
    }

    #[test]
    fn sent_idr_clears_the_request() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 0);
        session
            .update_network_state(&PerFrameNetworkData {
                idr_required: true,
                ..network(20_000, 8000)
            })
            .unwrap();
        session
            .bitstream_sent(&EncodedFrameFeedback {
                enc_frame_type: FrameType::IDR | FrameType::I,
                frame_size_in_bytes: 8000,
                frame_order: 1,
            })
            .unwrap();
        let settings = session.predict_enc_settings().unwrap();
        assert_eq!(settings.enc_frame_type, FrameType::empty());
    }

    #[test]
    fn drop_runs_follow_backlog() {
        let session = PredictorSession::new();
        session
            .start(&InitParams {
                features_set: (Features::PREDICT_FRAME_SIZE | Features::FRAME_DROP).bits(),
                target_delay_in_ms: 60,
                max_sequential_drops_count: 3,
                min_drop_frames_distance: 2,
                ..Default::default()
            })
            .unwrap();

        // 200 ms is a backlog of round(200 / 60) = 3 frames
        let pattern: Vec<bool> = (0..10)
            .map(|_| frame(&session, 200_000, 8000).drop_frame)
            .collect();
        assert_eq!(
            pattern,
            vec![true, true, true, false, false, true, true, true, false, false]
        );
    }

    #[test]
    fn short_backlog_drops_fewer_frames() {
        let session = started(Features::PREDICT_FRAME_SIZE | Features::FRAME_DROP, 60, 0);

        // round(100 / 60) = 2, default distance of 1
        let pattern: Vec<bool> = (0..6)
            .map(|_| frame(&session, 100_000, 8000).drop_frame)
            .collect();
        assert_eq!(pattern, vec![true, true, false, true, true, false]);
    }

    #[test]
    fn dropped_frame_has_no_size() {
        let session = started(Features::PREDICT_FRAME_SIZE | Features::FRAME_DROP, 60, 0);
        let settings = frame(&session, 200_000, 8000);
        assert!(settings.drop_frame);
        assert_eq!(settings.frame_size_in_bytes, 0);
    }

    #[test]
    fn no_drops_without_the_feature() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 0);
        for _ in 0..10 {
            assert!(!frame(&session, 500_000, 8000).drop_frame);
        }
    }

    #[test]
    fn surplus_network_feedback_sets_last_known_delay() {
        let session = started(Features::PREDICT_FRAME_SIZE | Features::FRAME_DROP, 60, 0);
        session.update_network_state(&network(40_000, 8000)).unwrap();
        session.update_network_state(&network(40_000, 8000)).unwrap();
        session.update_network_state(&network(200_000, 8000)).unwrap();
        session.bitstream_sent(&encoded(8000, 1)).unwrap();

        let settings = session.predict_enc_settings().unwrap();
        assert!(settings.drop_frame);
        assert_eq!(session.inspect_model(|m| m.sample_count()).unwrap(), 1);
    }

    #[test]
    fn surplus_encoded_sizes_decay_the_target() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 50000);
        let first = frame(&session, 40_000, 8000).frame_size_in_bytes;
        let target = session.inspect_model(|m| m.next_target_size()).unwrap();

        for order in 2..5 {
            session.bitstream_sent(&encoded(8000, order)).unwrap();
        }
        let settings = session.predict_enc_settings().unwrap();

        session
            .inspect_model(|m| {
                assert_eq!(m.sample_count(), 1);
                assert!((m.next_target_size() - target * 0.95f64.powi(3)).abs() < 1e-9);
                assert_eq!(settings.frame_size_in_bytes, m.next_frame_size());
            })
            .unwrap();
        assert!(settings.frame_size_in_bytes < first);
    }

    #[test]
    fn surplus_encoded_sizes_wait_for_network_feedback() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 50000);
        session.bitstream_sent(&encoded(8000, 1)).unwrap();
        session.bitstream_sent(&encoded(8000, 2)).unwrap();
        assert_eq!(session.predict_enc_settings().unwrap().frame_size_in_bytes, 0);

        // The cached sizes are paired once feedback arrives
        session.update_network_state(&network(40_000, 8000)).unwrap();
        session.update_network_state(&network(40_000, 8000)).unwrap();
        assert_eq!(
            session.predict_enc_settings().unwrap().frame_size_in_bytes,
            10780
        );
        assert_eq!(session.inspect_model(|m| m.sample_count()).unwrap(), 2);
    }

    #[test]
    fn target_never_halves_between_frames() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 50000);
        session
            .configure_model(|m| m.set_output_filter_factor(0.0))
            .unwrap();

        let first = frame(&session, 20_000, 8000).frame_size_in_bytes;
        assert_eq!(first, 21560);
        let second = frame(&session, 500_000, 8000).frame_size_in_bytes;
        assert_eq!(second, first / 2);
        let third = frame(&session, 500_000, 8000).frame_size_in_bytes;
        assert!(third >= second / 2);
    }

    #[test]
    fn stop_clears_cached_feedback() {
        let session = started(Features::PREDICT_FRAME_SIZE, 60, 50000);
        session.update_network_state(&network(40_000, 8000)).unwrap();
        session.bitstream_sent(&encoded(8000, 1)).unwrap();
        session.stop().unwrap();

        session
            .start(&InitParams {
                target_delay_in_ms: 60,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(session.predict_enc_settings().unwrap(), FrameSettings::default());
    }

    #[test]
    fn cache_overflow_is_counted() {
        let session = PredictorSession::new();
        session
            .start(&InitParams {
                target_delay_in_ms: 60,
                cache_capacity: 4,
                ..Default::default()
            })
            .unwrap();
        for _ in 0..6 {
            session.update_network_state(&network(40_000, 8000)).unwrap();
        }
        assert_eq!(session.dropped_samples(), 2);

        session.stop().unwrap();
        assert_eq!(session.dropped_samples(), 0);
    }
}
