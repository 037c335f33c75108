use super::cache::DEFAULT_CACHE_CAPACITY;
use crate::{
    error::{Result, TcaeError},
    types::{Features, InitParams},
};

const DEFAULT_RECORDS_COUNT: u32 = 100;
const DEFAULT_MAX_DROPS_COUNT_IN_SEQUENCE: u16 = 3;
const DEFAULT_MIN_DROP_FRAMES_DISTANCE: u16 = 1;
const DEFAULT_MAX_FRAME_SIZE_IN_BYTES: u32 = 50000;

/// Session settings with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub features: Features,
    pub target_delay_in_ms: u32,
    pub buffered_records_count: u32,
    /// 0 when frame dropping is disabled.
    pub max_sequential_drops_count: u16,
    /// 0 when frame dropping is disabled.
    pub min_drop_frames_distance: u16,
    pub max_frame_size_in_bytes: u32,
    pub cache_capacity: usize,
}

impl SessionConfig {
    pub fn validate(params: &InitParams) -> Result<SessionConfig> {
        let features = match Features::from_bits(params.features_set) {
            None => return Err(TcaeError::InvalidArg),
            Some(f) if f.is_empty() => Features::PREDICT_FRAME_SIZE,
            // Standalone on its own keeps the default features
            Some(f) if f == Features::STANDALONE => Features::PREDICT_FRAME_SIZE | f,
            Some(f) => f,
        };
        if !features.contains(Features::PREDICT_FRAME_SIZE) {
            return Err(TcaeError::Unsupported);
        }

        let buffered_records_count = match params.buffered_records_count {
            0 => DEFAULT_RECORDS_COUNT,
            count => count,
        };

        // The only field without a default
        if params.target_delay_in_ms == 0 {
            return Err(TcaeError::InvalidArg);
        }

        let (max_sequential_drops_count, min_drop_frames_distance) =
            if features.contains(Features::FRAME_DROP) {
                (
                    non_zero_or(
                        params.max_sequential_drops_count,
                        DEFAULT_MAX_DROPS_COUNT_IN_SEQUENCE,
                    ),
                    non_zero_or(
                        params.min_drop_frames_distance,
                        DEFAULT_MIN_DROP_FRAMES_DISTANCE,
                    ),
                )
            } else {
                (0, 0)
            };

        let max_frame_size_in_bytes = match params.max_frame_size_in_bytes {
            0 => DEFAULT_MAX_FRAME_SIZE_IN_BYTES,
            size => size,
        };

        let cache_capacity = match params.cache_capacity {
            0 => DEFAULT_CACHE_CAPACITY,
            capacity => capacity as usize,
        };

        Ok(SessionConfig {
            features,
            target_delay_in_ms: params.target_delay_in_ms,
            buffered_records_count,
            max_sequential_drops_count,
            min_drop_frames_distance,
            max_frame_size_in_bytes,
            cache_capacity,
        })
    }

    pub fn frame_drop(&self) -> bool {
        self.features.contains(Features::FRAME_DROP)
    }

    pub fn standalone(&self) -> bool {
        self.features.contains(Features::STANDALONE)
    }
}

fn non_zero_or(value: u16, default: u16) -> u16 {
    if value == 0 {
        default
    } else {
        value
    }
}
