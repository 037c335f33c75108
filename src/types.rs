use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Predictor features requested at session start.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// Prediction of the target frame size. Mandatory.
        const PREDICT_FRAME_SIZE = 0x0001;
        /// Frame drop logic.
        const FRAME_DROP = 0x0002;
        /// Frame order correlation with the transport layer is not required.
        const STANDALONE = 0x0004;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameType: u16 {
        const I = 0x0001;
        const P = 0x0002;
        const B = 0x0004;
        /// SI or SP frame
        const S = 0x0008;
        const REF = 0x0040;
        const IDR = 0x0080;
    }
}

/// Session parameters. A zero field means "use the default value", except for
/// `target_delay_in_ms` which has no default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitParams {
    /// Raw [`Features`] bits. Unknown bits are rejected at start.
    pub features_set: u32,
    pub target_delay_in_ms: u32,
    pub buffered_records_count: u32,
    pub max_sequential_drops_count: u16,
    pub max_frame_size_in_bytes: u32,
    pub min_drop_frames_distance: u16,
    /// Capacity of each feedback cache before the oldest entries get evicted.
    pub cache_capacity: u32,
}

/// Per-frame feedback from the transport layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerFrameNetworkData {
    pub first_packet_delay_in_us: u32,
    pub last_packet_delay_in_us: u32,
    pub transmitted_data_size_in_bytes: u32,
    pub packet_loss_rate: u32,
    pub credit_bytes: i32,
    pub idr_required: bool,
}

/// Feedback from the encoder once a frame's bitstream has been handed to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodedFrameFeedback {
    pub enc_frame_type: FrameType,
    pub frame_size_in_bytes: u32,
    pub frame_order: u64,
}

/// Encoder settings for the next frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSettings {
    pub enc_frame_type: FrameType,
    pub frame_size_in_bytes: u32,
    pub drop_frame: bool,
}
