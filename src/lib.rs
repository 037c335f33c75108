pub mod error;
pub mod net_pred;
pub mod session;
mod types;
pub mod util;
mod wrapper;

pub use error::{status_code, TcaeError};
pub use net_pred::NetPred;
pub use session::PredictorSession;
pub use types::{
    EncodedFrameFeedback, Features, FrameSettings, FrameType, InitParams, PerFrameNetworkData,
};
pub use wrapper::TcaeWrapper;
