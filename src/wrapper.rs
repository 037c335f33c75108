//! Simplified per-frame interface for encoder drivers.

use crate::{
    error::{Result, TcaeError},
    session::PredictorSession,
    types::{EncodedFrameFeedback, Features, FrameType, InitParams, PerFrameNetworkData},
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

const BUFFERED_RECORDS_COUNT: u32 = 100;

const CSV_HEADER: &str = "FrameDelay,FrameSize,EncSize,PredSize";

/// Values of the current frame, written as one CSV row.
#[derive(Debug, Clone, Copy, Default)]
struct LogEntry {
    delay: u32,
    size: u32,
    encoded_size: u32,
    target_size: u32,
}

pub struct TcaeWrapper {
    session: Option<PredictorSession>,
    log_path: Option<PathBuf>,
    log_file: Option<BufWriter<File>>,
    entry: LogEntry,
}

impl Default for TcaeWrapper {
    fn default() -> Self {
        TcaeWrapper::new()
    }
}

impl TcaeWrapper {
    pub fn new() -> TcaeWrapper {
        TcaeWrapper {
            session: None,
            log_path: None,
            log_file: None,
            entry: LogEntry::default(),
        }
    }

    /// Also writes every prediction and its inputs to a CSV file at `path`.
    pub fn with_log_path(path: impl Into<PathBuf>) -> TcaeWrapper {
        TcaeWrapper {
            log_path: Some(path.into()),
            ..TcaeWrapper::new()
        }
    }

    /// Starts a standalone session. A `max_frame_size` of 0 keeps the session default.
    pub fn initialize(&mut self, target_delay_ms: u32, max_frame_size: u32) -> Result<()> {
        let session = PredictorSession::new();
        let params = InitParams {
            features_set: Features::STANDALONE.bits(),
            target_delay_in_ms: target_delay_ms,
            buffered_records_count: BUFFERED_RECORDS_COUNT,
            max_frame_size_in_bytes: max_frame_size,
            ..Default::default()
        };

        if let Err(err) = session.start(&params) {
            log::error!("Failed to start TCAE: {}", err);
            return Err(err);
        }
        log::info!("TCAE started, target delay {} ms", target_delay_ms);
        self.session = Some(session);

        self.open_log();
        Ok(())
    }

    fn open_log(&mut self) {
        let Some(path) = &self.log_path else {
            return;
        };

        let file = File::create(path).and_then(|file| {
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{}", CSV_HEADER)?;
            writer.flush()?;
            Ok(writer)
        });

        match file {
            Ok(writer) => {
                self.entry = LogEntry::default();
                self.log_file = Some(writer);
            }
            Err(err) => {
                log::warn!(
                    "Could not open {} for TCAE logs, disabling them: {}",
                    path.display(),
                    err
                );
                self.log_path = None;
            }
        }
    }

    fn session(&self) -> Result<&PredictorSession> {
        self.session.as_ref().ok_or(TcaeError::NullPtr)
    }

    /// Reports the measured delay (microseconds) and size of the last transmitted frame.
    pub fn update_client_feedback(&mut self, delay_us: u32, size: u32) -> Result<()> {
        let data = PerFrameNetworkData {
            last_packet_delay_in_us: delay_us,
            transmitted_data_size_in_bytes: size,
            ..Default::default()
        };

        if let Err(err) = self.session()?.update_network_state(&data) {
            log::warn!("TCAE: update_network_state failed with code {}", err.code());
            return Err(err);
        }

        self.entry.delay = delay_us;
        self.entry.size = size;
        Ok(())
    }

    pub fn update_encoded_size(&mut self, encoded_size: u32) -> Result<()> {
        let feedback = EncodedFrameFeedback {
            enc_frame_type: FrameType::empty(),
            frame_size_in_bytes: encoded_size,
            frame_order: 0,
        };

        if let Err(err) = self.session()?.bitstream_sent(&feedback) {
            log::warn!("TCAE: bitstream_sent failed with code {}", err.code());
            return Err(err);
        }

        self.entry.encoded_size = encoded_size;
        Ok(())
    }

    /// Target size in bytes for the next frame. 0 while nothing is known about the network.
    pub fn get_target_size(&mut self) -> Result<u32> {
        let settings = match self.session()?.predict_enc_settings() {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!("TCAE: failed to predict encode settings, code {}", err.code());
                return Err(err);
            }
        };

        self.entry.target_size = settings.frame_size_in_bytes;
        self.write_log_entry();

        Ok(settings.frame_size_in_bytes)
    }

    fn write_log_entry(&mut self) {
        let Some(writer) = &mut self.log_file else {
            return;
        };

        let entry = self.entry;
        let result = writeln!(
            writer,
            "{}, {}, {}, {}",
            entry.delay, entry.size, entry.encoded_size, entry.target_size
        )
        .and_then(|_| writer.flush());

        if let Err(err) = result {
            log::warn!("Writing TCAE log failed, disabling it: {}", err);
            self.log_file = None;
            self.log_path = None;
        }
    }

    /// The underlying session, once initialized.
    pub fn predictor_session(&self) -> Option<&PredictorSession> {
        self.session.as_ref()
    }
}
