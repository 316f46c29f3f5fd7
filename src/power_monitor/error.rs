use thiserror::Error;

use super::config::ConfigError;
use super::types::ChannelId;

/// Errors raised by the measurement and calibration paths.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("sample batch is empty")]
    EmptySamples,
    #[error("sample batch needs more than one sample per channel, got {0}")]
    TooFewSamples(usize),
    #[error("sample length mismatch on {signal}: expected {expected}, got {actual}")]
    LengthMismatch {
        signal: String,
        expected: usize,
        actual: usize,
    },
    #[error("code {code} on {signal} is outside the converter range 0..{resolution}")]
    CodeOutOfRange { signal: String, code: u16, resolution: u32 },
    #[error("invalid channel '{0}': expected ct1 to ct6")]
    InvalidChannel(String),
    #[error("batch carries no samples for {0}")]
    MissingChannel(ChannelId),
    #[error("{0} is not configured")]
    UnconfiguredChannel(ChannelId),
    #[error(
        "calibration of {channel} failed the {check} check: power factor {power_factor:.4}, \
         the current transformer still looks reversed"
    )]
    SensorReversed {
        channel: ChannelId,
        check: &'static str,
        power_factor: f64,
    },
    #[error("calibration of {channel} aborted by the operator at the {check} check")]
    CalibrationAborted { channel: ChannelId, check: &'static str },
    #[error("calibration of {channel} failed during the {check} measurement: {source}")]
    CalibrationFailed {
        channel: ChannelId,
        check: String,
        #[source]
        source: Box<MonitorError>,
    },
    #[error("record title '{0}' gives no usable file name")]
    InvalidTitle(String),
    #[error("sample source has no more batches")]
    SourceExhausted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SPI transfer failed: {0}")]
    Spi(#[from] nix::errno::Errno),
}

impl MonitorError {
    /// True when the fault lies in the shape or content of one batch. Such a
    /// batch is dropped; every other fault ends the measurement loop.
    pub fn is_batch_fault(&self) -> bool {
        matches!(
            self,
            MonitorError::EmptySamples
                | MonitorError::TooFewSamples(_)
                | MonitorError::LengthMismatch { .. }
                | MonitorError::CodeOutOfRange { .. }
                | MonitorError::MissingChannel(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_faults_name_channel_and_check() {
        let channel = ChannelId::new(3).unwrap();
        let err = MonitorError::SensorReversed {
            channel,
            check: "orientation re-check",
            power_factor: -0.97,
        };
        let message = err.to_string();
        assert!(message.contains("ct3"));
        assert!(message.contains("orientation re-check"));
        assert!(message.contains("-0.9700"));
    }

    #[test]
    fn failed_measurement_keeps_its_cause() {
        use std::error::Error as _;

        let err = MonitorError::CalibrationFailed {
            channel: ChannelId::new(5).unwrap(),
            check: "round 2 baseline".to_string(),
            source: Box::new(MonitorError::TooFewSamples(1)),
        };
        let message = err.to_string();
        assert!(message.contains("ct5"));
        assert!(message.contains("round 2 baseline"));
        assert!(message.contains("got 1"));
        assert!(err.source().is_some());
        assert!(!err.is_batch_fault());
    }

    #[test]
    fn only_shape_faults_are_batch_faults() {
        assert!(MonitorError::EmptySamples.is_batch_fault());
        assert!(MonitorError::LengthMismatch {
            signal: "ct1".into(),
            expected: 4,
            actual: 3
        }
        .is_batch_fault());
        assert!(!MonitorError::SourceExhausted.is_batch_fault());
        assert!(!MonitorError::Spi(nix::errno::Errno::EIO).is_batch_fault());
    }
}
