use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::MonitorError;

pub const MAX_CHANNELS: u8 = 6;

pub const DEFAULT_ADC_RESOLUTION: u32 = 1024; // 10-bit MCP3008
pub const DEFAULT_NUM_SAMPLES: usize = 2000;
pub const DEFAULT_AVERAGING_WINDOW: usize = 2;

/// Current-sensing input, numbered 1 to 6 and written `ct1`..`ct6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(number: u8) -> Result<Self, MonitorError> {
        if (1..=MAX_CHANNELS).contains(&number) {
            Ok(ChannelId(number))
        } else {
            Err(MonitorError::InvalidChannel(number.to_string()))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = ChannelId> {
        (1..=MAX_CHANNELS).map(ChannelId)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct{}", self.0)
    }
}

impl FromStr for ChannelId {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("ct")
            .or_else(|| trimmed.strip_prefix("CT"))
            .unwrap_or(trimmed);

        digits
            .parse::<u8>()
            .ok()
            .and_then(|n| ChannelId::new(n).ok())
            .ok_or_else(|| MonitorError::InvalidChannel(s.to_string()))
    }
}

impl TryFrom<String> for ChannelId {
    type Error = MonitorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.to_string()
    }
}

/// One acquisition window: the shared voltage codes plus the current codes of
/// every sampled channel, all of the same length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub captured_at: DateTime<Utc>,
    pub voltage: Vec<u16>,
    pub currents: BTreeMap<ChannelId, Vec<u16>>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }

    /*
    * @brief Check the batch against the acquisition contract.
    * @param resolution Number of converter codes (1024 for a 10-bit ADC).
    * @return Ok when every sequence has the same length N > 1 and every code is below resolution.
    */
    pub fn validate(&self, resolution: u32) -> Result<(), MonitorError> {
        let expected = self.voltage.len();
        if expected == 0 {
            return Err(MonitorError::EmptySamples);
        }
        if expected < 2 {
            return Err(MonitorError::TooFewSamples(expected));
        }

        check_codes("voltage", &self.voltage, resolution)?;

        for (channel, codes) in &self.currents {
            if codes.len() != expected {
                return Err(MonitorError::LengthMismatch {
                    signal: channel.to_string(),
                    expected,
                    actual: codes.len(),
                });
            }
            check_codes(&channel.to_string(), codes, resolution)?;
        }

        Ok(())
    }

    /// A source must deliver exactly the requested length; partial batches are refused.
    pub fn check_complete(&self, num_samples: usize) -> Result<(), MonitorError> {
        if self.voltage.len() != num_samples {
            return Err(MonitorError::LengthMismatch {
                signal: "voltage".to_string(),
                expected: num_samples,
                actual: self.voltage.len(),
            });
        }
        Ok(())
    }

    pub fn current(&self, channel: ChannelId) -> Result<&[u16], MonitorError> {
        self.currents
            .get(&channel)
            .map(Vec::as_slice)
            .ok_or(MonitorError::MissingChannel(channel))
    }
}

fn check_codes(signal: &str, codes: &[u16], resolution: u32) -> Result<(), MonitorError> {
    match codes.iter().find(|&&code| u32::from(code) >= resolution) {
        Some(&code) => Err(MonitorError::CodeOutOfRange {
            signal: signal.to_string(),
            code,
            resolution,
        }),
        None => Ok(()),
    }
}

/// Power figures of one channel over one batch (or an averaging window).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub real_power: f64,   // W, negative when exporting
    pub rms_current: f64,  // A
    pub rms_voltage: f64,  // V
    pub power_factor: f64, // 0 when apparent power is 0
}

impl PowerReading {
    pub fn apparent_power(&self) -> f64 {
        self.rms_voltage * self.rms_current
    }

    /// RMS current carrying the direction of the real power flow.
    pub fn signed_current(&self) -> f64 {
        if self.real_power < 0.0 {
            -self.rms_current
        } else {
            self.rms_current
        }
    }
}

/// Readings of every configured channel for a single batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReadings {
    pub captured_at: DateTime<Utc>,
    pub channels: BTreeMap<ChannelId, PowerReading>,
    pub rms_voltage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ct(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn batch(voltage: Vec<u16>, currents: Vec<(u8, Vec<u16>)>) -> SampleBatch {
        SampleBatch {
            captured_at: Utc::now(),
            voltage,
            currents: currents.into_iter().map(|(n, c)| (ct(n), c)).collect(),
        }
    }

    #[test]
    fn channel_ids_parse_both_spellings() {
        assert_eq!("ct4".parse::<ChannelId>().unwrap(), ct(4));
        assert_eq!("CT2".parse::<ChannelId>().unwrap(), ct(2));
        assert_eq!("6".parse::<ChannelId>().unwrap(), ct(6));
        assert!("ct0".parse::<ChannelId>().is_err());
        assert!("ct7".parse::<ChannelId>().is_err());
        assert!("voltage".parse::<ChannelId>().is_err());
        assert_eq!(ct(5).to_string(), "ct5");
        assert_eq!(ChannelId::all().count(), 6);
    }

    #[test]
    fn valid_batch_passes() {
        let b = batch(vec![500, 520, 540], vec![(1, vec![10, 20, 30]), (2, vec![0, 1023, 7])]);
        assert!(b.validate(1024).is_ok());
        assert_eq!(b.current(ct(2)).unwrap(), &[0, 1023, 7]);
    }

    #[test]
    fn empty_and_single_sample_batches_are_rejected() {
        let empty = batch(vec![], vec![]);
        assert!(matches!(empty.validate(1024), Err(MonitorError::EmptySamples)));

        let single = batch(vec![512], vec![(1, vec![512])]);
        assert!(matches!(single.validate(1024), Err(MonitorError::TooFewSamples(1))));
    }

    #[test]
    fn mismatched_channel_is_rejected_not_truncated() {
        let b = batch(vec![1, 2, 3, 4], vec![(1, vec![1, 2, 3, 4]), (3, vec![1, 2, 3])]);
        match b.validate(1024) {
            Err(MonitorError::LengthMismatch {
                signal,
                expected,
                actual,
            }) => {
                assert_eq!(signal, "ct3");
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn codes_beyond_resolution_are_rejected() {
        let b = batch(vec![1, 1024], vec![(1, vec![0, 0])]);
        assert!(matches!(
            b.validate(1024),
            Err(MonitorError::CodeOutOfRange { code: 1024, .. })
        ));
    }

    #[test]
    fn short_batch_is_incomplete() {
        let b = batch(vec![1, 2, 3], vec![(1, vec![1, 2, 3])]);
        assert!(b.check_complete(3).is_ok());
        assert!(matches!(
            b.check_complete(2000),
            Err(MonitorError::LengthMismatch {
                expected: 2000,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn missing_channel_is_reported() {
        let b = batch(vec![1, 2], vec![(1, vec![1, 2])]);
        assert!(matches!(b.current(ct(4)), Err(MonitorError::MissingChannel(id)) if id == ct(4)));
    }

    #[test]
    fn signed_current_follows_power_direction() {
        let export = PowerReading {
            real_power: -120.0,
            rms_current: 0.5,
            rms_voltage: 240.0,
            power_factor: -1.0,
        };
        assert_eq!(export.signed_current(), -0.5);
        assert_eq!(export.apparent_power(), 120.0);
    }

    #[test]
    fn batch_round_trips_through_json_with_channel_keys() {
        let b = batch(vec![1, 2], vec![(2, vec![3, 4])]);
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"ct2\""));
        let back: SampleBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
