use std::collections::VecDeque;
use std::path::Path;

use super::error::MonitorError;
use super::types::SampleBatch;

/// Producer of raw converter batches. The core validates whatever it returns.
pub trait SampleSource {
    /// Acquire `num_samples` interleaved samples of the voltage and every current channel.
    fn acquire(&mut self, num_samples: usize) -> Result<SampleBatch, MonitorError>;

    /// Measured reference voltage of the converter, in volts.
    fn board_voltage(&mut self) -> Result<f64, MonitorError>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn acquire(&mut self, num_samples: usize) -> Result<SampleBatch, MonitorError> {
        (**self).acquire(num_samples)
    }

    fn board_voltage(&mut self) -> Result<f64, MonitorError> {
        (**self).board_voltage()
    }
}

/// Replays recorded batches in order, then reports exhaustion.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    batches: VecDeque<SampleBatch>,
    board_voltage: f64,
}

impl ReplaySource {
    pub fn new(batches: impl IntoIterator<Item = SampleBatch>, board_voltage: f64) -> Self {
        ReplaySource {
            batches: batches.into_iter().collect(),
            board_voltage,
        }
    }

    /// Loads a batch saved by the debug mode (the `batch` field of a visualizer record).
    pub fn from_record_file(path: &Path, board_voltage: f64) -> Result<Self, MonitorError> {
        let contents = std::fs::read_to_string(path)?;
        let record: super::record::VisualizerRecord = serde_json::from_str(&contents)?;
        Ok(ReplaySource::new(std::iter::once(record.batch), board_voltage))
    }

    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl SampleSource for ReplaySource {
    /// The requested length is ignored: recorded batches are returned as captured.
    fn acquire(&mut self, _num_samples: usize) -> Result<SampleBatch, MonitorError> {
        self.batches.pop_front().ok_or(MonitorError::SourceExhausted)
    }

    fn board_voltage(&mut self) -> Result<f64, MonitorError> {
        Ok(self.board_voltage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn batch(first: u16) -> SampleBatch {
        SampleBatch {
            captured_at: Utc::now(),
            voltage: vec![first, first + 1],
            currents: BTreeMap::new(),
        }
    }

    #[test]
    fn replays_in_order_then_runs_dry() {
        let mut source = ReplaySource::new(vec![batch(1), batch(10)], 3.3);
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.acquire(2000).unwrap().voltage, vec![1, 2]);
        assert_eq!(source.acquire(2000).unwrap().voltage, vec![10, 11]);
        assert!(matches!(source.acquire(2000), Err(MonitorError::SourceExhausted)));
        assert_eq!(source.board_voltage().unwrap(), 3.3);
    }

    #[test]
    fn boxed_sources_forward_calls() {
        let mut source: Box<dyn SampleSource> = Box::new(ReplaySource::new(vec![batch(5)], 3.31));
        assert_eq!(source.acquire(10).unwrap().voltage, vec![5, 6]);
        assert_eq!(source.board_voltage().unwrap(), 3.31);
    }
}
