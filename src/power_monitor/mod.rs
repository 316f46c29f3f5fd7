pub mod calibration;
pub mod config;
pub mod error;
pub mod generate_signal;
pub mod harmonics;
pub mod power;
pub mod print;
pub mod record;
pub mod source;
#[cfg(target_os = "linux")]
pub mod spi;
pub mod telemetry;
pub mod types;
pub mod waveform;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

pub use calibration::{CalibrationReport, LiveProbe, Operator, PhaseCalibrator, PhaseProbe};
pub use config::{ConfigError, MonitorConfig};
pub use error::MonitorError;
pub use generate_signal::{SimulatedLoad, SimulatedSource};
pub use power::{calculate_power, AcReference, ScaleFactors};
pub use source::{ReplaySource, SampleSource};
pub use telemetry::{LineProtocolSink, LogSink, TelemetryRecord, TelemetrySink, TelemetryWindow};
pub use types::{BatchReadings, ChannelId, PowerReading, SampleBatch};
pub use waveform::{reconstruct_channels, reconstruct_voltage};

/// Measurement pipeline of the configured channels.
#[derive(Debug, Clone)]
pub struct PowerMonitor {
    pub config: MonitorConfig,
}

impl PowerMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        PowerMonitor { config }
    }

    /*
    * @brief Turn one raw batch into readings for every configured channel.
    * @param batch Raw batch from a sample source.
    * @param board_voltage Measured converter reference voltage.
    * @return Readings keyed by channel; the batch is rejected whole when it breaks the acquisition contract.
    */
    pub fn process_batch(&self, batch: &SampleBatch, board_voltage: f64) -> Result<BatchReadings, MonitorError> {
        batch.validate(self.config.adc_resolution)?;

        let coefficients = self.config.phase_coefficients();
        for channel in coefficients.keys() {
            batch.current(*channel)?;
        }

        let waves = reconstruct_channels(&batch.voltage, &coefficients);

        let mut channels = BTreeMap::new();
        for (channel, wave) in &waves {
            let scales = self.config.scale_factors(*channel, board_voltage)?;
            let reading = calculate_power(batch.current(*channel)?, wave, scales)?;
            channels.insert(*channel, reading);
        }

        // Every channel sees the same mains, the first one stands for all.
        let rms_voltage = channels.values().next().map_or(0.0, |r: &PowerReading| r.rms_voltage);

        Ok(BatchReadings {
            captured_at: batch.captured_at,
            channels,
            rms_voltage,
        })
    }

    /*
    * @brief Measure until `stop` is raised or the source runs dry.
    * @param source Sample source.
    * @param sink Destination of the averaged records.
    * @param stop Flag raised by the signal handlers.
    * @param report Print every batch's readings as a table.
    * @return Number of records written.
    * @note Batches that break the acquisition contract are logged and skipped. The sink is flushed on every exit.
    */
    pub fn run<S, K>(&self, source: &mut S, sink: &mut K, stop: &AtomicBool, report: bool) -> Result<usize, MonitorError>
    where
        S: SampleSource + ?Sized,
        K: TelemetrySink + ?Sized,
    {
        let result = self.measure(source, sink, stop, report);
        let flushed = sink.flush();
        let written = result?;
        flushed?;
        Ok(written)
    }

    fn measure<S, K>(&self, source: &mut S, sink: &mut K, stop: &AtomicBool, report: bool) -> Result<usize, MonitorError>
    where
        S: SampleSource + ?Sized,
        K: TelemetrySink + ?Sized,
    {
        let mut window =
            TelemetryWindow::new(self.config.averaging_window).with_solar_channel(self.config.telemetry.solar_channel);
        let mut written = 0;

        while !stop.load(Ordering::Relaxed) {
            let board_voltage = source.board_voltage()?;
            let batch = match source.acquire(self.config.num_samples) {
                Ok(batch) => batch,
                Err(MonitorError::SourceExhausted) => {
                    log::info!("Sample source exhausted");
                    break;
                }
                Err(e) => return Err(e),
            };

            let processed = batch
                .check_complete(self.config.num_samples)
                .and_then(|()| self.process_batch(&batch, board_voltage));
            let readings = match processed {
                Ok(readings) => readings,
                Err(e) if e.is_batch_fault() => {
                    log::warn!("Dropping batch captured at {}: {}", batch.captured_at, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if report {
                print::print_readings(&readings);
            }
            if let Some(record) = window.push(&readings) {
                sink.write(&record)?;
                written += 1;
            }
        }

        if !window.is_empty() {
            log::debug!("Discarding {} batch(es) of an incomplete averaging window", window.len());
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ct(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn two_channel_config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.channels.retain(|channel, _| channel.number() <= 2);
        for cfg in config.channels.values_mut() {
            cfg.phase_correction = 1.0;
        }
        config.num_samples = 400;
        config
    }

    #[test]
    fn every_configured_channel_gets_a_reading() {
        let monitor = PowerMonitor::new(two_channel_config());
        let mut source = SimulatedSource::for_channels([ct(1), ct(2)]);
        let batch = source.acquire(400).unwrap();

        let readings = monitor.process_batch(&batch, 3.3).unwrap();

        assert_eq!(readings.channels.len(), 2);
        assert_eq!(readings.rms_voltage, readings.channels[&ct(1)].rms_voltage);
        assert!(readings.channels.values().all(|r| r.real_power > 0.0));
    }

    #[test]
    fn batch_missing_a_configured_channel_is_rejected() {
        let monitor = PowerMonitor::new(two_channel_config());
        let mut source = SimulatedSource::for_channels([ct(1)]);
        let batch = source.acquire(400).unwrap();
        assert!(matches!(
            monitor.process_batch(&batch, 3.3),
            Err(MonitorError::MissingChannel(id)) if id == ct(2)
        ));
    }

    #[test]
    fn mismatched_batch_is_rejected_whole() {
        let monitor = PowerMonitor::new(two_channel_config());
        let batch = SampleBatch {
            captured_at: Utc::now(),
            voltage: vec![512; 10],
            currents: [(ct(1), vec![512; 10]), (ct(2), vec![512; 9])].into_iter().collect(),
        };
        let err = monitor.process_batch(&batch, 3.3).unwrap_err();
        assert!(err.is_batch_fault());
    }

    struct Collect(Vec<TelemetryRecord>, usize);

    impl TelemetrySink for Collect {
        fn write(&mut self, record: &TelemetryRecord) -> Result<(), MonitorError> {
            self.0.push(record.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<(), MonitorError> {
            self.1 += 1;
            Ok(())
        }
    }

    #[test]
    fn raised_stop_flag_ends_the_loop_immediately() {
        let monitor = PowerMonitor::new(two_channel_config());
        let mut source = SimulatedSource::for_channels([ct(1), ct(2)]);
        let mut sink = Collect(Vec::new(), 0);
        let stop = AtomicBool::new(true);

        assert_eq!(monitor.run(&mut source, &mut sink, &stop, false).unwrap(), 0);
        assert_eq!(sink.1, 1);
    }
}
