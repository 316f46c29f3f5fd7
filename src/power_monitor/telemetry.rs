use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::MonitorError;
use super::types::{BatchReadings, ChannelId, PowerReading};

/* Solar readings below this many watts are inverter standby noise. */
const SOLAR_NOISE_FLOOR: f64 = 20.0;

/// Power and signed current totals of one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub real_power: f64,
    /// Sum of the channels' signed currents.
    pub current: f64,
}

impl Aggregate {
    fn add(&mut self, real_power: f64, current: f64) {
        self.real_power += real_power;
        self.current += current;
    }

    fn scaled(&self, n: f64) -> Aggregate {
        Aggregate {
            real_power: self.real_power / n,
            current: self.current / n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub channels: BTreeMap<ChannelId, PowerReading>,
    /// Home consumption: every grid channel plus solar production.
    pub aggregate: Aggregate,
    /// Exchange with the grid; negative power is export.
    pub net: Aggregate,
    /// Present when a solar channel is configured.
    pub solar: Option<Aggregate>,
    pub rms_voltage: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    readings: usize,
    real_power: f64,
    rms_current: f64,
    rms_voltage: f64,
    power_factor: f64,
}

impl Accumulator {
    fn add(&mut self, reading: &PowerReading) {
        self.readings += 1;
        self.real_power += reading.real_power;
        self.rms_current += reading.rms_current;
        self.rms_voltage += reading.rms_voltage;
        self.power_factor += reading.power_factor;
    }

    fn mean(&self) -> PowerReading {
        let n = self.readings.max(1) as f64;
        PowerReading {
            real_power: self.real_power / n,
            rms_current: self.rms_current / n,
            rms_voltage: self.rms_voltage / n,
            power_factor: self.power_factor / n,
        }
    }
}

/// Averages consecutive batch readings into one telemetry record.
#[derive(Debug)]
pub struct TelemetryWindow {
    size: usize,
    batches: usize,
    first_capture: Option<DateTime<Utc>>,
    channels: BTreeMap<ChannelId, Accumulator>,
    solar_channel: Option<ChannelId>,
    aggregate: Aggregate,
    net: Aggregate,
    solar: Aggregate,
    rms_voltage: f64,
}

impl TelemetryWindow {
    pub fn new(size: usize) -> Self {
        TelemetryWindow {
            size: size.max(1),
            batches: 0,
            first_capture: None,
            channels: BTreeMap::new(),
            solar_channel: None,
            aggregate: Aggregate::default(),
            net: Aggregate::default(),
            solar: Aggregate::default(),
            rms_voltage: 0.0,
        }
    }

    /// Treat `channel` as a production feed rather than a grid feed.
    pub fn with_solar_channel(mut self, channel: Option<ChannelId>) -> Self {
        self.solar_channel = channel;
        self
    }

    pub fn len(&self) -> usize {
        self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }

    /*
    * @brief Add the readings of one batch to the window.
    * @param readings Readings of a validated batch.
    * @return The averaged record once the window holds `size` batches; the window then starts over.
    */
    pub fn push(&mut self, readings: &BatchReadings) -> Option<TelemetryRecord> {
        self.first_capture.get_or_insert(readings.captured_at);
        self.batches += 1;
        self.rms_voltage += readings.rms_voltage;

        let mut grid = Aggregate::default();
        let mut solar = Aggregate::default();
        for (channel, reading) in &readings.channels {
            self.channels.entry(*channel).or_default().add(reading);
            if Some(*channel) != self.solar_channel {
                grid.add(reading.real_power, reading.signed_current());
            } else if reading.real_power >= SOLAR_NOISE_FLOOR {
                // Production flows against the grid feeds.
                solar.add(reading.real_power, -reading.rms_current);
            }
        }

        self.aggregate.add(grid.real_power + solar.real_power, grid.current - solar.current);
        self.net.add(grid.real_power, grid.current);
        self.solar.add(solar.real_power, solar.current);

        if self.batches < self.size {
            return None;
        }
        self.take()
    }

    /// Averages whatever the window holds, if anything, and resets it.
    pub fn take(&mut self) -> Option<TelemetryRecord> {
        let timestamp = self.first_capture.take()?;
        let n = self.batches as f64;

        let record = TelemetryRecord {
            timestamp,
            channels: self.channels.iter().map(|(&c, acc)| (c, acc.mean())).collect(),
            aggregate: self.aggregate.scaled(n),
            net: self.net.scaled(n),
            solar: self.solar_channel.map(|_| self.solar.scaled(n)),
            rms_voltage: self.rms_voltage / n,
        };

        *self = TelemetryWindow::new(self.size).with_solar_channel(self.solar_channel);
        Some(record)
    }
}

/// Destination of telemetry records.
pub trait TelemetrySink {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), MonitorError>;

    fn flush(&mut self) -> Result<(), MonitorError> {
        Ok(())
    }
}

impl<K: TelemetrySink + ?Sized> TelemetrySink for Box<K> {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), MonitorError> {
        (**self).write(record)
    }

    fn flush(&mut self) -> Result<(), MonitorError> {
        (**self).flush()
    }
}

/// InfluxDB line protocol writer.
///
/// Each record becomes one `raw_cts` point per channel plus `home_load`, `net`,
/// `solar` (when configured) and `voltages` points, all stamped with the record
/// time in nanoseconds.
pub struct LineProtocolSink<W: Write> {
    writer: W,
    flush_every: usize,
    pending: usize,
}

impl LineProtocolSink<BufWriter<File>> {
    pub fn append_to(path: &Path, flush_every: usize) -> Result<Self, MonitorError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LineProtocolSink::new(BufWriter::new(file), flush_every))
    }
}

impl<W: Write> LineProtocolSink<W> {
    pub fn new(writer: W, flush_every: usize) -> Self {
        LineProtocolSink {
            writer,
            flush_every: flush_every.max(1),
            pending: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn timestamp_ns(timestamp: &DateTime<Utc>) -> i64 {
    timestamp.timestamp() * 1_000_000_000 + i64::from(timestamp.timestamp_subsec_nanos())
}

impl<W: Write> TelemetrySink for LineProtocolSink<W> {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), MonitorError> {
        let ts = timestamp_ns(&record.timestamp);

        for (channel, reading) in &record.channels {
            writeln!(
                self.writer,
                "raw_cts,ct={} power={:.3},current={:.3},pf={:.4} {}",
                channel, reading.real_power, reading.rms_current, reading.power_factor, ts
            )?;
        }
        writeln!(
            self.writer,
            "home_load power={:.3},current={:.3} {}",
            record.aggregate.real_power, record.aggregate.current, ts
        )?;
        writeln!(
            self.writer,
            "net power={:.3},current={:.3} {}",
            record.net.real_power, record.net.current, ts
        )?;
        if let Some(solar) = record.solar {
            writeln!(
                self.writer,
                "solar power={:.3},current={:.3} {}",
                solar.real_power, solar.current, ts
            )?;
        }
        writeln!(self.writer, "voltages voltage={:.3} {}", record.rms_voltage, ts)?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MonitorError> {
        self.pending = 0;
        self.writer.flush()?;
        Ok(())
    }
}

/// Reports records through the logger.
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn write(&mut self, record: &TelemetryRecord) -> Result<(), MonitorError> {
        log::info!(
            "{} | home load {:.1} W, {:.2} A | net {:.1} W | {:.1} V",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.aggregate.real_power,
            record.aggregate.current,
            record.net.real_power,
            record.rms_voltage
        );
        if let Some(solar) = record.solar {
            log::info!("  solar: {:.1} W, {:.2} A", solar.real_power, solar.current);
        }
        for (channel, reading) in &record.channels {
            log::debug!(
                "  {}: {:.1} W, {:.2} A, PF {:.4}",
                channel,
                reading.real_power,
                reading.rms_current,
                reading.power_factor
            );
        }
        Ok(())
    }
}
