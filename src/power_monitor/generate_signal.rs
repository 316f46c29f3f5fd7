use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::time::Duration;

use chrono::Utc;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::error::MonitorError;
use super::source::SampleSource;
use super::types::{ChannelId, SampleBatch, DEFAULT_ADC_RESOLUTION};

const MAINS_FREQUENCY: f64 = 50.0; // Hz
const SAMPLE_RATE: f64 = 1000.0; // interleaved samples per second, per signal
const VOLTAGE_AMPLITUDE: f64 = 300.0; // codes
const BOARD_VOLTAGE: f64 = 3.3;

/// Synthetic load seen by one current channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedLoad {
    /// Peak of the current wave, in codes.
    pub amplitude: f64,
    /// Current lag behind the voltage, in degrees (0 for a resistive load).
    pub phase_deg: f64,
    /// Delay between the voltage read and this channel's read, in samples.
    pub mux_delay: f64,
    /// Sensor clamped the wrong way round.
    pub reversed: bool,
}

impl SimulatedLoad {
    pub fn resistive(amplitude: f64, mux_delay: f64) -> Self {
        SimulatedLoad {
            amplitude,
            phase_deg: 0.0,
            mux_delay,
            reversed: false,
        }
    }
}

/// Sample source producing mains-like waves centred at mid-scale.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    resolution: u32,
    samples_per_cycle: f64,
    voltage_amplitude: f64,
    noise: f64,
    board_voltage: f64,
    loads: BTreeMap<ChannelId, SimulatedLoad>,
    pacing: Option<Duration>,
    cursor: usize,
    rng: StdRng,
}

fn offset(deg: f64) -> f64 {
    deg * 2.0 * PI / 360.0
}

impl SimulatedSource {
    pub fn new(loads: BTreeMap<ChannelId, SimulatedLoad>) -> Self {
        SimulatedSource {
            resolution: DEFAULT_ADC_RESOLUTION,
            samples_per_cycle: SAMPLE_RATE / MAINS_FREQUENCY,
            voltage_amplitude: VOLTAGE_AMPLITUDE,
            noise: 0.0,
            board_voltage: BOARD_VOLTAGE,
            loads,
            pacing: None,
            cursor: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// One resistive load per channel, each read a little later than the previous one.
    pub fn for_channels(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        let loads = channels
            .into_iter()
            .map(|channel| {
                let n = f64::from(channel.number());
                (channel, SimulatedLoad::resistive(120.0 + 20.0 * n, 0.05 * n))
            })
            .collect();
        SimulatedSource::new(loads)
    }

    pub fn with_resolution(mut self, resolution: u32) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_samples_per_cycle(mut self, samples_per_cycle: f64) -> Self {
        self.samples_per_cycle = samples_per_cycle;
        self
    }

    /// Uniform noise of +/- `codes` added to every signal.
    pub fn with_noise(mut self, codes: f64) -> Self {
        self.noise = codes;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Sleep between batches as long as the converter would take to capture them.
    pub fn paced(mut self, sample_rate: f64) -> Self {
        self.pacing = Some(Duration::from_secs_f64(1.0 / sample_rate));
        self
    }

    fn to_codes(&mut self, wave: Array1<f64>) -> Vec<u16> {
        let top = f64::from(self.resolution - 1);
        let noise = self.noise;
        wave.iter()
            .map(|&s| {
                let jitter = if noise > 0.0 { self.rng.gen_range(-noise..noise) } else { 0.0 };
                (s + jitter).round().clamp(0.0, top) as u16
            })
            .collect()
    }
}

impl SampleSource for SimulatedSource {
    fn acquire(&mut self, num_samples: usize) -> Result<SampleBatch, MonitorError> {
        let start = self.cursor as f64;
        let samples = Array1::range(start, start + num_samples as f64, 1.0);
        let omega = 2.0 * PI / self.samples_per_cycle;
        let mid = f64::from(self.resolution) / 2.0;

        let voltage_wave = samples.mapv(|s| mid + self.voltage_amplitude * (omega * s).sin());
        let voltage = self.to_codes(voltage_wave);

        let loads: Vec<(ChannelId, SimulatedLoad)> = self.loads.iter().map(|(&c, &l)| (c, l)).collect();
        let mut currents = BTreeMap::new();
        for (channel, load) in loads {
            let polarity = if load.reversed { -1.0 } else { 1.0 };
            let wave = samples.mapv(|s| {
                mid + polarity * load.amplitude * (omega * (s + load.mux_delay) - offset(load.phase_deg)).sin()
            });
            currents.insert(channel, self.to_codes(wave));
        }

        self.cursor += num_samples;
        if let Some(period) = self.pacing {
            match Duration::try_from_secs_f64(period.as_secs_f64() * num_samples as f64) {
                Ok(pause) => spin_sleep::sleep(pause),
                Err(e) => log::warn!("Not pacing a batch of {} samples: {}", num_samples, e),
            }
        }

        Ok(SampleBatch {
            captured_at: Utc::now(),
            voltage,
            currents,
        })
    }

    fn board_voltage(&mut self) -> Result<f64, MonitorError> {
        Ok(self.board_voltage)
    }
}
