//! Phase coefficient search against a purely resistive reference load.
//!
//! The walk multiplies the coefficient up while the measured power factor is
//! below 1.0 and down otherwise, with coarse steps until the power factor is
//! within `FINE_BAND` of 1.0. Two consecutive drops in power factor shrink every
//! step and trigger a reversed probe whose result is never committed.

use std::collections::VecDeque;

use super::error::MonitorError;
use super::power::{calculate_power, ScaleFactors};
use super::source::SampleSource;
use super::types::ChannelId;
use super::waveform::reconstruct_voltage;

pub const CALIBRATION_ROUNDS: usize = 3;
pub const ROUND_ITERATIONS: usize = 75;

pub const FINE_STEPS: StepPair = StepPair {
    increment: 1.005,
    decrement: 0.995,
};
pub const COARSE_STEPS: StepPair = StepPair {
    increment: 1.01,
    decrement: 0.98,
};
/* Coarse steps are used while |1 - pf| is above this band. */
pub const FINE_BAND: f64 = 0.005;

const TREND_WINDOW: usize = 2;
const UNITY_DECIMALS: f64 = 10_000.0;

/// Measures the power factor of the channel under calibration for a given
/// phase coefficient, from a fresh acquisition each time.
pub trait PhaseProbe {
    fn measure(&mut self, coefficient: f64) -> Result<f64, MonitorError>;
}

impl<F> PhaseProbe for F
where
    F: FnMut(f64) -> Result<f64, MonitorError>,
{
    fn measure(&mut self, coefficient: f64) -> Result<f64, MonitorError> {
        self(coefficient)
    }
}

/// Decisions the operator takes at the blocking checkpoints of a run.
pub trait Operator {
    /// Is a purely resistive load running through the channel's sensor?
    fn confirm_resistive_load(&mut self, channel: ChannelId) -> Result<bool, MonitorError>;

    /// The sensor reads a negative power factor. Returns true once the sensor
    /// has been physically reversed, false to abort.
    fn confirm_sensor_reversed(&mut self, channel: ChannelId, power_factor: f64) -> Result<bool, MonitorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Increment,
    Decrement,
}

impl Action {
    pub fn opposite(self) -> Self {
        match self {
            Action::Increment => Action::Decrement,
            Action::Decrement => Action::Increment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPair {
    pub increment: f64,
    pub decrement: f64,
}

impl StepPair {
    pub fn factor(&self, action: Action) -> f64 {
        match action {
            Action::Increment => self.increment,
            Action::Decrement => self.decrement,
        }
    }

    /// Halves the distance of both steps to 1.0.
    pub fn halved(self) -> Self {
        StepPair {
            increment: 1.0 + (self.increment - 1.0) / 2.0,
            decrement: self.decrement + (1.0 - self.decrement) / 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub coefficient: f64,
    pub power_factor: f64,
}

/// A proposed coefficient and the action that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub action: Action,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// The step became the new previous state.
    Committed,
    /// Two drops in a row: steps were shrunk and this reversed probe should be measured.
    Worsening { probe: Step },
}

/// Search state of one calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationState {
    pub previous_coefficient: f64,
    pub previous_power_factor: f64,
    pub fine: StepPair,
    pub coarse: StepPair,
    pub best: Option<Measurement>,
    trend_window: VecDeque<f64>,
}

impl CalibrationState {
    pub fn new(baseline: Measurement) -> Self {
        CalibrationState {
            previous_coefficient: baseline.coefficient,
            previous_power_factor: baseline.power_factor,
            fine: FINE_STEPS,
            coarse: COARSE_STEPS,
            best: None,
            trend_window: VecDeque::with_capacity(TREND_WINDOW),
        }
    }

    /// Starts a new round from `baseline` with the initial step sizes.
    pub fn begin_round(&mut self, baseline: Measurement) {
        *self = CalibrationState::new(baseline);
    }

    pub fn trend(&self) -> impl Iterator<Item = f64> + '_ {
        self.trend_window.iter().copied()
    }

    pub fn steps_for(&self, power_factor: f64) -> StepPair {
        if (1.0 - power_factor).abs() > FINE_BAND {
            self.coarse
        } else {
            self.fine
        }
    }

    pub fn next_step(&self) -> Step {
        let action = if self.previous_power_factor < 1.0 {
            Action::Increment
        } else {
            Action::Decrement
        };
        let factor = self.steps_for(self.previous_power_factor).factor(action);

        Step {
            action,
            coefficient: self.previous_coefficient * factor,
        }
    }

    /// Keeps the highest power factor seen in the round.
    pub fn record(&mut self, measurement: Measurement) {
        let improves = self
            .best
            .map_or(true, |best| measurement.power_factor > best.power_factor);
        if improves {
            self.best = Some(measurement);
        }
    }

    /*
    * @brief Feed the result of a regular step into the state.
    * @param step The step that was measured.
    * @param power_factor Measured power factor.
    * @return Committed, or Worsening with the corrective probe to measure next.
    */
    pub fn observe(&mut self, step: Step, power_factor: f64) -> Transition {
        self.record(Measurement {
            coefficient: step.coefficient,
            power_factor,
        });

        if self.trend_window.len() == TREND_WINDOW {
            self.trend_window.pop_front();
        }
        self.trend_window.push_back(power_factor - self.previous_power_factor);

        self.previous_coefficient = step.coefficient;
        self.previous_power_factor = power_factor;

        let worsening = self.trend_window.len() == TREND_WINDOW && self.trend_window.iter().all(|&d| d < 0.0);
        if !worsening {
            return Transition::Committed;
        }

        self.trend_window.clear();
        self.fine = self.fine.halved();
        self.coarse = self.coarse.halved();

        let action = step.action.opposite();
        let factor = self.steps_for(self.previous_power_factor).factor(action);
        Transition::Worsening {
            probe: Step {
                action,
                coefficient: self.previous_coefficient * factor,
            },
        }
    }

    /// Probe results only compete for best; the previous state is left alone.
    pub fn observe_probe(&mut self, probe: Step, power_factor: f64) {
        self.record(Measurement {
            coefficient: probe.coefficient,
            power_factor,
        });
    }
}

/* Measure, naming the channel and the step of the run when the measurement fails. */
fn measure_at<P, F>(probe: &mut P, channel: ChannelId, coefficient: f64, check: F) -> Result<f64, MonitorError>
where
    P: PhaseProbe + ?Sized,
    F: FnOnce() -> String,
{
    probe
        .measure(coefficient)
        .map_err(|source| MonitorError::CalibrationFailed {
            channel,
            check: check(),
            source: Box::new(source),
        })
}

/// True when the power factor rounds to exactly 1.0 at four decimals.
pub fn rounds_to_unity(power_factor: f64) -> bool {
    (power_factor * UNITY_DECIMALS).round() == UNITY_DECIMALS
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundResult {
    pub best: Measurement,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub channel: ChannelId,
    pub initial_power_factor: f64,
    pub rounds: Vec<RoundResult>,
    pub recommended_coefficient: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseCalibrator {
    pub rounds: usize,
    pub iterations: usize,
}

impl Default for PhaseCalibrator {
    fn default() -> Self {
        PhaseCalibrator {
            rounds: CALIBRATION_ROUNDS,
            iterations: ROUND_ITERATIONS,
        }
    }
}

impl PhaseCalibrator {
    /*
    * @brief Search the phase coefficient of a channel.
    * @param channel Channel under calibration.
    * @param probe Live (or synthetic) power factor measurement.
    * @param operator Decisions at the resistive load and orientation checkpoints.
    * @return Report holding the recommended coefficient; nothing is persisted here.
    */
    pub fn run<P, O>(&self, channel: ChannelId, probe: &mut P, operator: &mut O) -> Result<CalibrationReport, MonitorError>
    where
        P: PhaseProbe + ?Sized,
        O: Operator + ?Sized,
    {
        if !operator.confirm_resistive_load(channel)? {
            return Err(MonitorError::CalibrationAborted {
                channel,
                check: "resistive load",
            });
        }

        let initial_power_factor = self.check_orientation(channel, probe, operator)?;
        log::debug!(
            "Searching the phase coefficient of {} (initial PF {:.4}), this can take a few minutes",
            channel,
            initial_power_factor
        );

        let mut state = CalibrationState::new(Measurement {
            coefficient: 1.0,
            power_factor: initial_power_factor,
        });
        let mut rounds = Vec::with_capacity(self.rounds);

        for round in 1..=self.rounds {
            let result = self.run_round(channel, round, probe, &mut state)?;
            log::debug!(
                "Round {}/{} of {}: best PF {:.6} using coefficient {:.8} after {} iterations{}",
                round,
                self.rounds,
                channel,
                result.best.power_factor,
                result.best.coefficient,
                result.iterations,
                if result.converged { " (converged)" } else { "" }
            );
            rounds.push(result);
        }

        let recommended_coefficient =
            rounds.iter().map(|r| r.best.coefficient).sum::<f64>() / rounds.len().max(1) as f64;

        Ok(CalibrationReport {
            channel,
            initial_power_factor,
            rounds,
            recommended_coefficient,
        })
    }

    fn check_orientation<P, O>(&self, channel: ChannelId, probe: &mut P, operator: &mut O) -> Result<f64, MonitorError>
    where
        P: PhaseProbe + ?Sized,
        O: Operator + ?Sized,
    {
        let power_factor = measure_at(probe, channel, 1.0, || "orientation".to_string())?;
        if power_factor >= 0.0 {
            return Ok(power_factor);
        }

        log::warn!("{} reads a negative power factor ({:.4}), the sensor is installed backwards", channel, power_factor);
        if !operator.confirm_sensor_reversed(channel, power_factor)? {
            return Err(MonitorError::CalibrationAborted {
                channel,
                check: "sensor orientation",
            });
        }

        let power_factor = measure_at(probe, channel, 1.0, || "orientation re-check".to_string())?;
        if power_factor < 0.0 {
            return Err(MonitorError::SensorReversed {
                channel,
                check: "orientation re-check",
                power_factor,
            });
        }

        Ok(power_factor)
    }

    fn run_round<P>(
        &self,
        channel: ChannelId,
        round: usize,
        probe: &mut P,
        state: &mut CalibrationState,
    ) -> Result<RoundResult, MonitorError>
    where
        P: PhaseProbe + ?Sized,
    {
        let baseline = Measurement {
            coefficient: 1.0,
            power_factor: measure_at(probe, channel, 1.0, || format!("round {} baseline", round))?,
        };
        state.begin_round(baseline);

        let mut latest = baseline;
        let mut iterations = 0;
        let mut converged = false;

        loop {
            if rounds_to_unity(latest.power_factor) {
                state.best = Some(latest);
                converged = true;
                break;
            }
            if iterations == self.iterations {
                break;
            }

            let step = state.next_step();
            let power_factor = measure_at(probe, channel, step.coefficient, || {
                format!("round {} step {}", round, iterations + 1)
            })?;
            iterations += 1;
            latest = Measurement {
                coefficient: step.coefficient,
                power_factor,
            };
            log::trace!("  PF {:.6} | coefficient {:.8}", power_factor, step.coefficient);

            if let Transition::Worsening { probe: corrective } = state.observe(step, power_factor) {
                log::trace!("  trend worsening, probing {:.8}", corrective.coefficient);
                if iterations == self.iterations {
                    break;
                }
                let power_factor = measure_at(probe, channel, corrective.coefficient, || {
                    format!("round {} corrective step", round)
                })?;
                iterations += 1;
                state.observe_probe(corrective, power_factor);
                latest = Measurement {
                    coefficient: corrective.coefficient,
                    power_factor,
                };
            }
        }

        Ok(RoundResult {
            best: state.best.unwrap_or(baseline),
            iterations,
            converged,
        })
    }
}

/// Power factor probe over a live sample source for one channel.
pub struct LiveProbe<'a, S: SampleSource + ?Sized> {
    source: &'a mut S,
    channel: ChannelId,
    scales: ScaleFactors,
    num_samples: usize,
    adc_resolution: u32,
}

impl<'a, S: SampleSource + ?Sized> LiveProbe<'a, S> {
    pub fn new(
        source: &'a mut S,
        channel: ChannelId,
        scales: ScaleFactors,
        num_samples: usize,
        adc_resolution: u32,
    ) -> Self {
        LiveProbe {
            source,
            channel,
            scales,
            num_samples,
            adc_resolution,
        }
    }
}

impl<'a, S: SampleSource + ?Sized> PhaseProbe for LiveProbe<'a, S> {
    fn measure(&mut self, coefficient: f64) -> Result<f64, MonitorError> {
        let batch = self.source.acquire(self.num_samples)?;
        batch.check_complete(self.num_samples)?;
        batch.validate(self.adc_resolution)?;

        let current = batch.current(self.channel)?;
        let voltage = reconstruct_voltage(&batch.voltage, coefficient);
        let reading = calculate_power(current, &voltage, self.scales)?;

        Ok(reading.power_factor)
    }
}
