use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use chrono::Utc;

use ct_power_monitor::calibration::{LiveProbe, Operator, PhaseCalibrator, PhaseProbe};
use ct_power_monitor::config::ChannelConfig;
use ct_power_monitor::{
    ChannelId, LineProtocolSink, MonitorConfig, MonitorError, PowerMonitor, ReplaySource, SampleBatch, SampleSource,
    SimulatedLoad, SimulatedSource,
};

const SAMPLES_PER_CYCLE: f64 = 20.0;

fn ct(n: u8) -> ChannelId {
    ChannelId::new(n).unwrap()
}

fn config_for(channels: &[(u8, f64)]) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.channels = channels
        .iter()
        .map(|&(n, phase_correction)| {
            (
                ct(n),
                ChannelConfig {
                    adc_channel: n - 1,
                    phase_correction,
                    accuracy: 1.0,
                },
            )
        })
        .collect();
    config
}

fn source_with(loads: Vec<(u8, SimulatedLoad)>) -> SimulatedSource {
    let loads: BTreeMap<ChannelId, SimulatedLoad> = loads.into_iter().map(|(n, l)| (ct(n), l)).collect();
    SimulatedSource::new(loads).with_samples_per_cycle(SAMPLES_PER_CYCLE)
}

#[test]
fn matched_coefficient_brings_resistive_load_to_unity() {
    // A quarter-sample read delay is compensated by c = 1 / (1 - 0.25).
    let config = config_for(&[(1, 1.0 / 0.75), (2, 1.0)]);
    let monitor = PowerMonitor::new(config);
    let mut source = source_with(vec![
        (1, SimulatedLoad::resistive(200.0, 0.25)),
        (2, SimulatedLoad::resistive(200.0, 0.25)),
    ]);

    let batch = source.acquire(2000).unwrap();
    let readings = monitor.process_batch(&batch, 3.3).unwrap();

    let corrected = readings.channels[&ct(1)].power_factor;
    let uncorrected = readings.channels[&ct(2)].power_factor;
    assert!(corrected > 0.9995, "corrected PF {}", corrected);
    assert!(corrected > uncorrected);
    assert!(readings.channels[&ct(1)].real_power > 0.0);
}

#[test]
fn reversed_sensor_reports_negative_power() {
    let monitor = PowerMonitor::new(config_for(&[(3, 1.0)]));
    let mut load = SimulatedLoad::resistive(150.0, 0.0);
    load.reversed = true;
    let mut source = source_with(vec![(3, load)]);

    let batch = source.acquire(2000).unwrap();
    let reading = monitor.process_batch(&batch, 3.3).unwrap().channels[&ct(3)];

    assert!(reading.real_power < 0.0);
    assert!(reading.power_factor < -0.99);
    assert!(reading.signed_current() < 0.0);
}

#[test]
fn replayed_session_drops_bad_batch_and_averages_the_rest() {
    let mut config = config_for(&[(1, 1.0)]);
    config.num_samples = 400;
    config.averaging_window = 2;
    let monitor = PowerMonitor::new(config);

    let mut simulated = source_with(vec![(1, SimulatedLoad::resistive(180.0, 0.0))]);
    let mut batches: Vec<SampleBatch> = (0..5).map(|_| simulated.acquire(400).unwrap()).collect();
    batches[2].currents.get_mut(&ct(1)).unwrap().pop();

    let mut source = ReplaySource::new(batches, 3.3);
    let mut sink = LineProtocolSink::new(Vec::new(), 1);
    let stop = AtomicBool::new(false);

    let written = monitor.run(&mut source, &mut sink, &stop, false).unwrap();

    assert_eq!(written, 2);
    let text = String::from_utf8(sink.into_inner()).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("home_load ")).count(), 2);
    assert_eq!(text.lines().filter(|l| l.starts_with("raw_cts,ct=ct1 ")).count(), 2);
    assert_eq!(text.lines().filter(|l| l.starts_with("voltages ")).count(), 2);
}

#[test]
fn empty_batch_is_skipped_by_the_loop() {
    let monitor = PowerMonitor::new(config_for(&[(1, 1.0)]));
    let empty = SampleBatch {
        captured_at: Utc::now(),
        voltage: Vec::new(),
        currents: BTreeMap::new(),
    };
    let mut source = ReplaySource::new(vec![empty], 3.3);
    let mut sink = LineProtocolSink::new(Vec::new(), 1);

    let written = monitor.run(&mut source, &mut sink, &AtomicBool::new(false), false).unwrap();
    assert_eq!(written, 0);
    assert!(sink.into_inner().is_empty());
}

struct Agreeing {
    reversal_prompts: usize,
}

impl Operator for Agreeing {
    fn confirm_resistive_load(&mut self, _channel: ChannelId) -> Result<bool, MonitorError> {
        Ok(true)
    }

    fn confirm_sensor_reversed(&mut self, _channel: ChannelId, _power_factor: f64) -> Result<bool, MonitorError> {
        self.reversal_prompts += 1;
        Ok(true)
    }
}

#[test]
fn calibration_on_live_source_finds_the_read_delay() {
    let config = config_for(&[(2, 1.0)]);
    // Ten samples per cycle keep the unity band of the search narrow around 1 / (1 - 0.25).
    let loads = [(ct(2), SimulatedLoad::resistive(200.0, 0.25))].into_iter().collect();
    let mut source = SimulatedSource::new(loads).with_samples_per_cycle(10.0);
    let scales = config.scale_factors(ct(2), 3.3).unwrap();
    let mut operator = Agreeing { reversal_prompts: 0 };

    let mut probe = LiveProbe::new(&mut source, ct(2), scales, 2000, config.adc_resolution);
    let report = PhaseCalibrator::default().run(ct(2), &mut probe, &mut operator).unwrap();

    assert_eq!(operator.reversal_prompts, 0);
    assert_eq!(report.rounds.len(), 3);
    assert!(report.rounds.iter().all(|r| r.converged));
    assert!(
        (report.recommended_coefficient - 4.0 / 3.0).abs() < 0.02,
        "recommended {}",
        report.recommended_coefficient
    );

    let at_unity = probe.measure(1.0).unwrap();
    let at_recommended = probe.measure(report.recommended_coefficient).unwrap();
    assert!(at_recommended > at_unity);
}

#[test]
fn sensor_left_reversed_stops_calibration_before_stepping() {
    let config = config_for(&[(1, 1.0)]);
    let mut load = SimulatedLoad::resistive(200.0, 0.1);
    load.reversed = true;
    let mut source = source_with(vec![(1, load)]);
    let scales = config.scale_factors(ct(1), 3.3).unwrap();
    let mut operator = Agreeing { reversal_prompts: 0 };

    let mut probe = LiveProbe::new(&mut source, ct(1), scales, 2000, config.adc_resolution);
    let err = PhaseCalibrator::default().run(ct(1), &mut probe, &mut operator).unwrap_err();

    assert!(matches!(
        err,
        MonitorError::SensorReversed {
            check: "orientation re-check",
            ..
        }
    ));
    assert_eq!(operator.reversal_prompts, 1);
}

#[test]
fn probe_rejects_source_missing_the_channel() {
    let config = config_for(&[(4, 1.0)]);
    let mut source = source_with(vec![(1, SimulatedLoad::resistive(200.0, 0.0))]);
    let scales = config.scale_factors(ct(4), 3.3).unwrap();

    let mut probe = LiveProbe::new(&mut source, ct(4), scales, 100, config.adc_resolution);
    assert!(matches!(probe.measure(1.0), Err(MonitorError::MissingChannel(_))));
}
