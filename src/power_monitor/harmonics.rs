use std::f64::consts::PI;

use num_complex::Complex;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};

/* Odd orders 1, 3, 5 ... 41 */
pub const HARMONIC_COUNT: usize = 21;

/// Spectral view of one captured wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSummary {
    pub fundamental_hz: f64,
    /// Peak amplitude of the fundamental, in input units.
    pub fundamental_amplitude: f64,
    /// Odd harmonics as a percentage of the fundamental.
    pub harmonics: Vec<f64>,
    pub thd_percent: f64,
}

/*
* @brief Locate the fundamental of a wave and measure its odd harmonics.
* @param samples Raw wave (codes or scaled values).
* @param sample_rate Sampling frequency in Hz.
* @return None when the wave is too short or carries no AC component.
*/
pub fn analyze<T: Copy + Into<f64>>(samples: &[T], sample_rate: f64) -> Option<SpectrumSummary> {
    if samples.len() < 4 {
        return None;
    }

    let mut signal: Vec<f64> = samples.iter().map(|&s| s.into()).collect();
    remove_mean(&mut signal);
    let coherent_gain = apply_window(&mut signal);

    let spectrum = compute_fft(&mut signal)?;
    let magnitudes: Vec<f64> = spectrum.iter().map(|bin| bin.norm()).collect();

    let (fundamental_bin, fundamental_mag) = magnitudes
        .iter()
        .copied()
        .enumerate()
        .skip(1)
        .fold((0, 0.0), |best, (bin, mag)| if mag > best.1 { (bin, mag) } else { best });

    if fundamental_bin == 0 || fundamental_mag < f64::EPSILON {
        return None;
    }

    let bin_freq = sample_rate / samples.len() as f64;
    let (harmonics, thd_percent) = calculate_harmonics_and_thd(&magnitudes, fundamental_mag, fundamental_bin);

    Some(SpectrumSummary {
        fundamental_hz: fundamental_bin as f64 * bin_freq,
        fundamental_amplitude: 2.0 * fundamental_mag / coherent_gain,
        harmonics,
        thd_percent,
    })
}

fn calculate_harmonics_and_thd(magnitudes: &[f64], fundamental_mag: f64, fundamental_bin: usize) -> (Vec<f64>, f64) {
    let mut harmonics = Vec::with_capacity(HARMONIC_COUNT);
    let mut harmonic_power_sum = 0.0;

    for i in 0..HARMONIC_COUNT {
        let order = 2 * i + 1;
        let Some(&mag) = magnitudes.get(order * fundamental_bin) else {
            break;
        };
        harmonics.push(mag / fundamental_mag * 100.0);
        if i > 0 {
            harmonic_power_sum += mag * mag;
        }
    }

    (harmonics, harmonic_power_sum.sqrt() / fundamental_mag * 100.0)
}

// Hann window, returns the window sum
fn apply_window(signal: &mut [f64]) -> f64 {
    let n = signal.len() as f64;
    let mut sum = 0.0;
    for (i, sample) in signal.iter_mut().enumerate() {
        let window = 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1.0)).cos());
        *sample *= window;
        sum += window;
    }
    sum
}

fn remove_mean(signal: &mut [f64]) {
    let mean = signal.iter().sum::<f64>() / signal.len() as f64;
    for sample in signal.iter_mut() {
        *sample -= mean;
    }
}

fn compute_fft(signal: &mut [f64]) -> Option<Vec<Complex<f64>>> {
    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(signal.len());
    let mut spectrum = r2c.make_output_vec();
    let mut scratch = r2c.make_scratch_vec();

    r2c.process_with_scratch(signal, &mut spectrum, &mut scratch).ok()?;
    Some(spectrum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wave(n: usize, fs: f64, parts: &[(f64, f64)]) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                512.0 + parts.iter().map(|&(f, a)| a * (2.0 * PI * f * t).sin()).sum::<f64>()
            })
            .collect()
    }

    #[test]
    fn finds_mains_fundamental() {
        let samples = wave(2000, 1000.0, &[(50.0, 300.0)]);
        let summary = analyze(&samples, 1000.0).unwrap();
        assert!((summary.fundamental_hz - 50.0).abs() < 0.5);
        assert!((summary.fundamental_amplitude - 300.0).abs() < 3.0);
        assert!(summary.thd_percent < 1.0);
        assert!((summary.harmonics[0] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn third_harmonic_shows_in_thd() {
        let samples = wave(2000, 1000.0, &[(50.0, 300.0), (150.0, 30.0)]);
        let summary = analyze(&samples, 1000.0).unwrap();
        assert!((summary.harmonics[1] - 10.0).abs() < 0.5);
        assert!((summary.thd_percent - 10.0).abs() < 0.5);
    }

    #[test]
    fn flat_or_short_input_has_no_spectrum() {
        assert!(analyze(&[512u16; 256], 1000.0).is_none());
        assert!(analyze(&[1u16, 2], 1000.0).is_none());
    }
}
