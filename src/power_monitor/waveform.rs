use std::collections::BTreeMap;
use std::thread;

use super::types::ChannelId;

/*
* @brief Rebuild the voltage wave as seen at a channel's own sampling instant.
* @param voltage Raw voltage codes shared by every channel.
* @param coefficient Phase correction coefficient of the channel.
* @return Corrected wave, same length as voltage.
* @note V'[0] = V[0] and V'[i] = V'[i-1] + c * (V[i] - V'[i-1]); c = 1.0 returns the input.
* @note Each point depends on the previous output, so one wave is built strictly in order.
*/
pub fn reconstruct_voltage(voltage: &[u16], coefficient: f64) -> Vec<f64> {
    let mut wave = Vec::with_capacity(voltage.len());

    let mut previous = match voltage.first() {
        Some(&first) => f64::from(first),
        None => return wave,
    };
    wave.push(previous);

    for &raw in &voltage[1..] {
        previous += coefficient * (f64::from(raw) - previous);
        wave.push(previous);
    }

    wave
}

/*
* @brief Rebuild one corrected voltage wave per channel.
* @param voltage Raw voltage codes shared by every channel.
* @param coefficients Phase coefficient of each channel.
* @return Corrected wave keyed by channel.
* @note The source is only read, so every channel is rebuilt on its own scoped thread.
*/
pub fn reconstruct_channels(
    voltage: &[u16],
    coefficients: &BTreeMap<ChannelId, f64>,
) -> BTreeMap<ChannelId, Vec<f64>> {
    thread::scope(|scope| {
        let handles: Vec<_> = coefficients
            .iter()
            .map(|(&channel, &coefficient)| {
                (channel, scope.spawn(move || reconstruct_voltage(voltage, coefficient)))
            })
            .collect();

        handles
            .into_iter()
            .map(|(channel, handle)| match handle.join() {
                Ok(wave) => (channel, wave),
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine_codes(n: usize, samples_per_cycle: f64) -> Vec<u16> {
        (0..n)
            .map(|i| (512.0 + 300.0 * (2.0 * PI * i as f64 / samples_per_cycle).sin()).round() as u16)
            .collect()
    }

    #[test]
    fn unit_coefficient_is_identity() {
        for codes in [vec![0u16, 1023], vec![7, 7, 7], sine_codes(500, 37.0)] {
            let wave = reconstruct_voltage(&codes, 1.0);
            let expected: Vec<f64> = codes.iter().map(|&c| f64::from(c)).collect();
            assert_eq!(wave, expected);
        }
    }

    #[test]
    fn first_point_is_kept_and_recurrence_uses_previous_output() {
        let wave = reconstruct_voltage(&[100, 200, 200], 1.5);
        // 100, 100 + 1.5 * 100 = 250, 250 + 1.5 * (200 - 250) = 175
        assert_eq!(wave, vec![100.0, 250.0, 175.0]);
    }

    #[test]
    fn empty_input_gives_empty_wave() {
        assert!(reconstruct_voltage(&[], 1.2).is_empty());
    }

    #[test]
    fn flat_input_stays_flat_for_any_coefficient() {
        let wave = reconstruct_voltage(&[512; 64], 1.37);
        assert!(wave.iter().all(|&v| v == 512.0));
    }

    #[test]
    fn coefficient_above_one_advances_the_wave() {
        let samples_per_cycle = 40.0;
        let codes = sine_codes(4000, samples_per_cycle);
        let wave = reconstruct_voltage(&codes, 1.3);

        // Compare the phase of the fundamental after the start-up transient.
        let phase = |signal: &[f64]| {
            let (mut re, mut im) = (0.0, 0.0);
            for (i, &v) in signal.iter().enumerate().skip(400) {
                let angle = 2.0 * PI * i as f64 / samples_per_cycle;
                re += (v - 512.0) * angle.cos();
                im += (v - 512.0) * angle.sin();
            }
            re.atan2(im)
        };
        let raw: Vec<f64> = codes.iter().map(|&c| f64::from(c)).collect();
        assert!(phase(&wave) > phase(&raw));
    }

    #[test]
    fn channels_are_rebuilt_independently_from_shared_source() {
        let codes = sine_codes(200, 25.0);
        let coefficients: BTreeMap<ChannelId, f64> = [(1u8, 1.0), (2, 1.2), (5, 0.9)]
            .into_iter()
            .map(|(n, c)| (ChannelId::new(n).unwrap(), c))
            .collect();

        let waves = reconstruct_channels(&codes, &coefficients);

        assert_eq!(waves.len(), 3);
        for (channel, coefficient) in &coefficients {
            assert_eq!(waves[channel], reconstruct_voltage(&codes, *coefficient));
        }
    }
}
