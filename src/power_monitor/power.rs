use super::error::MonitorError;
use super::types::PowerReading;

/* Current transformer scale per volt seen at the ADC pin. */
pub const CURRENT_SCALE_FACTOR: f64 = 100.0;
/* Burden resistor and divider ratio approximation of the AC voltage input. */
pub const AC_VOLTAGE_RATIO_FACTOR: f64 = 11.0;

/// Measured mains reference used to scale the voltage input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcReference {
    pub grid_voltage: f64,               // Multimeter reading at the outlet
    pub transformer_output_voltage: f64, // Multimeter reading at the AC transformer output
    pub accuracy: f64,                   // Shared AC accuracy coefficient
}

/// Code-to-unit scale factors for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub current: f64,
    pub voltage: f64,
}

impl ScaleFactors {
    /*
    * @brief Derive the scale factors of a channel.
    * @param board_voltage Measured reference voltage of the converter in volts.
    * @param adc_resolution Number of converter codes.
    * @param current_accuracy Accuracy coefficient of the channel.
    * @param ac Mains reference and shared AC accuracy coefficient.
    */
    pub fn new(board_voltage: f64, adc_resolution: u32, current_accuracy: f64, ac: AcReference) -> Self {
        let vref = board_voltage / f64::from(adc_resolution);
        let ac_voltage_ratio = (ac.grid_voltage / ac.transformer_output_voltage) * AC_VOLTAGE_RATIO_FACTOR;

        ScaleFactors {
            current: vref * CURRENT_SCALE_FACTOR * current_accuracy,
            voltage: vref * ac_voltage_ratio * ac.accuracy,
        }
    }
}

/// Raw first and second moments of a current/voltage pair, in codes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleMoments {
    pub samples: usize,
    pub mean_current: f64,
    pub mean_voltage: f64,
    pub mean_power: f64,
    pub mean_square_current: f64,
    pub mean_square_voltage: f64,
}

impl SampleMoments {
    /*
    * @brief Accumulate every sum in a single pass.
    * @param current Current codes of the channel.
    * @param voltage Corrected voltage wave of the channel.
    * @return Moments, or an error when the sequences are empty or differ in length.
    */
    pub fn accumulate<T: Copy + Into<f64>>(current: &[T], voltage: &[f64]) -> Result<Self, MonitorError> {
        if current.is_empty() || voltage.is_empty() {
            return Err(MonitorError::EmptySamples);
        }
        if current.len() != voltage.len() {
            return Err(MonitorError::LengthMismatch {
                signal: "reconstructed voltage".to_string(),
                expected: current.len(),
                actual: voltage.len(),
            });
        }

        let mut sum_current = 0.0;
        let mut sum_voltage = 0.0;
        let mut sum_power = 0.0;
        let mut sum_square_current = 0.0;
        let mut sum_square_voltage = 0.0;

        for (&i, &v) in current.iter().zip(voltage) {
            let i: f64 = i.into();
            sum_current += i;
            sum_voltage += v;
            sum_power += i * v;
            sum_square_current += i * i;
            sum_square_voltage += v * v;
        }

        let n = current.len() as f64;
        Ok(SampleMoments {
            samples: current.len(),
            mean_current: sum_current / n,
            mean_voltage: sum_voltage / n,
            mean_power: sum_power / n,
            mean_square_current: sum_square_current / n,
            mean_square_voltage: sum_square_voltage / n,
        })
    }

    /// Mean instantaneous power with the DC bias of both inputs removed.
    pub fn power_term(&self) -> f64 {
        self.mean_power - self.mean_current * self.mean_voltage
    }

    // Rounding can leave a flat signal a hair below zero.
    pub fn current_variance(&self) -> f64 {
        (self.mean_square_current - self.mean_current * self.mean_current).max(0.0)
    }

    pub fn voltage_variance(&self) -> f64 {
        (self.mean_square_voltage - self.mean_voltage * self.mean_voltage).max(0.0)
    }
}

pub fn calculate_power_factor(real_power: f64, apparent_power: f64) -> f64 {
    if apparent_power == 0.0 {
        return 0.0;
    }
    real_power / apparent_power
}

/*
* @brief Compute real power, RMS current, RMS voltage and power factor of one channel.
* @param current Current codes of the channel.
* @param voltage Corrected voltage wave matched to the channel.
* @param scales Scale factors of the channel.
* @return Power reading; the sign of real power is kept.
*/
pub fn calculate_power<T: Copy + Into<f64>>(
    current: &[T],
    voltage: &[f64],
    scales: ScaleFactors,
) -> Result<PowerReading, MonitorError> {
    let moments = SampleMoments::accumulate(current, voltage)?;

    let real_power = moments.power_term() * scales.current * scales.voltage;
    let rms_current = moments.current_variance().sqrt() * scales.current;
    let rms_voltage = moments.voltage_variance().sqrt() * scales.voltage;
    let power_factor = calculate_power_factor(real_power, rms_voltage * rms_current);

    Ok(PowerReading {
        real_power,
        rms_current,
        rms_voltage,
        power_factor,
    })
}
