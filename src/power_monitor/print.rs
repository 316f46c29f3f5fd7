use std::fmt::Write;

use super::calibration::CalibrationReport;
use super::types::BatchReadings;

const LABEL_WIDTH: usize = 9;
const COLUMN_WIDTH: usize = 11;

/*
* @brief Render the readings of one batch as a table, one column per channel.
* @param readings Readings of a processed batch.
* @return Multi-line table with Watts, Current and P.F. rows plus the voltage.
*/
pub fn format_table(readings: &BatchReadings) -> String {
    let mut table = String::new();

    let _ = write!(table, "{:<LABEL_WIDTH$}", "");
    for channel in readings.channels.keys() {
        let _ = write!(table, "|{:>COLUMN_WIDTH$}", channel.to_string());
    }
    table.push('\n');

    let rows: [(&str, fn(&super::types::PowerReading) -> f64); 3] = [
        ("Watts", |r| r.real_power),
        ("Current", |r| r.rms_current),
        ("P.F.", |r| r.power_factor),
    ];
    for (label, value) in rows {
        let _ = write!(table, "{:<LABEL_WIDTH$}", label);
        for reading in readings.channels.values() {
            let _ = write!(table, "|{:>COLUMN_WIDTH$.3}", value(reading));
        }
        table.push('\n');
    }

    let _ = write!(table, "{:<LABEL_WIDTH$}|{:>COLUMN_WIDTH$.3}", "Voltage", readings.rms_voltage);
    table
}

pub fn print_readings(readings: &BatchReadings) {
    log::info!("{}", readings.captured_at.format("%Y-%m-%d %H:%M:%S"));
    log::info!("\n{}", format_table(readings));
}

/*
* @brief Print the outcome of a phase calibration run.
* @param report Report returned by the calibrator.
*/
pub fn print_calibration(report: &CalibrationReport) {
    log::info!("Phase calibration of {}:", report.channel);
    log::info!("  Initial PF: {:.4}", report.initial_power_factor);
    for (i, round) in report.rounds.iter().enumerate() {
        log::info!(
            "  Round {}/{}: best PF {:.6} using {:.8}",
            i + 1,
            report.rounds.len(),
            round.best.power_factor,
            round.best.coefficient
        );
    }
    log::info!("  Recommended phase correction: {:.8}", report.recommended_coefficient);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_monitor::types::{ChannelId, PowerReading};
    use chrono::Utc;

    #[test]
    fn table_has_a_column_per_channel() {
        let reading = PowerReading {
            real_power: 1234.5678,
            rms_current: 5.25,
            rms_voltage: 241.0,
            power_factor: 0.9876,
        };
        let readings = BatchReadings {
            captured_at: Utc::now(),
            channels: [(ChannelId::new(1).unwrap(), reading), (ChannelId::new(4).unwrap(), reading)]
                .into_iter()
                .collect(),
            rms_voltage: 241.0,
        };

        let table = format_table(&readings);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("ct1") && lines[0].contains("ct4"));
        assert_eq!(lines[1].matches("1234.568").count(), 2);
        assert!(lines[3].starts_with("P.F."));
        assert!(lines[3].contains("0.988"));
        assert!(lines[4].contains("241.000"));
    }
}
