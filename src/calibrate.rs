use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use ct_power_monitor::config::DEFAULT_CONFIG_FILE;
use ct_power_monitor::print::print_calibration;
use ct_power_monitor::record::{write_record, VisualizerRecord, DEFAULT_RECORD_DIR};
use ct_power_monitor::{
    reconstruct_voltage, ChannelId, LiveProbe, MonitorConfig, MonitorError, Operator, PhaseCalibrator, SampleSource,
};

/// Operator answering on the terminal.
pub struct ConsoleOperator<R: BufRead, W: Write> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        ConsoleOperator { input, output }
    }

    /// None on end of input.
    fn ask(&mut self, prompt: &str) -> io::Result<Option<String>> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;

        let mut line = String::new();
        match self.input.read_line(&mut line)? {
            0 => Ok(None),
            _ => Ok(Some(line.trim().to_lowercase())),
        }
    }

    /*
    * @brief Ask for a channel number until a valid one is given.
    * @return None when the input ends first.
    */
    pub fn select_channel(&mut self) -> Result<Option<ChannelId>, MonitorError> {
        loop {
            let answer = match self.ask("\nWhich CT number are you calibrating? Enter the number of the CT label [1 - 6]: ")? {
                Some(answer) => answer,
                None => return Ok(None),
            };
            match answer.parse::<ChannelId>() {
                Ok(channel) => return Ok(Some(channel)),
                Err(_) => log::error!("Please choose from CT numbers 1, 2, 3, 4, 5, or 6."),
            }
        }
    }
}

fn declines(answer: &str) -> bool {
    matches!(answer, "n" | "no")
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn confirm_resistive_load(&mut self, channel: ChannelId) -> Result<bool, MonitorError> {
        log::info!("#------------------------------------------------------------------------------#");
        log::info!("# IMPORTANT: Make sure that current transformer {} is installed over a purely #", channel);
        log::info!("#            resistive load and that the load is turned on before continuing! #");
        log::info!("#------------------------------------------------------------------------------#");
        Ok(self.ask("Continue? [y/yes/n/no]: ")?.map_or(false, |a| !declines(&a)))
    }

    fn confirm_sensor_reversed(&mut self, channel: ChannelId, power_factor: f64) -> Result<bool, MonitorError> {
        log::info!(
            "Current transformer {} is installed backwards (PF {:.4}). Unclip it and clip it on so that the \
             current flows the opposite direction from the sensor's perspective.",
            channel,
            power_factor
        );
        Ok(self
            .ask("Press ENTER when the sensor is reversed, or type 'n' to abort: ")?
            .map_or(false, |a| !declines(&a)))
    }
}

/*
* @brief Interactive phase calibration of one channel.
* @param config Loaded configuration; updated when the coefficient is saved.
* @param origin File the configuration came from.
* @param source Sample source.
* @param channel Channel given on the command line, prompted for otherwise.
* @param save Persist the recommended coefficient.
*/
pub fn run_phase_mode<S: SampleSource + ?Sized>(
    config: &mut MonitorConfig,
    origin: Option<&Path>,
    source: &mut S,
    channel: Option<ChannelId>,
    save: bool,
) -> Result<(), MonitorError> {
    let stdin = io::stdin();
    let mut operator = ConsoleOperator::new(stdin.lock(), io::stdout());

    let channel = match channel {
        Some(channel) => Some(channel),
        None => operator.select_channel()?,
    };
    let channel = match channel {
        Some(channel) => channel,
        None => {
            log::info!("Calibration aborted.");
            return Ok(());
        }
    };

    let board_voltage = source.board_voltage()?;
    let scales = config.scale_factors(channel, board_voltage)?;

    let report = {
        let mut probe = LiveProbe::new(&mut *source, channel, scales, config.num_samples, config.adc_resolution);
        PhaseCalibrator::default().run(channel, &mut probe, &mut operator)?
    };

    print_calibration(&report);
    let coefficient = report.recommended_coefficient;

    if save {
        let path = origin.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf);
        config.save_phase_coefficient(&path, channel, coefficient)?;
    } else {
        log::info!(
            "Please update phase_correction of [channels.{}] with the following value: {:.8}",
            channel,
            coefficient
        );
    }

    let batch = source.acquire(config.num_samples)?;
    let mut record = VisualizerRecord::new(&format!("{}-phase-correction-result", channel), batch);
    record.channel = Some(channel);
    record.phase_correction = Some(coefficient);
    record.rebuilt_voltage = Some(reconstruct_voltage(&record.batch.voltage, coefficient));

    let path = write_record(Path::new(DEFAULT_RECORD_DIR), &record)?;
    log::info!("Record written to {}", path.display());
    Ok(())
}
