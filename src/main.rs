use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use signal_hook::consts::signal::{SIGINT, SIGTERM};

use ct_power_monitor::harmonics::analyze;
use ct_power_monitor::record::{write_record, VisualizerRecord, DEFAULT_RECORD_DIR};
use ct_power_monitor::{
    ChannelId, LineProtocolSink, LogSink, MonitorConfig, MonitorError, PowerMonitor, SampleSource, SimulatedLoad,
    SimulatedSource, TelemetrySink,
};

mod calibrate;

/* Pace of the simulated converter, interleaved samples per second and per signal. */
const SIMULATED_SAMPLE_RATE: f64 = 1000.0;

#[derive(Parser, Debug)]
#[command(author, version, about = "Current transformer power monitor for an MCP3008 board")]
struct Args {
    /// Use simulated waveforms instead of the SPI converter
    #[arg(short = 's', long, global = true)]
    simulate: bool,

    /// Configuration file (defaults to $POWER_MONITOR_CONFIG, then ./power_monitor.toml)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug, Clone)]
enum Mode {
    /// Measure continuously and write telemetry (default)
    Run,
    /// Like run, also printing every batch's readings
    Terminal,
    /// Interactive phase calibration over a purely resistive load
    Phase {
        /// Channel to calibrate (ct1..ct6 or 1..6); prompted for when missing
        #[arg(long)]
        channel: Option<ChannelId>,
        /// Write the recommended coefficient to the configuration file
        #[arg(long)]
        save: bool,
    },
    /// Capture one batch, report the sample rate and spectra, and save it
    Debug {
        /// Record title; prompted for when missing
        title: Option<String>,
    },
}

fn init_logger(mode: &Mode) {
    let level = match mode {
        Mode::Run => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Simulated loads whose sampling delay matches each channel's configured coefficient.
fn simulated_source(config: &MonitorConfig, paced: bool) -> SimulatedSource {
    let loads: BTreeMap<ChannelId, SimulatedLoad> = config
        .channels
        .iter()
        .map(|(&channel, cfg)| {
            let c = cfg.phase_correction;
            let amplitude = 100.0 + 40.0 * f64::from(channel.number());
            (channel, SimulatedLoad::resistive(amplitude, (c - 1.0) / c))
        })
        .collect();

    let source = SimulatedSource::new(loads)
        .with_resolution(config.adc_resolution)
        .with_noise(2.0);
    if paced {
        source.paced(SIMULATED_SAMPLE_RATE)
    } else {
        source
    }
}

fn open_source(args: &Args, config: &MonitorConfig, paced: bool) -> Result<Box<dyn SampleSource>, MonitorError> {
    if args.simulate {
        log::info!("Using simulated waveforms");
        return Ok(Box::new(simulated_source(config, paced)));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(ct_power_monitor::spi::Mcp3008Source::open(config)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(MonitorError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "the SPI converter needs Linux spidev, use --simulate",
        )))
    }
}

fn run_monitor(config: MonitorConfig, source: &mut dyn SampleSource, report: bool) -> Result<(), MonitorError> {
    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    // Terminal mode only shows the readings, nothing is persisted.
    let mut sink: Box<dyn TelemetrySink> = if report {
        Box::new(LogSink)
    } else {
        Box::new(LineProtocolSink::append_to(
            &config.telemetry.path,
            config.telemetry.flush_every,
        )?)
    };

    log::info!("... Starting power monitor");
    log::info!("Press Ctrl-c to quit...");
    if !report {
        log::info!("Writing telemetry to {}", config.telemetry.path.display());
    }

    let monitor = PowerMonitor::new(config);
    let written = monitor.run(source, &mut sink, &stop, report)?;

    log::info!("Stopped after {} telemetry records", written);
    Ok(())
}

/*
* @brief Capture one batch, time it and save it for offline plotting.
* @param config Loaded configuration.
* @param source Sample source.
* @param title Record title, prompted for when missing.
*/
fn run_debug_mode(config: &MonitorConfig, source: &mut dyn SampleSource, title: Option<String>) -> Result<(), MonitorError> {
    let start = Instant::now();
    let batch = source.acquire(config.num_samples)?;
    let duration = start.elapsed().as_secs_f64();
    batch.validate(config.adc_resolution)?;

    let sample_count = batch.len() * (batch.currents.len() + 1);
    let sample_rate_ksps = sample_count as f64 / duration / 1000.0;
    log::debug!("Finished collecting samples. Sample rate: {:.2} kSPS", sample_rate_ksps);

    // Every signal is read once per interleaved sample.
    let per_signal_rate = batch.len() as f64 / duration;
    let mut spectra = BTreeMap::new();
    let signals = std::iter::once(("voltage".to_string(), &batch.voltage))
        .chain(batch.currents.iter().map(|(channel, codes)| (channel.to_string(), codes)));
    for (name, codes) in signals {
        match analyze(codes.as_slice(), per_signal_rate) {
            Some(summary) => {
                log::debug!(
                    "{}: fundamental {:.2} Hz, amplitude {:.1} codes, THD {:.2} %",
                    name,
                    summary.fundamental_hz,
                    summary.fundamental_amplitude,
                    summary.thd_percent
                );
                spectra.insert(name, summary);
            }
            None => log::debug!("{}: no AC component", name),
        }
    }

    let title = match title {
        Some(title) => title,
        None => prompt("Enter the title for this record: ")?,
    };

    let mut record = VisualizerRecord::new(&title, batch);
    record.sample_rate_ksps = Some(sample_rate_ksps);
    record.spectra = spectra;

    let path = write_record(Path::new(DEFAULT_RECORD_DIR), &record)?;
    log::info!("Record written to {}", path.display());
    Ok(())
}

fn prompt(question: &str) -> Result<String, MonitorError> {
    print!("{}", question);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn run(args: Args) -> Result<(), MonitorError> {
    let mode = args.mode.clone().unwrap_or(Mode::Run);
    init_logger(&mode);

    let (mut config, origin) = MonitorConfig::load(args.config.as_deref())?;
    let paced = !matches!(mode, Mode::Phase { .. });
    let mut source = open_source(&args, &config, paced)?;

    match mode {
        Mode::Run => run_monitor(config, source.as_mut(), false),
        Mode::Terminal => run_monitor(config, source.as_mut(), true),
        Mode::Phase { channel, save } => {
            calibrate::run_phase_mode(&mut config, origin.as_deref(), source.as_mut(), channel, save)
        }
        Mode::Debug { title } => run_debug_mode(&config, source.as_mut(), title),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
