//! Command-line front end for the Abakus sensor.
//!
//! ```bash
//! abakus_daq live --port /dev/ttyUSB0 --flow-rate 2.5
//! abakus_daq analyze data/19-10-2026/abakus_14-03-12.txt
//! abakus_daq correct --instrumental --refractive-index 1.60
//! ```

use abakus_daq::acquisition::{ControlHandle, IntervalTicker, LiveAcquisition};
use abakus_daq::adapters::SerialAdapter;
use abakus_daq::analysis::{analyze, DistributionSummary};
use abakus_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use abakus_daq::correction::CorrectionPipeline;
use abakus_daq::data::MeasurementFileWriter;
use abakus_daq::log_capture::{MessageSink, Reporter};
use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); ABAKUS_* environment variables override it
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Acquire from the sensor until Ctrl-C
    Live {
        /// Serial port, overrides the configuration
        #[arg(long)]
        port: Option<String>,
        /// Flow rate in mL/min, overrides the configuration
        #[arg(long)]
        flow_rate: Option<f64>,
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// Analyze a saved measurement file
    Analyze {
        file: PathBuf,
        /// Header lines before the first data row
        #[arg(long)]
        skip_rows: Option<usize>,
        /// Also print the reconstructed per-tick counts
        #[arg(long)]
        time_series: bool,
    },
    /// Correct the configured size axis
    Correct {
        /// Apply the instrumental offset
        #[arg(long)]
        instrumental: bool,
        /// Real part of the particle refractive index; enables the LUT inversion
        #[arg(long)]
        refractive_index: Option<f64>,
        /// Imaginary part of the particle refractive index
        #[arg(long, default_value_t = 0.0)]
        imaginary: f64,
        /// Particle aspect ratio; enables the aspect-ratio stage
        #[arg(long)]
        aspect_ratio: Option<f64>,
    },
    /// Print the effective configuration
    PrintConfig,
}

/// Prints reporter messages on the terminal.
struct ConsoleSink {
    stderr: bool,
}

impl MessageSink for ConsoleSink {
    fn append(&self, text: &str) {
        if self.stderr {
            eprintln!("{}", text);
        } else {
            println!("{}", text);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading configuration from '{}'", args.config.display()))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.application.log_level.as_str()),
    )
    .init();

    match args.command {
        Mode::Live {
            port,
            flow_rate,
            ticks,
        } => {
            if let Some(port) = port {
                settings.serial.port = port;
            }
            if let Some(flow) = flow_rate {
                settings.acquisition.flow_rate_ml_min = flow;
            }
            settings.validate().context("invalid live options")?;
            live(settings, ticks).await
        }
        Mode::Analyze {
            file,
            skip_rows,
            time_series,
        } => {
            let skip = skip_rows.unwrap_or(settings.analysis.skip_rows);
            let analysis = analyze(&file, skip, &settings.size_axis.axis())
                .with_context(|| format!("analyzing '{}'", file.display()))?;
            println!("FILE: '{}'", file.display());
            for line in &analysis.noise_lines {
                println!("{}", line);
            }
            println!();
            print!("{}", DistributionSummary::from_analysis(&analysis));
            if !analysis.dropped_channels.is_empty() {
                println!("Empty channels: {:?}", analysis.dropped_channels);
            }
            if time_series {
                for (i, value) in analysis.time_series().iter().enumerate() {
                    println!("{}\t{}", i, value);
                }
            }
            Ok(())
        }
        Mode::Correct {
            instrumental,
            refractive_index,
            imaginary,
            aspect_ratio,
        } => {
            let c = &mut settings.correction;
            c.instrumental |= instrumental;
            if let Some(re) = refractive_index {
                c.refractive_index = true;
                c.index_real = re;
                c.index_imaginary = imaginary;
            }
            if let Some(ratio) = aspect_ratio {
                c.aspect_ratio = true;
                c.aspect_ratio_value = ratio;
            }
            settings.validate().context("invalid correction options")?;

            let axis = settings.size_axis.axis();
            let report = CorrectionPipeline::from_settings(&settings)
                .run(&axis)
                .context("size correction failed")?;
            println!("Channel\tInput [µm]\tCorrected [µm]");
            for (k, (input, corrected)) in axis.iter().zip(report.corrected().iter()).enumerate() {
                println!("{}\t{:.3}\t\t{:.3}", k, input, corrected);
            }
            for notice in &report.notices {
                eprintln!("{}", notice);
            }
            Ok(())
        }
        Mode::PrintConfig => {
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
    }
}

async fn live(settings: Settings, ticks: Option<u64>) -> Result<()> {
    let reporter = Reporter::new(
        Arc::new(ConsoleSink { stderr: false }),
        Arc::new(ConsoleSink { stderr: true }),
    );
    let writer = MeasurementFileWriter::in_output_dir(&settings.storage, &Local::now())
        .context("creating the measurement file")?;
    println!("Saving data in '{}'", writer.path().display());

    let serial = settings.serial.clone();
    let factory = move || SerialAdapter::open(&serial);
    let period = settings.acquisition.repetition_period();

    let (handle, control) = ControlHandle::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received, stopping");
            let _ = handle.stop().await;
        }
    });

    let mut acquisition = LiveAcquisition::new(settings, factory, writer, reporter);
    if let Some(ticks) = ticks {
        acquisition = acquisition.with_max_ticks(ticks);
    }
    let summary = acquisition
        .run(IntervalTicker::new(period), control)
        .await
        .context("live acquisition failed")?;

    println!(
        "{} ticks, {} particles, {} ticks with alarms",
        summary.ticks, summary.total_counts, summary.alarm_ticks
    );
    Ok(())
}
