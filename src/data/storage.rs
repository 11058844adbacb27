//! Measurement file writer.
//!
//! Live runs are written as a tab-separated text file with a fixed 38-line
//! header. The offline analyzer depends on the exact layout:
//!
//! | line  | content                                        |
//! |-------|------------------------------------------------|
//! | 0     | title                                          |
//! | 2-10  | port, software, model, ID, cell, wavelength... |
//! | 11    | noise block title                              |
//! | 12-27 | one line per noise calibration pair            |
//! | 28    | serial delay                                   |
//! | 29    | flow rate (`... <value> mL/min`)               |
//! | 30    | start date and time                            |
//! | 33,36 | separators                                     |
//! | 35    | column header                                  |
//! | 38..  | data rows                                      |
//!
//! Data columns land at 0 (index), 2 (duration), 6 (laser voltage),
//! 12 (buffer voltage) and 16 + 2k (channel k).

use crate::config::StorageConfig;
use crate::core::{MeasurementRow, RowSink, RunHeader};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local, Timelike};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// First line of every measurement file.
pub const FILE_TITLE: &str = "ABAKUS LASER SENSOR ----- PARTICLE SIZE DISTRIBUTION DATA";

/// Header lines preceding the first data row.
pub const HEADER_LINES: usize = 38;

/// Column of channel 0; channel k is at `FIRST_CHANNEL_COLUMN + 2k`.
pub const FIRST_CHANNEL_COLUMN: usize = 16;

const SEPARATOR_WIDTH: usize = 337;
const NOISE_INDENT: &str = "\t\t\t\t\t\t\t\t\t\t\t\t";

/// Start time as written in the header, e.g. `19-10-2026_14-03-12.25`.
pub fn format_start_time(time: &DateTime<Local>) -> String {
    format!(
        "{}.{:02}",
        time.format("%d-%m-%Y_%H-%M-%S"),
        time.nanosecond() / 10_000_000 % 100
    )
}

/// [`RowSink`] writing the measurement text format.
pub struct MeasurementFileWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    rows: usize,
}

impl MeasurementFileWriter {
    /// Create (truncate) `path`, creating parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        log::info!("Saving data in '{}'", path.display());
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            rows: 0,
        })
    }

    /// File under `<output_dir>/<dd-mm-YYYY>/<stem>_<HH-MM-SS>.txt`.
    pub fn in_output_dir(storage: &StorageConfig, started: &DateTime<Local>) -> AppResult<Self> {
        let path = storage
            .output_dir
            .join(started.format("%d-%m-%Y").to_string())
            .join(format!(
                "{}_{}.txt",
                storage.file_stem,
                started.format("%H-%M-%S")
            ));
        Self::create(path)
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    fn writer(&mut self) -> AppResult<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| DaqError::Processing(format!("'{}' already closed", self.path.display())))
    }
}

impl RowSink for MeasurementFileWriter {
    fn begin(&mut self, header: &RunHeader) -> AppResult<()> {
        let separator = "_".repeat(SEPARATOR_WIDTH);
        let inst = &header.instrument;
        let w = self.writer()?;

        writeln!(w, "{}", FILE_TITLE)?;
        write!(w, "\nSerial port connected:\t\t\t\t\t\t\t{}", header.port)?;
        write!(w, "\nAbakus sofware version:\t\t\t\t\t\t\t{}", header.software)?;
        write!(w, "\nAbakus model:\t\t\t\t\t\t\t\t\t{}", inst.model)?;
        write!(w, "\nAbakus ID number:\t\t\t\t\t\t\t\t{}", inst.id_number)?;
        write!(
            w,
            "\nAbakus cell dimensions:\t\t\t\t\t\t\t{} x {} μm^2",
            inst.cell_x_um, inst.cell_y_um
        )?;
        write!(w, "\nAbakus cell material:\t\t\t\t\t\t\t{}", inst.cell_material)?;
        write!(w, "\nAbakus laser wavelength:\t\t\t\t\t\t{:.3} μm", inst.wavelength_um)?;
        write!(w, "\nAbakus laser waist:\t\t\t\t\t\t\t\t{} μm", inst.laser_waist_um)?;
        write!(w, "\nDetectable size range:\t\t\t\t\t\t\t{} μm", inst.size_range)?;
        writeln!(w, "\nNoise levels and calibration:")?;
        for (i, level) in header.noise.iter().enumerate() {
            writeln!(
                w,
                "{}{}) {:?} μm\t--->\t{:?}",
                NOISE_INDENT,
                i + 1,
                level.diameter_um,
                level.millivolts
            )?;
        }
        // Keep the data rows at a fixed line even with a short noise block
        for _ in header.noise.len()..16 {
            writeln!(w)?;
        }
        write!(
            w,
            "Delay time between serial writing and reading:\t{} ms",
            header.delay_ms
        )?;
        write!(w, "\nFlow rate:\t\t\t\t\t\t\t\t\t\t{:?} mL/min", header.flow_rate_ml_min)?;
        write!(
            w,
            "\nDate and starting time:\t\t\t\t\t\t\t{}\n\n",
            format_start_time(&header.started)
        )?;
        write!(w, "\n{}", separator)?;
        write!(
            w,
            "\n\nIndex\tDuration [s]\tLaser diode voltage[mV]\t\tRAM-buffer voltage [mV]\t\t"
        )?;
        for channel in &header.channels {
            write!(w, "{:?}\t\t", channel)?;
        }
        write!(w, "\n{}\n", separator)?;
        w.flush()?;
        Ok(())
    }

    fn write_row(&mut self, row: &MeasurementRow) -> AppResult<()> {
        let w = self.writer()?;
        write!(
            w,
            "\n{}\t\t{:.6}\t\t\t\t{:?}\t\t\t\t\t\t{:?}\t\t\t\t",
            row.index, row.duration_s, row.laser_voltage, row.buffer_voltage
        )?;
        for count in &row.counts {
            write!(w, "{:?}\t\t", count)?;
        }
        w.flush()?;
        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            log::info!(
                "Measurement file '{}' closed after {} rows",
                self.path.display(),
                self.rows
            );
        }
        Ok(())
    }
}
